pub mod auth_code;
pub mod client;
pub mod device_code;
pub mod follower_invite;
pub mod grant;
pub mod job_execution;
pub mod local_user;
pub mod property;
pub mod refresh_token;
pub mod role;
pub mod subject;
pub mod subject_role;

pub use auth_code::Entity as AuthCode;
pub use client::Entity as Client;
pub use device_code::Entity as DeviceCode;
pub use follower_invite::Entity as FollowerInvite;
pub use grant::Entity as Grant;
pub use job_execution::Entity as JobExecution;
pub use local_user::Entity as LocalUser;
pub use property::Entity as Property;
pub use refresh_token::Entity as RefreshToken;
pub use role::Entity as Role;
pub use subject::Entity as Subject;
pub use subject_role::Entity as SubjectRole;
