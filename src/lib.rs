//! Nightgate - OAuth2 authorization server for Nightscout-compatible data services.
//!
//! Subjects, roles and permissions; PKCE authorization codes and device codes; refresh token
//! rotation with reuse detection; local password accounts; follower invites.
//! All modules are public so integration tests can drive the services directly.

pub mod audit;
pub mod auth_code_flow;
pub mod clients;
pub mod device_flow;
pub mod email;
pub mod entities;
pub mod errors;
pub mod followers;
pub mod grants;
pub mod jobs;
pub mod jwks;
pub mod local_identity;
pub mod notifications;
pub mod oidc_discovery;
pub mod password;
pub mod revocation;
pub mod roles;
pub mod settings;
pub mod storage;
pub mod subjects;
pub mod token_codec;
pub mod token_exchange;
pub mod web;
