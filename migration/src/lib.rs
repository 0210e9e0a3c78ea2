pub use sea_orm_migration::prelude::*;

mod m20250101_000001_initial_schema;
mod m20250107_000001_add_grants;
mod m20250108_000001_add_authorization_codes;
mod m20250109_000001_add_local_users;
mod m20250222_000001_add_follower_invites;
mod m20250301_000001_unique_active_grants;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_initial_schema::Migration),
            Box::new(m20250107_000001_add_grants::Migration),
            Box::new(m20250108_000001_add_authorization_codes::Migration),
            Box::new(m20250109_000001_add_local_users::Migration),
            Box::new(m20250222_000001_add_follower_invites::Migration),
            Box::new(m20250301_000001_unique_active_grants::Migration),
        ]
    }
}
