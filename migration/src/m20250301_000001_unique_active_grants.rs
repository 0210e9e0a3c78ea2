use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

// Partial indexes: a revoked grant never blocks a new one.
const UP: [&str; 2] = [
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_grants_active_app \
     ON grants (client_id, subject_id) \
     WHERE revoked_at IS NULL AND grant_type = 'app'",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_grants_active_follower \
     ON grants (subject_id, follower_subject_id) \
     WHERE revoked_at IS NULL AND grant_type = 'follower'",
];

const DOWN: [&str; 2] = [
    "DROP INDEX IF EXISTS idx_grants_active_app",
    "DROP INDEX IF EXISTS idx_grants_active_follower",
];

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        for sql in UP {
            db.execute_unprepared(sql).await?;
        }
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        for sql in DOWN {
            db.execute_unprepared(sql).await?;
        }
        Ok(())
    }
}
