use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Create subjects table
        manager
            .create_table(
                Table::create()
                    .table(Subjects::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Subjects::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Subjects::Name))
                    .col(string_null(Subjects::Email))
                    .col(string_null(Subjects::ExternalIssuer))
                    .col(string_null(Subjects::ExternalSubjectId))
                    .col(string_null(Subjects::AccessTokenHash))
                    .col(
                        ColumnDef::new(Subjects::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Subjects::IsSystem)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(big_integer(Subjects::CreatedAt))
                    .col(big_integer_null(Subjects::LastLoginAt))
                    .to_owned(),
            )
            .await?;

        // One subject per external identity
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_subjects_external_identity")
                    .table(Subjects::Table)
                    .col(Subjects::ExternalIssuer)
                    .col(Subjects::ExternalSubjectId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_subjects_access_token_hash")
                    .table(Subjects::Table)
                    .col(Subjects::AccessTokenHash)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create roles table
        manager
            .create_table(
                Table::create()
                    .table(Roles::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Roles::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Roles::Name)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string_null(Roles::Description))
                    .col(string(Roles::Permissions))
                    .col(
                        ColumnDef::new(Roles::IsSystem)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(big_integer(Roles::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Create subject_roles join table
        manager
            .create_table(
                Table::create()
                    .table(SubjectRoles::Table)
                    .if_not_exists()
                    .col(string(SubjectRoles::SubjectId))
                    .col(string(SubjectRoles::RoleId))
                    .col(big_integer(SubjectRoles::AssignedAt))
                    .primary_key(
                        Index::create()
                            .col(SubjectRoles::SubjectId)
                            .col(SubjectRoles::RoleId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_subject_roles_subject")
                            .from(SubjectRoles::Table, SubjectRoles::SubjectId)
                            .to(Subjects::Table, Subjects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_subject_roles_role")
                            .from(SubjectRoles::Table, SubjectRoles::RoleId)
                            .to(Roles::Table, Roles::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create clients table
        manager
            .create_table(
                Table::create()
                    .table(Clients::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Clients::ClientId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string_null(Clients::DisplayName))
                    .col(
                        ColumnDef::new(Clients::IsKnown)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(string(Clients::RedirectUris))
                    .col(big_integer(Clients::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Create properties table
        manager
            .create_table(
                Table::create()
                    .table(Properties::Table)
                    .if_not_exists()
                    .col(string(Properties::Owner))
                    .col(string(Properties::Key))
                    .col(string(Properties::Value))
                    .col(big_integer(Properties::UpdatedAt))
                    .primary_key(Index::create().col(Properties::Owner).col(Properties::Key))
                    .to_owned(),
            )
            .await?;

        // Create job_executions table with backend-specific ID type
        let id_col = match manager.get_database_backend() {
            sea_orm::DatabaseBackend::Postgres => ColumnDef::new(JobExecutions::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
            _ => ColumnDef::new(JobExecutions::Id)
                .integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
        };

        manager
            .create_table(
                Table::create()
                    .table(JobExecutions::Table)
                    .if_not_exists()
                    .col(id_col)
                    .col(string(JobExecutions::JobName))
                    .col(big_integer(JobExecutions::StartedAt))
                    .col(big_integer_null(JobExecutions::CompletedAt))
                    .col(big_integer_null(JobExecutions::Success))
                    .col(string_null(JobExecutions::ErrorMessage))
                    .col(big_integer_null(JobExecutions::RecordsProcessed))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_job_executions_started")
                    .table(JobExecutions::Table)
                    .col(JobExecutions::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobExecutions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Properties::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Clients::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SubjectRoles::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Roles::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Subjects::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Subjects {
    Table,
    Id,
    Name,
    Email,
    ExternalIssuer,
    ExternalSubjectId,
    AccessTokenHash,
    IsActive,
    IsSystem,
    CreatedAt,
    LastLoginAt,
}

#[derive(DeriveIden)]
enum Roles {
    Table,
    Id,
    Name,
    Description,
    Permissions,
    IsSystem,
    CreatedAt,
}

#[derive(DeriveIden)]
enum SubjectRoles {
    Table,
    SubjectId,
    RoleId,
    AssignedAt,
}

#[derive(DeriveIden)]
enum Clients {
    Table,
    ClientId,
    DisplayName,
    IsKnown,
    RedirectUris,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Properties {
    Table,
    Owner,
    Key,
    Value,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum JobExecutions {
    Table,
    Id,
    JobName,
    StartedAt,
    CompletedAt,
    Success,
    ErrorMessage,
    RecordsProcessed,
}
