use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LocalUsers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LocalUsers::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LocalUsers::SubjectId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(LocalUsers::Email)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string(LocalUsers::PasswordHash))
                    .col(
                        ColumnDef::new(LocalUsers::EmailVerified)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(string_null(LocalUsers::VerificationTokenHash))
                    .col(big_integer_null(LocalUsers::VerificationTokenExpiresAt))
                    .col(string_null(LocalUsers::ResetTokenHash))
                    .col(big_integer_null(LocalUsers::ResetTokenExpiresAt))
                    .col(
                        ColumnDef::new(LocalUsers::FailedAttempts)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(LocalUsers::LockoutCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer_null(LocalUsers::LockedUntil))
                    .col(
                        ColumnDef::new(LocalUsers::IsActive)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(LocalUsers::PendingApproval)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(LocalUsers::MustChangePassword)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(big_integer(LocalUsers::CreatedAt))
                    .col(big_integer_null(LocalUsers::PasswordChangedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_local_users_subject")
                            .from(LocalUsers::Table, LocalUsers::SubjectId)
                            .to(Subjects::Table, Subjects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_local_users_reset_token")
                    .table(LocalUsers::Table)
                    .col(LocalUsers::ResetTokenHash)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_local_users_verification_token")
                    .table(LocalUsers::Table)
                    .col(LocalUsers::VerificationTokenHash)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LocalUsers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum LocalUsers {
    Table,
    Id,
    SubjectId,
    Email,
    PasswordHash,
    EmailVerified,
    VerificationTokenHash,
    VerificationTokenExpiresAt,
    ResetTokenHash,
    ResetTokenExpiresAt,
    FailedAttempts,
    LockoutCount,
    LockedUntil,
    IsActive,
    PendingApproval,
    MustChangePassword,
    CreatedAt,
    PasswordChangedAt,
}

#[derive(DeriveIden)]
enum Subjects {
    Table,
    Id,
}
