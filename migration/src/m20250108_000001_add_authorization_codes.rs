use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Authorization code + PKCE
        manager
            .create_table(
                Table::create()
                    .table(AuthCodes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuthCodes::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AuthCodes::CodeHash)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string(AuthCodes::ClientId))
                    .col(string(AuthCodes::SubjectId))
                    .col(string(AuthCodes::Scopes))
                    .col(string(AuthCodes::RedirectUri))
                    .col(string(AuthCodes::CodeChallenge))
                    .col(string(AuthCodes::CodeChallengeMethod))
                    .col(big_integer(AuthCodes::CreatedAt))
                    .col(big_integer(AuthCodes::ExpiresAt))
                    .col(big_integer_null(AuthCodes::RedeemedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_auth_codes_expires_at")
                    .table(AuthCodes::Table)
                    .col(AuthCodes::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // OAuth 2.0 Device Authorization Grant (RFC 8628)
        manager
            .create_table(
                Table::create()
                    .table(DeviceCodes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceCodes::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(DeviceCodes::DeviceCodeHash)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(DeviceCodes::UserCode)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string(DeviceCodes::ClientId))
                    .col(string(DeviceCodes::Scopes))
                    .col(big_integer(DeviceCodes::CreatedAt))
                    .col(big_integer(DeviceCodes::ExpiresAt))
                    .col(
                        ColumnDef::new(DeviceCodes::Interval)
                            .big_integer()
                            .not_null()
                            .default(5),
                    )
                    .col(big_integer_null(DeviceCodes::LastPollAt))
                    .col(big_integer_null(DeviceCodes::ApprovedAt))
                    .col(big_integer_null(DeviceCodes::DeniedAt))
                    .col(big_integer_null(DeviceCodes::ConsumedAt))
                    .col(string_null(DeviceCodes::SubjectId))
                    .col(string_null(DeviceCodes::GrantId))
                    .to_owned(),
            )
            .await?;

        // Create index on expires_at for efficient cleanup job
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_codes_expires_at")
                    .table(DeviceCodes::Table)
                    .col(DeviceCodes::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeviceCodes::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AuthCodes::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum AuthCodes {
    Table,
    Id,
    CodeHash,
    ClientId,
    SubjectId,
    Scopes,
    RedirectUri,
    CodeChallenge,
    CodeChallengeMethod,
    CreatedAt,
    ExpiresAt,
    RedeemedAt,
}

#[derive(DeriveIden)]
enum DeviceCodes {
    Table,
    Id,
    DeviceCodeHash,
    UserCode,
    ClientId,
    Scopes,
    CreatedAt,
    ExpiresAt,
    Interval,
    LastPollAt,
    ApprovedAt,
    DeniedAt,
    ConsumedAt,
    SubjectId,
    GrantId,
}
