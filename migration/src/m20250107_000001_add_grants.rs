use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Grants::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Grants::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string_null(Grants::ClientId))
                    .col(string(Grants::SubjectId))
                    .col(string_null(Grants::FollowerSubjectId))
                    .col(string(Grants::GrantType))
                    .col(string(Grants::Scopes))
                    .col(string_null(Grants::Label))
                    .col(
                        ColumnDef::new(Grants::LimitTo24Hours)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(big_integer(Grants::CreatedAt))
                    .col(big_integer_null(Grants::RevokedAt))
                    .col(big_integer_null(Grants::LastUsedAt))
                    .col(string_null(Grants::LastUsedIp))
                    .col(string_null(Grants::LastUsedUserAgent))
                    .to_owned(),
            )
            .await?;

        // Lookup of the active grant for (client, subject)
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_grants_client_subject")
                    .table(Grants::Table)
                    .col(Grants::ClientId)
                    .col(Grants::SubjectId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_grants_follower")
                    .table(Grants::Table)
                    .col(Grants::SubjectId)
                    .col(Grants::FollowerSubjectId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RefreshTokens::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RefreshTokens::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(RefreshTokens::GrantId))
                    .col(
                        ColumnDef::new(RefreshTokens::TokenHash)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(big_integer(RefreshTokens::IssuedAt))
                    .col(big_integer(RefreshTokens::ExpiresAt))
                    .col(big_integer_null(RefreshTokens::RevokedAt))
                    .col(string_null(RefreshTokens::ReplacedBy))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_refresh_tokens_grant")
                            .from(RefreshTokens::Table, RefreshTokens::GrantId)
                            .to(Grants::Table, Grants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_refresh_tokens_grant")
                    .table(RefreshTokens::Table)
                    .col(RefreshTokens::GrantId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_refresh_tokens_expires")
                    .table(RefreshTokens::Table)
                    .col(RefreshTokens::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RefreshTokens::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Grants::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Grants {
    Table,
    Id,
    ClientId,
    SubjectId,
    FollowerSubjectId,
    GrantType,
    Scopes,
    Label,
    #[sea_orm(iden = "limit_to_24_hours")]
    LimitTo24Hours,
    CreatedAt,
    RevokedAt,
    LastUsedAt,
    LastUsedIp,
    LastUsedUserAgent,
}

#[derive(DeriveIden)]
enum RefreshTokens {
    Table,
    Id,
    GrantId,
    TokenHash,
    IssuedAt,
    ExpiresAt,
    RevokedAt,
    ReplacedBy,
}
