use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FollowerInvites::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FollowerInvites::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(FollowerInvites::OwnerSubjectId))
                    .col(
                        ColumnDef::new(FollowerInvites::TokenHash)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string(FollowerInvites::Scopes))
                    .col(string_null(FollowerInvites::Label))
                    .col(big_integer_null(FollowerInvites::ExpiresAt))
                    .col(big_integer_null(FollowerInvites::MaxUses))
                    .col(
                        ColumnDef::new(FollowerInvites::UseCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer_null(FollowerInvites::RevokedAt))
                    .col(
                        ColumnDef::new(FollowerInvites::LimitTo24Hours)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(big_integer(FollowerInvites::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_follower_invites_owner")
                    .table(FollowerInvites::Table)
                    .col(FollowerInvites::OwnerSubjectId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FollowerInvites::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum FollowerInvites {
    Table,
    Id,
    OwnerSubjectId,
    TokenHash,
    Scopes,
    Label,
    ExpiresAt,
    MaxUses,
    UseCount,
    RevokedAt,
    #[sea_orm(iden = "limit_to_24_hours")]
    LimitTo24Hours,
    CreatedAt,
}
