use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "local_users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub subject_id: String,
    #[sea_orm(unique)]
    pub email: String, // normalized: trimmed, lowercase
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub email_verified: bool,
    #[serde(skip_serializing)]
    pub verification_token_hash: Option<String>,
    pub verification_token_expires_at: Option<i64>,
    #[serde(skip_serializing)]
    pub reset_token_hash: Option<String>,
    pub reset_token_expires_at: Option<i64>,
    pub failed_attempts: i64,
    pub lockout_count: i64,
    pub locked_until: Option<i64>,
    pub is_active: bool,
    pub pending_approval: bool,
    pub must_change_password: bool,
    pub created_at: i64,
    pub password_changed_at: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
