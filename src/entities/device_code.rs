use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "device_codes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub device_code_hash: String,
    #[sea_orm(unique)]
    pub user_code: String, // canonical "XXXX-XXXX"
    pub client_id: String,
    pub scopes: String, // JSON-encoded Vec<String>
    pub created_at: i64,
    pub expires_at: i64,
    pub interval: i64,
    pub last_poll_at: Option<i64>,
    pub approved_at: Option<i64>,
    pub denied_at: Option<i64>,
    pub consumed_at: Option<i64>,
    pub subject_id: Option<String>,
    pub grant_id: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
