use crate::entities;
use crate::errors::GateError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use rand::RngCore;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Connect and bring the schema up to date.
pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, GateError> {
    let db = Database::connect(&cfg.url).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// Row identifier for every table keyed by string id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 256-bit opaque secret, base64url without padding. Used for refresh tokens,
/// device codes, authorization codes, invite tokens and email tokens.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

/// One-way hash under which opaque tokens are stored. Plaintext never reaches the database.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    base64ct::Base64UrlUnpadded::encode_string(&digest)
}

pub fn encode_list(items: &[String]) -> Result<String, GateError> {
    Ok(serde_json::to_string(items)?)
}

pub fn decode_list(raw: &str) -> Result<Vec<String>, GateError> {
    Ok(serde_json::from_str(raw)?)
}

pub async fn get_property<C: ConnectionTrait>(
    db: &C,
    owner: &str,
    key: &str,
) -> Result<Option<Value>, GateError> {
    use entities::property::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::Owner.eq(owner))
        .filter(Column::Key.eq(key))
        .one(db)
        .await?
    {
        let json: Value = serde_json::from_str(&model.value)?;
        Ok(Some(json))
    } else {
        Ok(None)
    }
}

pub async fn set_property<C: ConnectionTrait>(
    db: &C,
    owner: &str,
    key: &str,
    value: &Value,
) -> Result<(), GateError> {
    use entities::property::{Column, Entity};

    let property = entities::property::ActiveModel {
        owner: Set(owner.to_string()),
        key: Set(key.to_string()),
        value: Set(serde_json::to_string(value)?),
        updated_at: Set(now()),
    };

    Entity::insert(property)
        .on_conflict(
            OnConflict::columns([Column::Owner, Column::Key])
                .update_columns([Column::Value, Column::UpdatedAt])
                .to_owned(),
        )
        .exec(db)
        .await?;

    Ok(())
}

/// Insert a property only if absent. Returns true for the single caller that created it,
/// so the (owner, key) primary key doubles as a once-only latch.
pub async fn claim_property<C: ConnectionTrait>(
    db: &C,
    owner: &str,
    key: &str,
    value: &Value,
) -> Result<bool, GateError> {
    use entities::property::{Column, Entity};

    let property = entities::property::ActiveModel {
        owner: Set(owner.to_string()),
        key: Set(key.to_string()),
        value: Set(serde_json::to_string(value)?),
        updated_at: Set(now()),
    };

    let inserted = Entity::insert(property)
        .on_conflict(
            OnConflict::columns([Column::Owner, Column::Key])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(inserted == 1)
}
