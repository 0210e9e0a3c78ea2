use crate::entities::client;
use crate::errors::GateError;
use crate::storage;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set, SqlErr,
};
use thiserror::Error;
use url::Url;

/// First-party uploader and viewer apps recognized by client id.
const KNOWN_APPS: &[(&str, &str)] = &[
    ("xdrip", "xDrip+"),
    ("aaps", "AndroidAPS"),
    ("loop", "Loop"),
    ("trio", "Trio"),
    ("spike", "Spike"),
    ("nightwatch", "Nightwatch"),
    ("nightscout-web", "Nightscout Web"),
];

const EMPTY_LIST: &str = "[]";

#[derive(Debug, Error)]
pub enum RedirectUriError {
    #[error("redirect URI is not a valid absolute URL")]
    InvalidUri,
    #[error("redirect URI must use https, or http on a loopback host")]
    DisallowedScheme,
    #[error("redirect URI does not match the URI registered for this client")]
    Mismatch,
    #[error(transparent)]
    Internal(#[from] GateError),
}

impl RedirectUriError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_redirect_uri",
            Self::DisallowedScheme => "redirect_uri_scheme_not_allowed",
            Self::Mismatch => "redirect_uri_mismatch",
            Self::Internal(_) => "server_error",
        }
    }
}

pub fn normalize_client_id(client_id: &str) -> String {
    client_id.trim().to_lowercase()
}

fn known_app(client_id: &str) -> Option<&'static str> {
    KNOWN_APPS
        .iter()
        .find(|(id, _)| *id == client_id)
        .map(|(_, name)| *name)
}

pub fn redirect_uris(model: &client::Model) -> Result<Vec<String>, GateError> {
    storage::decode_list(&model.redirect_uris)
}

pub async fn get_client<C: ConnectionTrait>(
    db: &C,
    client_id: &str,
) -> Result<Option<client::Model>, GateError> {
    Ok(client::Entity::find_by_id(normalize_client_id(client_id))
        .one(db)
        .await?)
}

/// Case-insensitive lookup that creates the client record on first sight.
pub async fn find_or_create<C: ConnectionTrait>(
    db: &C,
    client_id: &str,
) -> Result<client::Model, GateError> {
    let id = normalize_client_id(client_id);
    if id.is_empty() {
        return Err(GateError::Validation("client_id must not be empty".into()));
    }
    if let Some(existing) = client::Entity::find_by_id(id.clone()).one(db).await? {
        return Ok(existing);
    }

    let display_name = known_app(&id);
    let created = client::ActiveModel {
        client_id: Set(id.clone()),
        display_name: Set(display_name.map(str::to_string)),
        is_known: Set(display_name.is_some()),
        redirect_uris: Set(EMPTY_LIST.to_string()),
        created_at: Set(storage::now()),
    }
    .insert(db)
    .await;

    match created {
        Ok(model) => {
            tracing::info!(client_id = %model.client_id, known = model.is_known, "Registered new client");
            Ok(model)
        }
        Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
            client::Entity::find_by_id(id)
                .one(db)
                .await?
                .ok_or(GateError::Db(e))
        }
        Err(e) => Err(e.into()),
    }
}

/// `Ok(true)` for https with a host, or http on localhost / a loopback address.
fn is_acceptable_redirect(uri: &str) -> Result<bool, GateError> {
    let url = Url::parse(uri).map_err(|_| GateError::Validation(format!("invalid URI {uri}")))?;
    if url.fragment().is_some() {
        return Err(GateError::Validation(format!("URI {uri} has a fragment")));
    }
    Ok(match url.scheme() {
        "https" => url.host_str().is_some(),
        "http" => matches!(
            url.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("[::1]")
        ),
        _ => false,
    })
}

/// Trust-on-first-use redirect check. A client without URIs accepts the first acceptable one
/// and pins it; afterwards only an exact match is accepted.
pub async fn validate_redirect_uri<C: ConnectionTrait>(
    db: &C,
    client_id: &str,
    uri: &str,
) -> Result<(), RedirectUriError> {
    let client = find_or_create(db, client_id).await?;
    let pinned = redirect_uris(&client)?;

    if !pinned.is_empty() {
        return if pinned.iter().any(|p| p == uri) {
            Ok(())
        } else {
            Err(RedirectUriError::Mismatch)
        };
    }

    match is_acceptable_redirect(uri) {
        Ok(true) => {}
        Ok(false) => return Err(RedirectUriError::DisallowedScheme),
        Err(_) => return Err(RedirectUriError::InvalidUri),
    }

    // Pin only if still unpinned; a concurrent first use may have won.
    let pinned_now = client::Entity::update_many()
        .col_expr(
            client::Column::RedirectUris,
            Expr::value(storage::encode_list(&[uri.to_string()])?),
        )
        .filter(client::Column::ClientId.eq(client.client_id.clone()))
        .filter(client::Column::RedirectUris.eq(EMPTY_LIST))
        .exec(db)
        .await
        .map_err(GateError::from)?;

    if pinned_now.rows_affected == 1 {
        tracing::info!(client_id = %client.client_id, redirect_uri = %uri, "Pinned redirect URI");
        return Ok(());
    }

    let current = get_client(db, &client.client_id)
        .await?
        .map(|c| redirect_uris(&c))
        .transpose()?
        .unwrap_or_default();
    if current.iter().any(|p| p == uri) {
        Ok(())
    } else {
        Err(RedirectUriError::Mismatch)
    }
}
