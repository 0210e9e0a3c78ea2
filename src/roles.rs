use crate::entities::role;
use crate::errors::GateError;
use crate::storage;
use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};

pub const ADMIN_ROLE: &str = "admin";
pub const READABLE_ROLE: &str = "readable";
pub const CAREPORTAL_ROLE: &str = "careportal";
pub const DEVICESTATUS_UPLOAD_ROLE: &str = "devicestatus-upload";
pub const DENIED_ROLE: &str = "denied";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub permissions: Vec<String>,
    pub is_system: bool,
    pub created_at: i64,
}

impl TryFrom<role::Model> for Role {
    type Error = GateError;

    fn try_from(model: role::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            permissions: storage::decode_list(&model.permissions)?,
            id: model.id,
            name: model.name,
            description: model.description,
            is_system: model.is_system,
            created_at: model.created_at,
        })
    }
}

/// A role the system guarantees to exist.
#[derive(Debug, Clone)]
pub struct RoleDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub permissions: &'static [&'static str],
}

pub fn default_roles() -> Vec<RoleDefinition> {
    vec![
        RoleDefinition {
            name: ADMIN_ROLE,
            description: "Full access to everything",
            permissions: &["*"],
        },
        RoleDefinition {
            name: READABLE_ROLE,
            description: "Read access to all data",
            permissions: &["*:*:read"],
        },
        RoleDefinition {
            name: CAREPORTAL_ROLE,
            description: "May record treatments",
            permissions: &["api:treatments:create"],
        },
        RoleDefinition {
            name: DEVICESTATUS_UPLOAD_ROLE,
            description: "May upload device status",
            permissions: &["api:devicestatus:create"],
        },
        RoleDefinition {
            name: DENIED_ROLE,
            description: "No access",
            permissions: &[],
        },
    ]
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Result<Option<Role>, GateError>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Role>, GateError>;
    async fn list(&self) -> Result<Vec<Role>, GateError>;
    async fn create(
        &self,
        name: &str,
        description: Option<&str>,
        permissions: &[String],
        is_system: bool,
    ) -> Result<Role, GateError>;
    /// Allowed for every role, system roles included.
    async fn update_permissions(&self, id: &str, permissions: &[String]) -> Result<Role, GateError>;
    /// Rejected for system roles.
    async fn rename(&self, id: &str, new_name: &str) -> Result<Role, GateError>;
    /// Rejected for system roles.
    async fn delete(&self, id: &str) -> Result<(), GateError>;
}

#[derive(Clone)]
pub struct DbRoleRepository {
    db: DatabaseConnection,
}

impl DbRoleRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn load(&self, id: &str) -> Result<role::Model, GateError> {
        role::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| GateError::NotFound(format!("role {id}")))
    }
}

#[async_trait]
impl RoleRepository for DbRoleRepository {
    async fn find_by_name(&self, name: &str) -> Result<Option<Role>, GateError> {
        role::Entity::find()
            .filter(role::Column::Name.eq(name))
            .one(&self.db)
            .await?
            .map(Role::try_from)
            .transpose()
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Role>, GateError> {
        role::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .map(Role::try_from)
            .transpose()
    }

    async fn list(&self) -> Result<Vec<Role>, GateError> {
        role::Entity::find()
            .order_by_asc(role::Column::Name)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Role::try_from)
            .collect()
    }

    async fn create(
        &self,
        name: &str,
        description: Option<&str>,
        permissions: &[String],
        is_system: bool,
    ) -> Result<Role, GateError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GateError::Validation("role name must not be empty".into()));
        }
        if self.find_by_name(name).await?.is_some() {
            return Err(GateError::Conflict(format!("role {name} already exists")));
        }

        let model = role::ActiveModel {
            id: Set(storage::new_id()),
            name: Set(name.to_string()),
            description: Set(description.map(str::to_string)),
            permissions: Set(storage::encode_list(permissions)?),
            is_system: Set(is_system),
            created_at: Set(storage::now()),
        }
        .insert(&self.db)
        .await?;

        Role::try_from(model)
    }

    async fn update_permissions(&self, id: &str, permissions: &[String]) -> Result<Role, GateError> {
        let mut active = self.load(id).await?.into_active_model();
        active.permissions = Set(storage::encode_list(permissions)?);
        Role::try_from(active.update(&self.db).await?)
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<Role, GateError> {
        let existing = self.load(id).await?;
        if existing.is_system {
            return Err(GateError::Validation(format!(
                "system role {} cannot be renamed",
                existing.name
            )));
        }
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(GateError::Validation("role name must not be empty".into()));
        }
        if let Some(other) = self.find_by_name(new_name).await? {
            if other.id != existing.id {
                return Err(GateError::Conflict(format!("role {new_name} already exists")));
            }
        }
        let mut active = existing.into_active_model();
        active.name = Set(new_name.to_string());
        Role::try_from(active.update(&self.db).await?)
    }

    async fn delete(&self, id: &str) -> Result<(), GateError> {
        let existing = self.load(id).await?;
        if existing.is_system {
            return Err(GateError::Validation(format!(
                "system role {} cannot be deleted",
                existing.name
            )));
        }
        role::Entity::delete_by_id(existing.id).exec(&self.db).await?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
}

/// Reconcile the default roles: create missing ones, refresh permissions of system roles.
/// Safe to run on every start.
pub async fn seed_default_roles(repo: &dyn RoleRepository) -> Result<SeedReport, GateError> {
    let mut report = SeedReport::default();

    for def in default_roles() {
        let permissions: Vec<String> = def.permissions.iter().map(|p| p.to_string()).collect();
        match repo.find_by_name(def.name).await? {
            None => {
                repo.create(def.name, Some(def.description), &permissions, true)
                    .await?;
                report.created.push(def.name.to_string());
            }
            Some(existing) if existing.is_system && existing.permissions != permissions => {
                repo.update_permissions(&existing.id, &permissions).await?;
                report.updated.push(def.name.to_string());
            }
            Some(_) => {}
        }
    }

    if !report.created.is_empty() || !report.updated.is_empty() {
        tracing::info!(
            created = ?report.created,
            updated = ?report.updated,
            "Reconciled default roles"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn repo() -> (DbRoleRepository, NamedTempFile) {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let cfg = crate::settings::Database {
            url: format!("sqlite://{}?mode=rwc", temp_file.path().display()),
        };
        let db = storage::init(&cfg).await.expect("db");
        (DbRoleRepository::new(db), temp_file)
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let (repo, _f) = repo().await;

        let first = seed_default_roles(&repo).await.unwrap();
        assert_eq!(first.created.len(), 5);

        let second = seed_default_roles(&repo).await.unwrap();
        assert!(second.created.is_empty());
        assert!(second.updated.is_empty());

        let admin = repo.find_by_name(ADMIN_ROLE).await.unwrap().unwrap();
        assert!(admin.is_system);
        assert_eq!(admin.permissions, vec!["*"]);
    }

    #[tokio::test]
    async fn test_seed_restores_drifted_system_permissions() {
        let (repo, _f) = repo().await;
        seed_default_roles(&repo).await.unwrap();

        let readable = repo.find_by_name(READABLE_ROLE).await.unwrap().unwrap();
        repo.update_permissions(&readable.id, &["api:entries:read".to_string()])
            .await
            .unwrap();

        let report = seed_default_roles(&repo).await.unwrap();
        assert_eq!(report.updated, vec![READABLE_ROLE.to_string()]);
        let readable = repo.find_by_name(READABLE_ROLE).await.unwrap().unwrap();
        assert_eq!(readable.permissions, vec!["*:*:read"]);
    }

    #[tokio::test]
    async fn test_system_roles_cannot_be_renamed_or_deleted() {
        let (repo, _f) = repo().await;
        seed_default_roles(&repo).await.unwrap();
        let admin = repo.find_by_name(ADMIN_ROLE).await.unwrap().unwrap();

        assert!(matches!(
            repo.rename(&admin.id, "root").await,
            Err(GateError::Validation(_))
        ));
        assert!(matches!(
            repo.delete(&admin.id).await,
            Err(GateError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_role_lifecycle() {
        let (repo, _f) = repo().await;

        let role = repo
            .create("nurse", None, &["api:treatments:*".to_string()], false)
            .await
            .unwrap();
        assert!(matches!(
            repo.create("nurse", None, &[], false).await,
            Err(GateError::Conflict(_))
        ));

        let renamed = repo.rename(&role.id, "school-nurse").await.unwrap();
        assert_eq!(renamed.name, "school-nurse");
        assert_eq!(renamed.permissions, vec!["api:treatments:*"]);

        repo.delete(&role.id).await.unwrap();
        assert!(repo.find_by_id(&role.id).await.unwrap().is_none());
    }
}
