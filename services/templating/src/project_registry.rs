use crate::config::DatabaseConfig;
use crate::object_store::{archive_key, context_key};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors reported by a project registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Project registry query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for RegistryError {
    fn from(e: sqlx::Error) -> Self {
        RegistryError::Query(e.to_string())
    }
}

/// Project metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Project {
    /// Project ID, also the archive's object-store key
    pub id: i64,
    /// Owning user
    pub user_id: i64,
    pub project_name: String,
    pub description: String,
    pub project_type: String,
    pub status: String,
    /// Name of the archive as uploaded
    pub file_name: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Object-store key of the template archive
    pub fn storage_key(&self) -> String {
        archive_key(self.id)
    }

    /// Object-store key of the uploaded context blob
    pub fn context_key(&self) -> String {
        context_key(self.id)
    }
}

/// Fields of a project row about to be created
#[derive(Debug, Clone, PartialEq)]
pub struct NewProject {
    pub user_id: i64,
    pub project_name: String,
    pub description: String,
    pub project_type: String,
    pub status: String,
    pub file_name: String,
}

/// Relational lookup of project metadata
#[async_trait]
pub trait ProjectRegistry: Send + Sync {
    /// Look up a project by ID
    async fn get_by_id(&self, id: i64) -> Result<Option<Project>, RegistryError>;

    /// Resolve a user's ID from their email
    async fn find_user_id(&self, email: &str) -> Result<Option<i64>, RegistryError>;

    /// Projects owned by a user, in creation order
    async fn list_by_owner(&self, user_id: i64) -> Result<Vec<Project>, RegistryError>;

    /// Insert a project row and return it with its assigned ID
    async fn create(&self, project: NewProject) -> Result<Project, RegistryError>;

    /// Every project, in creation order
    async fn list_all(&self) -> Result<Vec<Project>, RegistryError>;

    /// Check connectivity for readiness probes
    async fn ping(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}

/// PostgreSQL-backed registry over the platform's existing schema
pub struct PgProjectRegistry {
    pool: PgPool,
}

impl PgProjectRegistry {
    /// Create a new registry with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }
}

#[async_trait]
impl ProjectRegistry for PgProjectRegistry {
    #[instrument(skip(self))]
    async fn get_by_id(&self, id: i64) -> Result<Option<Project>, RegistryError> {
        let project = sqlx::query_as::<_, Project>(
            r#"
            SELECT id::bigint AS id, user_id::bigint AS user_id, project_name,
                   description, project_type, status, file_name, created_at
            FROM api_client_project
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        debug!(project_id = id, found = project.is_some(), "Project lookup");

        Ok(project)
    }

    #[instrument(skip(self))]
    async fn find_user_id(&self, email: &str) -> Result<Option<i64>, RegistryError> {
        let user_id = sqlx::query_scalar::<_, i64>(
            "SELECT id::bigint FROM auth_user WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user_id)
    }

    #[instrument(skip(self))]
    async fn list_by_owner(&self, user_id: i64) -> Result<Vec<Project>, RegistryError> {
        let projects = sqlx::query_as::<_, Project>(
            r#"
            SELECT id::bigint AS id, user_id::bigint AS user_id, project_name,
                   description, project_type, status, file_name, created_at
            FROM api_client_project
            WHERE user_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(projects)
    }

    #[instrument(skip(self, project), fields(user_id = project.user_id))]
    async fn create(&self, project: NewProject) -> Result<Project, RegistryError> {
        // file_id is a legacy column; the row ID is the storage key
        let created = sqlx::query_as::<_, Project>(
            r#"
            INSERT INTO api_client_project
                (user_id, project_name, description, project_type, status, file_name, file_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, '', NOW())
            RETURNING id::bigint AS id, user_id::bigint AS user_id, project_name,
                      description, project_type, status, file_name, created_at
            "#,
        )
        .bind(project.user_id)
        .bind(&project.project_name)
        .bind(&project.description)
        .bind(&project.project_type)
        .bind(&project.status)
        .bind(&project.file_name)
        .fetch_one(&self.pool)
        .await?;

        info!(project_id = created.id, "Project created");

        Ok(created)
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<Project>, RegistryError> {
        let projects = sqlx::query_as::<_, Project>(
            r#"
            SELECT id::bigint AS id, user_id::bigint AS user_id, project_name,
                   description, project_type, status, file_name, created_at
            FROM api_client_project
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(projects)
    }

    async fn ping(&self) -> Result<(), RegistryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-memory registry for tests and local runs
#[derive(Debug, Default)]
pub struct MemoryProjectRegistry {
    projects: RwLock<Vec<Project>>,
    owners: RwLock<HashMap<i64, String>>,
}

impl MemoryProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user so their projects can be listed by email
    pub fn add_owner(&self, user_id: i64, email: impl Into<String>) {
        if let Ok(mut owners) = self.owners.write() {
            owners.insert(user_id, email.into());
        }
    }

    /// Add a project; insertion order is creation order
    pub fn insert(&self, project: Project) {
        if let Ok(mut projects) = self.projects.write() {
            projects.push(project);
        }
    }

    fn poisoned<T>(_: T) -> RegistryError {
        RegistryError::Query("lock poisoned".to_string())
    }

    fn snapshot(&self) -> Result<Vec<Project>, RegistryError> {
        self.projects
            .read()
            .map(|p| p.clone())
            .map_err(Self::poisoned)
    }
}

#[async_trait]
impl ProjectRegistry for MemoryProjectRegistry {
    async fn get_by_id(&self, id: i64) -> Result<Option<Project>, RegistryError> {
        Ok(self.snapshot()?.into_iter().find(|p| p.id == id))
    }

    async fn find_user_id(&self, email: &str) -> Result<Option<i64>, RegistryError> {
        let owners = self.owners.read().map_err(Self::poisoned)?;

        Ok(owners
            .iter()
            .find(|(_, e)| e.as_str() == email)
            .map(|(id, _)| *id))
    }

    async fn list_by_owner(&self, user_id: i64) -> Result<Vec<Project>, RegistryError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|p| p.user_id == user_id)
            .collect())
    }

    async fn create(&self, project: NewProject) -> Result<Project, RegistryError> {
        let mut projects = self.projects.write().map_err(Self::poisoned)?;

        let id = projects.iter().map(|p| p.id).max().unwrap_or(0) + 1;
        let created = Project {
            id,
            user_id: project.user_id,
            project_name: project.project_name,
            description: project.description,
            project_type: project.project_type,
            status: project.status,
            file_name: project.file_name,
            created_at: Utc::now(),
        };

        projects.push(created.clone());
        Ok(created)
    }

    async fn list_all(&self) -> Result<Vec<Project>, RegistryError> {
        self.snapshot()
    }
}
