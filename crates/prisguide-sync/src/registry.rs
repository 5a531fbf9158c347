//! Endpoint registry: the only place raw store rows become [`Endpoint`]s.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use prisguide_adapters::parse_provider_file;
use prisguide_core::{
    Category, Endpoint, EndpointKind, EndpointStats, ImportLogEntry, ScrapingConfig,
};
use prisguide_storage::{EndpointRow, Store, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Priority given to endpoints registered from the provider file.
pub const PROVIDER_FILE_PRIORITY: i32 = 100;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("endpoint row {id} is invalid: {message}")]
    InvalidRow { id: Uuid, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid endpoint manifest {path}: {message}")]
    Manifest { path: String, message: String },
}

/// Endpoint definition as written by an admin, before it has an id or statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEndpoint {
    pub name: String,
    pub category: Category,
    pub kind: EndpointKind,
    pub url: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub auth_config: Option<serde_json::Value>,
    #[serde(default)]
    pub scraping_config: Option<ScrapingConfig>,
}

fn default_priority() -> i32 {
    PROVIDER_FILE_PRIORITY
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct EndpointManifest {
    endpoints: Vec<NewEndpoint>,
}

pub fn to_endpoint(row: EndpointRow) -> Result<Endpoint, RegistryError> {
    let id = row.id;
    let invalid = move |message: String| RegistryError::InvalidRow { id, message };

    let category = row
        .category
        .parse::<Category>()
        .map_err(|e| invalid(e.to_string()))?;
    let kind = row.kind.parse::<EndpointKind>().map_err(invalid)?;
    let scraping_config = match &row.scraping_config {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => Some(
            serde_json::from_value::<ScrapingConfig>(value.clone())
                .map_err(|e| invalid(format!("scrapingConfig: {e}")))?,
        ),
    };
    let total_requests = u64::try_from(row.total_requests)
        .map_err(|_| invalid(format!("negative total_requests {}", row.total_requests)))?;
    let failure_count = u64::try_from(row.failure_count)
        .map_err(|_| invalid(format!("negative failure_count {}", row.failure_count)))?;

    Ok(Endpoint {
        id: row.id,
        name: row.name,
        category,
        kind,
        url: row.url,
        priority: row.priority,
        is_active: row.is_active,
        auth_required: row.auth_required,
        auth_config: row.auth_config,
        scraping_config,
        stats: EndpointStats {
            total_requests,
            failure_count,
            success_rate: row.success_rate,
            last_success_at: row.last_success_at,
            last_failure_at: row.last_failure_at,
        },
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn new_row(endpoint: &NewEndpoint, now: DateTime<Utc>) -> Result<EndpointRow, RegistryError> {
    let scraping_config = endpoint
        .scraping_config
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| RegistryError::Manifest {
            path: endpoint.name.clone(),
            message: e.to_string(),
        })?;
    Ok(EndpointRow {
        id: Uuid::new_v4(),
        name: endpoint.name.trim().to_string(),
        category: endpoint.category.as_str().to_string(),
        kind: endpoint.kind.as_str().to_string(),
        url: endpoint.url.trim().to_string(),
        priority: endpoint.priority,
        is_active: endpoint.is_active,
        auth_required: endpoint.auth_required,
        auth_config: endpoint.auth_config.clone(),
        scraping_config,
        total_requests: 0,
        failure_count: 0,
        success_rate: 0.0,
        last_success_at: None,
        last_failure_at: None,
        created_at: now,
        updated_at: now,
    })
}

#[derive(Clone)]
pub struct EndpointRegistry {
    store: Arc<dyn Store>,
}

impl EndpointRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Active endpoints for a category id, lowest priority first.
    ///
    /// An unknown id is `NotFound`; a known category with no endpoints is an empty list.
    pub async fn list_active_endpoints(&self, category: &str) -> Result<Vec<Endpoint>, RegistryError> {
        let category = category
            .parse::<Category>()
            .map_err(|_| RegistryError::NotFound(format!("category {category:?}")))?;
        self.active_endpoints(category).await
    }

    pub async fn active_endpoints(&self, category: Category) -> Result<Vec<Endpoint>, RegistryError> {
        let rows = self.store.list_active_endpoints(category).await?;
        let mut endpoints = Vec::with_capacity(rows.len());
        for row in rows {
            match to_endpoint(row) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(err) => warn!(%category, error = %err, "skipping malformed endpoint row"),
            }
        }
        endpoints.sort_by_key(|e| e.priority);
        Ok(endpoints)
    }

    pub async fn get_endpoint(&self, id: Uuid) -> Result<Endpoint, RegistryError> {
        match self.store.get_endpoint(id).await? {
            Some(row) if row.is_active => to_endpoint(row),
            _ => Err(RegistryError::NotFound(format!("endpoint {id}"))),
        }
    }

    /// One atomic counter update per attempt.
    pub async fn record_attempt(
        &self,
        endpoint_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        self.store
            .update_endpoint_stats(endpoint_id, success, at)
            .await
            .map_err(RegistryError::from)
    }

    /// Returns `false` when the (category, url) pair is already registered.
    pub async fn register_endpoint(&self, endpoint: &NewEndpoint) -> Result<bool, RegistryError> {
        let row = new_row(endpoint, Utc::now())?;
        let inserted = self.store.insert_endpoint(&row).await?;
        info!(
            name = %row.name,
            category = %row.category,
            url = %row.url,
            inserted,
            "endpoint registration"
        );
        Ok(inserted)
    }

    /// Registers one SCRAPING endpoint per valid `category|name|url` line.
    pub async fn register_provider_file(&self, path: &Path) -> Result<ImportLogEntry, RegistryError> {
        let source = path.display().to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RegistryError::Io {
                path: source.clone(),
                source: e,
            })?;
        self.register_provider_text(&source, &text).await
    }

    pub async fn register_provider_text(&self, source: &str, text: &str) -> Result<ImportLogEntry, RegistryError> {
        let parsed = parse_provider_file(text);
        let endpoints = parsed
            .lines
            .into_iter()
            .map(|line| NewEndpoint {
                name: line.name,
                category: line.category,
                kind: EndpointKind::Scraping,
                url: line.url,
                priority: PROVIDER_FILE_PRIORITY,
                is_active: true,
                auth_required: false,
                auth_config: None,
                scraping_config: Some(ScrapingConfig::default()),
            })
            .collect::<Vec<_>>();
        self.register_all(source, &endpoints, parsed.skipped).await
    }

    /// Loads an `endpoints:` YAML manifest of full endpoint definitions.
    pub async fn register_manifest(&self, path: &Path) -> Result<ImportLogEntry, RegistryError> {
        let source = path.display().to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RegistryError::Io {
                path: source.clone(),
                source: e,
            })?;
        let manifest: EndpointManifest =
            serde_yaml::from_str(&text).map_err(|e| RegistryError::Manifest {
                path: source.clone(),
                message: e.to_string(),
            })?;
        self.register_all(&source, &manifest.endpoints, Vec::new()).await
    }

    async fn register_all(
        &self,
        source: &str,
        endpoints: &[NewEndpoint],
        mut errors: Vec<String>,
    ) -> Result<ImportLogEntry, RegistryError> {
        let skipped = errors.len() as u32;
        let mut registered = 0u32;
        let mut already_present = 0u32;

        for endpoint in endpoints {
            match self.register_endpoint(endpoint).await {
                Ok(true) => registered += 1,
                Ok(false) => already_present += 1,
                Err(err) => errors.push(format!("{} ({}): {err}", endpoint.name, endpoint.url)),
            }
        }

        let entry = ImportLogEntry {
            id: Uuid::new_v4(),
            source: source.to_string(),
            registered,
            already_present,
            skipped,
            errors,
            created_at: Utc::now(),
        };
        self.store.insert_import_log(&entry).await?;
        info!(
            source,
            registered,
            already_present,
            skipped,
            "endpoint import finished"
        );
        Ok(entry)
    }
}
