//! PostgreSQL-backed [`Store`].
//!
//! Concurrent pipeline runs in separate processes are kept consistent by the
//! unique indexes in `migrations/`, never by in-process locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prisguide_core::{
    name_key, Category, ContentFingerprint, ExecutionLogEntry, ExecutionStatus, ExecutionType,
    FingerprintRecord, ImportLogEntry, StoredProvider,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::{EndpointRow, Store, StoreError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_category(raw: &str) -> Result<Category, StoreError> {
    raw.parse().map_err(|e: prisguide_core::UnknownCategory| StoreError::new(e.to_string()))
}

fn parse_execution_type(raw: &str) -> Result<ExecutionType, StoreError> {
    match raw {
        "manual" => Ok(ExecutionType::Manual),
        "scheduled" => Ok(ExecutionType::Scheduled),
        "fallback" => Ok(ExecutionType::Fallback),
        other => Err(StoreError::new(format!("unknown execution_type {other}"))),
    }
}

fn parse_execution_status(raw: &str) -> Result<ExecutionStatus, StoreError> {
    match raw {
        "success" => Ok(ExecutionStatus::Success),
        "failure" => Ok(ExecutionStatus::Failure),
        "timeout" => Ok(ExecutionStatus::Timeout),
        "error" => Ok(ExecutionStatus::Error),
        other => Err(StoreError::new(format!("unknown execution status {other}"))),
    }
}

fn provider_from_row(row: &PgRow) -> Result<StoredProvider, StoreError> {
    let category: String = row.try_get("category")?;
    let pros: Json<Vec<String>> = row.try_get("pros")?;
    let cons: Json<Vec<String>> = row.try_get("cons")?;
    Ok(StoredProvider {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        category: parse_category(&category)?,
        price: row.try_get("price")?,
        rating: row.try_get("rating")?,
        description: row.try_get("description")?,
        external_url: row.try_get("external_url")?,
        organization_number: row.try_get("organization_number")?,
        logo_url: row.try_get("logo_url")?,
        pros: pros.0,
        cons: cons.0,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        address: row.try_get("address")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn endpoint_from_row(row: &PgRow) -> Result<EndpointRow, StoreError> {
    Ok(EndpointRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        kind: row.try_get("kind")?,
        url: row.try_get("url")?,
        priority: row.try_get("priority")?,
        is_active: row.try_get("is_active")?,
        auth_required: row.try_get("auth_required")?,
        auth_config: row.try_get("auth_config")?,
        scraping_config: row.try_get("scraping_config")?,
        total_requests: row.try_get("total_requests")?,
        failure_count: row.try_get("failure_count")?,
        success_rate: row.try_get("success_rate")?,
        last_success_at: row.try_get("last_success_at")?,
        last_failure_at: row.try_get("last_failure_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn execution_log_from_row(row: &PgRow) -> Result<ExecutionLogEntry, StoreError> {
    let category: String = row.try_get("category")?;
    let execution_type: String = row.try_get("execution_type")?;
    let status: String = row.try_get("status")?;
    let fetched: i32 = row.try_get("providers_fetched")?;
    let saved: i32 = row.try_get("providers_saved")?;
    let duplicates: i32 = row.try_get("duplicates_found")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;
    Ok(ExecutionLogEntry {
        id: row.try_get("id")?,
        endpoint_id: row.try_get("endpoint_id")?,
        category: parse_category(&category)?,
        execution_type: parse_execution_type(&execution_type)?,
        status: parse_execution_status(&status)?,
        providers_fetched: fetched.max(0) as u32,
        providers_saved: saved.max(0) as u32,
        duplicates_found: duplicates.max(0) as u32,
        duration_ms: duration_ms.max(0) as u64,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

const PROVIDER_COLUMNS: &str = "id, name, category, price, rating, description, external_url, \
     organization_number, logo_url, pros, cons, phone, email, address, created_at, updated_at";

const ENDPOINT_COLUMNS: &str = "id, name, category, kind, url, priority, is_active, auth_required, \
     auth_config, scraping_config, total_requests, failure_count, success_rate, last_success_at, \
     last_failure_at, created_at, updated_at";

#[async_trait]
impl Store for PgStore {
    async fn find_provider_by_name_and_category(
        &self,
        name: &str,
        category: Category,
    ) -> Result<Option<StoredProvider>, StoreError> {
        let sql = format!(
            "SELECT {PROVIDER_COLUMNS} FROM providers WHERE category = $1 AND name_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(category.as_str())
            .bind(name_key(name))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(provider_from_row).transpose()
    }

    async fn insert_provider(&self, provider: &StoredProvider) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO providers (
                id, name, name_key, category, price, rating, description, external_url,
                organization_number, logo_url, pros, cons, phone, email, address,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (category, name_key) DO NOTHING
            "#,
        )
        .bind(provider.id)
        .bind(&provider.name)
        .bind(provider.name_key())
        .bind(provider.category.as_str())
        .bind(provider.price)
        .bind(provider.rating)
        .bind(&provider.description)
        .bind(&provider.external_url)
        .bind(&provider.organization_number)
        .bind(&provider.logo_url)
        .bind(Json(&provider.pros))
        .bind(Json(&provider.cons))
        .bind(&provider.phone)
        .bind(&provider.email)
        .bind(&provider.address)
        .bind(provider.created_at)
        .bind(provider.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_provider(&self, provider: &StoredProvider) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE providers
               SET price = $2,
                   rating = $3,
                   description = $4,
                   external_url = $5,
                   organization_number = $6,
                   logo_url = $7,
                   pros = $8,
                   cons = $9,
                   phone = $10,
                   email = $11,
                   address = $12,
                   updated_at = $13
             WHERE id = $1
            "#,
        )
        .bind(provider.id)
        .bind(provider.price)
        .bind(provider.rating)
        .bind(&provider.description)
        .bind(&provider.external_url)
        .bind(&provider.organization_number)
        .bind(&provider.logo_url)
        .bind(Json(&provider.pros))
        .bind(Json(&provider.cons))
        .bind(&provider.phone)
        .bind(&provider.email)
        .bind(&provider.address)
        .bind(provider.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::new(format!("provider {} not found", provider.id)));
        }
        Ok(())
    }

    async fn find_fingerprint(
        &self,
        provider_id: Uuid,
        hash: &ContentFingerprint,
    ) -> Result<Option<FingerprintRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT provider_id, hash, endpoint_id, recorded_at
              FROM provider_fingerprints
             WHERE provider_id = $1 AND hash = $2
            "#,
        )
        .bind(provider_id)
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<FingerprintRecord, StoreError> {
            let hash: String = row.try_get("hash")?;
            Ok(FingerprintRecord {
                provider_id: row.try_get("provider_id")?,
                hash: ContentFingerprint::from_hex(hash),
                endpoint_id: row.try_get("endpoint_id")?,
                recorded_at: row.try_get("recorded_at")?,
            })
        })
        .transpose()
    }

    async fn insert_fingerprint(&self, fingerprint: &FingerprintRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO provider_fingerprints (provider_id, hash, endpoint_id, recorded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider_id, hash) DO NOTHING
            "#,
        )
        .bind(fingerprint.provider_id)
        .bind(fingerprint.hash.as_str())
        .bind(fingerprint.endpoint_id)
        .bind(fingerprint.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_active_endpoints(&self, category: Category) -> Result<Vec<EndpointRow>, StoreError> {
        let sql = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM endpoints \
             WHERE category = $1 AND is_active \
             ORDER BY priority ASC, created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(category.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(endpoint_from_row).collect()
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<EndpointRow>, StoreError> {
        let sql = format!("SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(endpoint_from_row).transpose()
    }

    async fn insert_endpoint(&self, endpoint: &EndpointRow) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO endpoints (
                id, name, category, kind, url, priority, is_active, auth_required,
                auth_config, scraping_config, total_requests, failure_count, success_rate,
                last_success_at, last_failure_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (category, url) DO NOTHING
            "#,
        )
        .bind(endpoint.id)
        .bind(&endpoint.name)
        .bind(&endpoint.category)
        .bind(&endpoint.kind)
        .bind(&endpoint.url)
        .bind(endpoint.priority)
        .bind(endpoint.is_active)
        .bind(endpoint.auth_required)
        .bind(&endpoint.auth_config)
        .bind(&endpoint.scraping_config)
        .bind(endpoint.total_requests)
        .bind(endpoint.failure_count)
        .bind(endpoint.success_rate)
        .bind(endpoint.last_success_at)
        .bind(endpoint.last_failure_at)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_endpoint_stats(
        &self,
        endpoint_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // Right-hand sides see the pre-update row, so the whole change is one atomic statement.
        let result = sqlx::query(
            r#"
            UPDATE endpoints
               SET total_requests = total_requests + 1,
                   failure_count = failure_count + CASE WHEN $2 THEN 0 ELSE 1 END,
                   success_rate = (total_requests + 1 - failure_count - CASE WHEN $2 THEN 0 ELSE 1 END)::double precision
                                  / (total_requests + 1),
                   last_success_at = CASE WHEN $2 THEN $3 ELSE last_success_at END,
                   last_failure_at = CASE WHEN $2 THEN last_failure_at ELSE $3 END,
                   updated_at = $3
             WHERE id = $1
            "#,
        )
        .bind(endpoint_id)
        .bind(success)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::new(format!("endpoint {endpoint_id} not found")));
        }
        Ok(())
    }

    async fn insert_execution_log(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs (
                id, endpoint_id, category, execution_type, status, providers_fetched,
                providers_saved, duplicates_found, duration_ms, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.endpoint_id)
        .bind(entry.category.as_str())
        .bind(entry.execution_type.as_str())
        .bind(entry.status.as_str())
        .bind(entry.providers_fetched as i32)
        .bind(entry.providers_saved as i32)
        .bind(entry.duplicates_found as i32)
        .bind(entry.duration_ms as i64)
        .bind(&entry.error_message)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_import_log(&self, entry: &ImportLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO import_logs (id, source, registered, already_present, skipped, errors, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.source)
        .bind(entry.registered as i32)
        .bind(entry.already_present as i32)
        .bind(entry.skipped as i32)
        .bind(Json(&entry.errors))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_execution_logs(&self, limit: usize) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, endpoint_id, category, execution_type, status, providers_fetched,
                   providers_saved, duplicates_found, duration_ms, error_message, created_at
              FROM execution_logs
             ORDER BY created_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_log_from_row).collect()
    }
}
