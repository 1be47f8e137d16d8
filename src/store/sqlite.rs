//! SQLite-backed store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

use super::{AccountRecord, ConfigRecord, Store, StoreError};
use crate::registry::{parse_node_url, AccountConfig, HealthCheckMethod, Node, NodeMetrics};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id            TEXT PRIMARY KEY,
        name          TEXT NOT NULL,
        password      TEXT NOT NULL DEFAULT '',
        proxy_api_key TEXT NOT NULL UNIQUE,
        is_admin      INTEGER NOT NULL DEFAULT 0,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id                   TEXT PRIMARY KEY,
        account_id           TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
        name                 TEXT NOT NULL,
        base_url             TEXT NOT NULL,
        api_key              TEXT,
        health_check_method  TEXT NOT NULL DEFAULT 'auto',
        weight               INTEGER NOT NULL DEFAULT 1,
        failed               INTEGER NOT NULL DEFAULT 0,
        disabled             INTEGER NOT NULL DEFAULT 0,
        last_error           TEXT NOT NULL DEFAULT '',
        created_at           TEXT NOT NULL,
        requests             INTEGER NOT NULL DEFAULT 0,
        fail_count           INTEGER NOT NULL DEFAULT 0,
        fail_streak          INTEGER NOT NULL DEFAULT 0,
        total_bytes          INTEGER NOT NULL DEFAULT 0,
        total_input          INTEGER NOT NULL DEFAULT 0,
        total_output         INTEGER NOT NULL DEFAULT 0,
        stream_dur_ms        INTEGER NOT NULL DEFAULT 0,
        first_byte_ms        INTEGER NOT NULL DEFAULT 0,
        last_ping_ms         INTEGER,
        last_ping_err        TEXT NOT NULL DEFAULT '',
        last_health_check_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_nodes_account ON nodes(account_id)",
    r#"
    CREATE TABLE IF NOT EXISTS config (
        account_id      TEXT PRIMARY KEY REFERENCES accounts(id) ON DELETE CASCADE,
        retries         INTEGER NOT NULL,
        fail_limit      INTEGER NOT NULL,
        health_every_ms INTEGER NOT NULL,
        active_node     TEXT
    )
    "#,
];

/// Store over a SQLite connection pool
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database and apply the schema
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to an in-memory database is its own database,
        // so the pool must hold exactly one and never recycle it.
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!(url = %redact_url(url), "Opened SQLite store");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn redact_url(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn node_from_row(row: &SqliteRow) -> Result<Node, StoreError> {
    let id: String = row.try_get("id")?;
    let base_url: String = row.try_get("base_url")?;
    let url = parse_node_url(&base_url).map_err(|e| StoreError::Corrupt {
        table: "nodes",
        reason: format!("node {}: {}", id, e),
    })?;
    let weight: i64 = row.try_get("weight")?;
    let method: String = row.try_get("health_check_method")?;
    let last_ping_ms: Option<i64> = row.try_get("last_ping_ms")?;
    let last_health_check_at: Option<DateTime<Utc>> = row.try_get("last_health_check_at")?;

    Ok(Node {
        id,
        name: row.try_get("name")?,
        url,
        api_key: row
            .try_get::<Option<String>, _>("api_key")?
            .filter(|k| !k.is_empty()),
        account_id: row.try_get("account_id")?,
        created_at: row.try_get("created_at")?,
        weight: u32::try_from(weight.max(1)).unwrap_or(u32::MAX),
        health_check_method: HealthCheckMethod::from_column(&method),
        failed: row.try_get("failed")?,
        disabled: row.try_get("disabled")?,
        last_error: row.try_get("last_error")?,
        metrics: NodeMetrics {
            requests: to_u64(row.try_get("requests")?),
            fail_count: to_u64(row.try_get("fail_count")?),
            fail_streak: to_u64(row.try_get("fail_streak")?),
            first_byte_ms_total: to_u64(row.try_get("first_byte_ms")?),
            stream_ms_total: to_u64(row.try_get("stream_dur_ms")?),
            total_bytes: to_u64(row.try_get("total_bytes")?),
            total_input_tokens: to_u64(row.try_get("total_input")?),
            total_output_tokens: to_u64(row.try_get("total_output")?),
            last_ping_ms: last_ping_ms.map(to_u64),
            last_ping_err: row.try_get("last_ping_err")?,
            last_health_check_at,
        },
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_accounts(&self) -> Result<Vec<AccountRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, password, proxy_api_key, is_admin, created_at, updated_at
            FROM accounts
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AccountRecord {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    password: row.try_get("password")?,
                    proxy_api_key: row.try_get("proxy_api_key")?,
                    is_admin: row.try_get("is_admin")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn load_nodes(&self, account_id: &str) -> Result<Vec<Node>, StoreError> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE account_id = ?1 ORDER BY created_at ASC")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn load_config(&self, account_id: &str) -> Result<Option<ConfigRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT retries, fail_limit, health_every_ms, active_node FROM config WHERE account_id = ?1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let retries: i64 = row.try_get("retries")?;
        let fail_limit: i64 = row.try_get("fail_limit")?;
        let health_every_ms: i64 = row.try_get("health_every_ms")?;
        Ok(Some(ConfigRecord {
            config: AccountConfig {
                retries: u32::try_from(retries).unwrap_or(1).max(1),
                fail_limit: u32::try_from(fail_limit).unwrap_or(1).max(1),
                health_every: Duration::from_millis(to_u64(health_every_ms)),
            },
            active_node: row.try_get("active_node")?,
        }))
    }

    async fn upsert_account(&self, account: &AccountRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, name, password, proxy_api_key, is_admin, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                password = excluded.password,
                proxy_api_key = excluded.proxy_api_key,
                is_admin = excluded.is_admin,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account.id)
        .bind(&account.name)
        .bind(&account.password)
        .bind(&account.proxy_api_key)
        .bind(account.is_admin)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_account(&self, account_id: &str) -> Result<(), StoreError> {
        // Explicit deletes so the result does not depend on the FK pragma
        sqlx::query("DELETE FROM nodes WHERE account_id = ?1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM config WHERE account_id = ?1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_node(&self, node: &Node) -> Result<(), StoreError> {
        let m = &node.metrics;
        sqlx::query(
            r#"
            INSERT INTO nodes (
                id, account_id, name, base_url, api_key, health_check_method, weight,
                failed, disabled, last_error, created_at,
                requests, fail_count, fail_streak, total_bytes, total_input, total_output,
                stream_dur_ms, first_byte_ms, last_ping_ms, last_ping_err, last_health_check_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                    ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                base_url = excluded.base_url,
                api_key = excluded.api_key,
                health_check_method = excluded.health_check_method,
                weight = excluded.weight,
                disabled = excluded.disabled
            "#,
        )
        .bind(&node.id)
        .bind(&node.account_id)
        .bind(&node.name)
        .bind(node.base_url())
        .bind(node.api_key.as_deref())
        .bind(node.health_check_method.as_str())
        .bind(i64::from(node.weight))
        .bind(node.failed)
        .bind(node.disabled)
        .bind(&node.last_error)
        .bind(node.created_at)
        .bind(to_i64(m.requests))
        .bind(to_i64(m.fail_count))
        .bind(to_i64(m.fail_streak))
        .bind(to_i64(m.total_bytes))
        .bind(to_i64(m.total_input_tokens))
        .bind(to_i64(m.total_output_tokens))
        .bind(to_i64(m.stream_ms_total))
        .bind(to_i64(m.first_byte_ms_total))
        .bind(m.last_ping_ms.map(to_i64))
        .bind(&m.last_ping_err)
        .bind(m.last_health_check_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_node_state(&self, node: &Node) -> Result<(), StoreError> {
        let m = &node.metrics;
        // Monotonic counters never move backwards, even if writes race
        sqlx::query(
            r#"
            UPDATE nodes SET
                failed = ?2,
                last_error = ?3,
                requests = MAX(requests, ?4),
                fail_count = MAX(fail_count, ?5),
                fail_streak = ?6,
                total_bytes = MAX(total_bytes, ?7),
                total_input = MAX(total_input, ?8),
                total_output = MAX(total_output, ?9),
                stream_dur_ms = MAX(stream_dur_ms, ?10),
                first_byte_ms = MAX(first_byte_ms, ?11),
                last_ping_ms = COALESCE(?12, last_ping_ms),
                last_ping_err = ?13,
                last_health_check_at = COALESCE(?14, last_health_check_at)
            WHERE id = ?1
            "#,
        )
        .bind(&node.id)
        .bind(node.failed)
        .bind(&node.last_error)
        .bind(to_i64(m.requests))
        .bind(to_i64(m.fail_count))
        .bind(to_i64(m.fail_streak))
        .bind(to_i64(m.total_bytes))
        .bind(to_i64(m.total_input_tokens))
        .bind(to_i64(m.total_output_tokens))
        .bind(to_i64(m.stream_ms_total))
        .bind(to_i64(m.first_byte_ms_total))
        .bind(m.last_ping_ms.map(to_i64))
        .bind(&m.last_ping_err)
        .bind(m.last_health_check_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_node(&self, node_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM nodes WHERE id = ?1")
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_config(&self, account_id: &str, config: &ConfigRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO config (account_id, retries, fail_limit, health_every_ms, active_node)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_id) DO UPDATE SET
                retries = excluded.retries,
                fail_limit = excluded.fail_limit,
                health_every_ms = excluded.health_every_ms,
                active_node = excluded.active_node
            "#,
        )
        .bind(account_id)
        .bind(i64::from(config.config.retries))
        .bind(i64::from(config.config.fail_limit))
        .bind(to_i64(config.config.health_every.as_millis() as u64))
        .bind(config.active_node.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
