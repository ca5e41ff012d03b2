//! Relational store facade (auth/client registry).
//!
//! A bounded Postgres pool with thin query helpers and a transaction wrapper
//! that handles BEGIN/COMMIT/ROLLBACK. `health_check` runs `SELECT 1` and
//! flips the connected flag on failure.

use futures::future::BoxFuture;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::types::StorageError;

fn map_sqlx_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::RowNotFound => StorageError::NotFound("row not found".into()),
        sqlx::Error::PoolTimedOut => StorageError::Timeout("connection pool exhausted".into()),
        sqlx::Error::Io(io) => StorageError::ConnectionFailed(io.to_string()),
        other => StorageError::Backend(other.to_string()),
    }
}

/// Bind-parameter value for dynamic queries.
#[derive(Debug, Clone)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Uuid(Uuid),
    Null,
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    params: &'q [SqlParam],
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(v) => query.bind(v),
            SqlParam::Int(v) => query.bind(v),
            SqlParam::Float(v) => query.bind(v),
            SqlParam::Bool(v) => query.bind(v),
            SqlParam::Uuid(v) => query.bind(v),
            SqlParam::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

/// Postgres-backed relational facade.
pub struct Database {
    pool: PgPool,
    connected: AtomicBool,
}

impl Database {
    /// Connect with a bounded pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(map_sqlx_error)?;
        tracing::info!(max_connections, "Relational store connected");
        Ok(Self {
            pool,
            connected: AtomicBool::new(true),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.pool.close().await;
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a statement, returning affected row count.
    pub async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, StorageError> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    /// Fetch all rows.
    pub async fn query_many(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<PgRow>, StorageError> {
        bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    /// Fetch exactly one row.
    pub async fn query_one(&self, sql: &str, params: &[SqlParam]) -> Result<PgRow, StorageError> {
        bind_params(sqlx::query(sql), params)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    /// Fetch at most one row.
    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Option<PgRow>, StorageError> {
        bind_params(sqlx::query(sql), params)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    /// Run `f` inside a transaction. Commit on `Ok`, roll back on `Err`.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send,
        F: for<'t> FnOnce(
                &'t mut Transaction<'static, Postgres>,
            ) -> BoxFuture<'t, Result<T, StorageError>>
            + Send,
    {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await.map_err(map_sqlx_error)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    /// `SELECT 1`; a failure flips the connected flag.
    pub async fn health_check(&self) -> bool {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(row) => {
                let ok = row.try_get::<i32, _>(0).map(|v| v == 1).unwrap_or(false);
                self.connected.store(ok, Ordering::SeqCst);
                ok
            }
            Err(e) => {
                tracing::warn!(error = %e, "Relational health check failed");
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }
}
