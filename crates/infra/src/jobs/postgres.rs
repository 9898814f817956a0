//! Postgres-backed consulta store.
//!
//! Each consulta is one JSONB document; registration markers live in their own
//! table so claiming one is a single `INSERT ... ON CONFLICT DO NOTHING`.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use consulta_core::{Consulta, ConsultaId};

use super::store::{ConsultaStore, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS consultas (
        seq BIGSERIAL NOT NULL,
        id UUID PRIMARY KEY,
        document JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS consulta_registrations (
        consulta_id UUID NOT NULL REFERENCES consultas(id) ON DELETE CASCADE,
        item_index BIGINT NOT NULL,
        claimed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (consulta_id, item_index)
    )
    "#,
];

/// Postgres-backed consulta store.
#[derive(Debug, Clone)]
pub struct PostgresConsultaStore {
    pool: Arc<PgPool>,
}

impl PostgresConsultaStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

fn map_sqlx_error(op: &str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::ColumnDecode { source, .. } => {
            StoreError::Serialization(format!("{op}: {source}"))
        }
        other => StoreError::Storage(format!("{op}: {other}")),
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<Consulta, StoreError> {
    row.try_get::<Json<Consulta>, _>("document")
        .map(|doc| doc.0)
        .map_err(|e| map_sqlx_error("decode", e))
}

#[async_trait]
impl ConsultaStore for PostgresConsultaStore {
    async fn insert(&self, consulta: &Consulta) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO consultas (id, document)
            VALUES ($1, $2)
            "#,
        )
        .bind(consulta.id.as_uuid())
        .bind(Json(consulta))
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(consulta.id))
            }
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    async fn get(&self, id: ConsultaId) -> Result<Option<Consulta>, StoreError> {
        let row = sqlx::query("SELECT document FROM consultas WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode).transpose()
    }

    async fn put(&self, consulta: &Consulta) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE consultas
            SET document = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(consulta.id.as_uuid())
        .bind(Json(consulta))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(consulta.id));
        }
        Ok(())
    }

    async fn delete(&self, id: ConsultaId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM consultas WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Consulta>, StoreError> {
        let rows = sqlx::query("SELECT document FROM consultas ORDER BY seq ASC")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode).collect()
    }

    async fn claim_registration(&self, id: ConsultaId, index: usize) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO consulta_registrations (consulta_id, item_index)
            VALUES ($1, $2)
            ON CONFLICT (consulta_id, item_index) DO NOTHING
            "#,
        )
        .bind(id.as_uuid())
        .bind(index as i64)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.rows_affected() == 1),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(StoreError::NotFound(id))
            }
            Err(e) => Err(map_sqlx_error("claim_registration", e)),
        }
    }
}
