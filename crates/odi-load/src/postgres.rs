//! Postgres/PostGIS sink: one pooled connection per load run, one transaction per batch.

use std::ops::Range;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use odi_core::{Batch, ColumnType, ConflictPolicy, LoadTarget, WriteOptions};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::{Sink, SinkError, SinkSession};

/// Postgres caps a statement at 65535 bind parameters.
pub const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// SRID assumed for GeoJSON payloads (RFC 7946 mandates WGS 84).
pub const GEOJSON_SRID: i32 = 4326;

#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Sink for PgSink {
    type Session = PgSession;

    async fn open(&self) -> Result<Self::Session, SinkError> {
        let conn = self.pool.acquire().await.map_err(SinkError::Connect)?;
        Ok(PgSession { conn })
    }
}

/// Holds the run's connection; it returns to the pool when the session drops.
#[derive(Debug)]
pub struct PgSession {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl SinkSession for PgSession {
    async fn append(
        &mut self,
        target: &LoadTarget,
        batch: &Batch,
        options: &WriteOptions,
    ) -> Result<u64, SinkError> {
        let columns: Vec<String> = batch.column_names().map(str::to_string).collect();
        if columns.is_empty() || batch.is_empty() {
            return Ok(0);
        }
        let write_err = |source| SinkError::Write {
            target: target.qualified_name(),
            source,
        };

        let rows_per_statement = rows_per_statement(columns.len());
        let mut tx = self.conn.begin().await.map_err(write_err)?;
        let mut affected = 0u64;
        let mut start = 0;
        while start < batch.num_rows() {
            let end = (start + rows_per_statement).min(batch.num_rows());
            let mut query = insert_statement(target, batch, &columns, start..end, options);
            let result = query.build().execute(&mut *tx).await.map_err(write_err)?;
            affected += result.rows_affected();
            debug!(rows = end - start, affected = result.rows_affected(), "insert chunk executed");
            start = end;
        }
        tx.commit().await.map_err(write_err)?;
        Ok(affected)
    }
}

pub fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Text form bound for a value; the SQL side casts it to the column's type.
fn bind_text(column_type: ColumnType, value: &Value) -> Option<String> {
    match (column_type, value) {
        (_, Value::Null) => None,
        (ColumnType::Json, v) => Some(v.to_string()),
        (_, Value::String(s)) => Some(s.clone()),
        (_, v) => Some(v.to_string()),
    }
}

/// `INSERT .. VALUES .. ON CONFLICT ON CONSTRAINT ..` for `rows` of `batch`.
pub fn insert_statement<'a>(
    target: &LoadTarget,
    batch: &Batch,
    columns: &[String],
    rows: Range<usize>,
    options: &WriteOptions,
) -> QueryBuilder<'a, Postgres> {
    let mut query: QueryBuilder<'a, Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {}.{} (",
        quote_ident(&target.schema),
        quote_ident(&target.table)
    ));
    {
        let mut separated = query.separated(", ");
        for column in columns {
            separated.push(quote_ident(column));
        }
    }
    query.push(") ");

    query.push_values(rows, |mut b, row| {
        for column in columns {
            let column_type = options.column_type(column);
            let text = batch
                .value(column, row)
                .and_then(|value| bind_text(column_type, value));
            match column_type {
                ColumnType::Text => {
                    b.push_bind(text);
                }
                ColumnType::Geometry => {
                    b.push("ST_SetSRID(ST_GeomFromGeoJSON(");
                    b.push_bind_unseparated(text);
                    b.push_unseparated(format!("), {GEOJSON_SRID})"));
                }
                other => {
                    b.push_bind(text);
                    b.push_unseparated(cast_suffix(other));
                }
            }
        }
    });

    query.push(format!(
        " ON CONFLICT ON CONSTRAINT {} ",
        quote_ident(&target.constraint_name())
    ));
    let updatable: Vec<&String> = columns
        .iter()
        .filter(|c| !target.primary_key.contains(c))
        .collect();
    match options.conflict_policy {
        ConflictPolicy::Update if !updatable.is_empty() => {
            query.push("DO UPDATE SET ");
            let mut separated = query.separated(", ");
            for column in updatable {
                let ident = quote_ident(column);
                separated.push(format!("{ident} = EXCLUDED.{ident}"));
            }
        }
        _ => {
            query.push("DO NOTHING");
        }
    }
    query
}

fn cast_suffix(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer => "::bigint",
        ColumnType::Numeric => "::numeric",
        ColumnType::Boolean => "::boolean",
        ColumnType::Timestamp => "::timestamp",
        ColumnType::Json => "::jsonb",
        ColumnType::Text | ColumnType::Geometry => "",
    }
}
