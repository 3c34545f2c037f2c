//! Conflict-aware, batch-at-a-time loading of fetched pages into a relational sink.

pub mod memory;
pub mod postgres;
pub mod transform;

use async_trait::async_trait;
use odi_core::{
    Batch, ColumnType, ConflictPolicy, GeometryError, LoadTarget, Page, PageSource, SchemaError,
    WriteOptions, INDEX_COLUMN,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, info_span, Instrument};

pub use memory::{MemorySession, MemorySink};
pub use postgres::{PgSession, PgSink};
pub use transform::{BatchTransform, ColumnRule, RuleTransform};

pub const CRATE_NAME: &str = "odi-load";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("acquiring sink connection: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("writing batch to {target}: {source}")]
    Write {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

/// Relational destination able to hand out one scoped session per load run.
#[async_trait]
pub trait Sink: Send + Sync {
    type Session: SinkSession;

    async fn open(&self) -> Result<Self::Session, SinkError>;
}

/// Exclusive handle on a sink connection. Dropping it releases the connection.
#[async_trait]
pub trait SinkSession: Send {
    /// Writes the whole batch atomically and returns rows inserted or updated.
    async fn append(
        &mut self,
        target: &LoadTarget,
        batch: &Batch,
        options: &WriteOptions,
    ) -> Result<u64, SinkError>;
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("page source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("transform failed: {0:#}")]
    Transform(anyhow::Error),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// A load that stopped early. Everything in `committed` is durably written.
#[derive(Debug, Error)]
#[error(
    "load into {table} failed after {pages} committed pages: {error}",
    table = .committed.target,
    pages = .committed.pages
)]
pub struct LoadFailure {
    pub committed: LoadSummary,
    /// Offset of the page being processed when the error occurred, if one was pulled.
    pub failed_offset: Option<u64>,
    #[source]
    pub error: LoadError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub target: String,
    pub pages: u64,
    pub records: u64,
    pub rows_written: u64,
    pub rows_affected: u64,
    pub geometry_coerced: u64,
    pub duplicates_collapsed: u64,
    pub first_offset: Option<u64>,
    pub last_offset: Option<u64>,
}

/// Passes batches through untouched apart from the shared preparation steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainLoader;

/// Coerces empty geometry payloads in `geometry_field` and rejects malformed ones.
#[derive(Debug, Clone)]
pub struct GeoLoader {
    geometry_field: String,
}

impl GeoLoader {
    pub fn new(geometry_field: impl Into<String>) -> Self {
        Self {
            geometry_field: geometry_field.into(),
        }
    }

    pub fn geometry_field(&self) -> &str {
        &self.geometry_field
    }
}

#[derive(Debug, Clone)]
pub enum LoaderVariant {
    Plain(PlainLoader),
    Geo(GeoLoader),
}

impl LoaderVariant {
    pub fn from_geometry_field(geometry_field: Option<String>) -> Self {
        match geometry_field {
            Some(field) => Self::Geo(GeoLoader::new(field)),
            None => Self::Plain(PlainLoader),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain(_) => "plain",
            Self::Geo(_) => "geo",
        }
    }

    /// Returns how many geometry values were coerced to the empty point.
    fn normalize(&self, batch: &mut Batch, offset: u64) -> Result<u64, GeometryError> {
        match self {
            Self::Plain(_) => Ok(0),
            Self::Geo(geo) => match batch.normalize_geometry_column(&geo.geometry_field) {
                Ok(coerced) => Ok(coerced as u64),
                Err(err) => {
                    error!(
                        offset,
                        field = %geo.geometry_field,
                        row = err.row,
                        payload = %err.payload,
                        "unparseable geometry payload"
                    );
                    Err(err)
                }
            },
        }
    }
}

pub struct DatasetLoader {
    variant: LoaderVariant,
    transform: Option<Box<dyn BatchTransform>>,
    target: LoadTarget,
    options: WriteOptions,
}

impl DatasetLoader {
    pub fn new(target: LoadTarget, options: WriteOptions) -> Self {
        Self {
            variant: LoaderVariant::Plain(PlainLoader),
            transform: None,
            target,
            options,
        }
    }

    /// Selects the loader variant. The geo variant hints its field as geometry unless already hinted.
    pub fn with_variant(mut self, variant: LoaderVariant) -> Self {
        if let LoaderVariant::Geo(geo) = &variant {
            self.options
                .column_types
                .entry(geo.geometry_field.clone())
                .or_insert(ColumnType::Geometry);
        }
        self.variant = variant;
        self
    }

    pub fn with_geometry_field(self, geometry_field: impl Into<String>) -> Self {
        self.with_variant(LoaderVariant::Geo(GeoLoader::new(geometry_field)))
    }

    pub fn with_transform(mut self, transform: Box<dyn BatchTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn target(&self) -> &LoadTarget {
        &self.target
    }

    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    pub fn variant(&self) -> &LoaderVariant {
        &self.variant
    }

    /// Drains `pages` into `sink`, one committed write per page, strictly in order.
    ///
    /// One session is held for the whole run and dropped on every exit path.
    pub async fn load<P, S>(&self, pages: &mut P, sink: &S) -> Result<LoadSummary, LoadFailure>
    where
        P: PageSource,
        S: Sink,
    {
        let span = info_span!(
            "dataset_load",
            table = %self.target.qualified_name(),
            variant = self.variant.name()
        );
        self.load_inner(pages, sink).instrument(span).await
    }

    async fn load_inner<P, S>(&self, pages: &mut P, sink: &S) -> Result<LoadSummary, LoadFailure>
    where
        P: PageSource,
        S: Sink,
    {
        let mut summary = LoadSummary {
            target: self.target.qualified_name(),
            ..Default::default()
        };
        let mut session = match sink.open().await {
            Ok(session) => session,
            Err(err) => return Err(self.failure(summary, None, err.into())),
        };

        loop {
            let page = match pages.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(err) => return Err(self.failure(summary, None, LoadError::Source(Box::new(err)))),
            };
            let offset = page.offset;
            if let Err(err) = self.write_page(&mut session, page, &mut summary).await {
                return Err(self.failure(summary, Some(offset), err));
            }
        }

        info!(
            pages = summary.pages,
            records = summary.records,
            rows_affected = summary.rows_affected,
            "load complete"
        );
        Ok(summary)
    }

    fn failure(&self, committed: LoadSummary, failed_offset: Option<u64>, error: LoadError) -> LoadFailure {
        error!(
            table = %self.target.qualified_name(),
            failed_offset = ?failed_offset,
            committed_pages = committed.pages,
            %error,
            "load aborted"
        );
        LoadFailure {
            committed,
            failed_offset,
            error,
        }
    }

    /// Normalizes, transforms and validates one page without writing it.
    ///
    /// `rows_before` is the number of records received ahead of this page; index
    /// ordinals are assigned before in-batch dedup so they stay unique across the run.
    pub fn prepare(&self, page: &Page, rows_before: u64) -> Result<PreparedBatch, LoadError> {
        let mut batch = Batch::from_records(&page.records);
        let geometry_coerced = self.variant.normalize(&mut batch, page.offset)?;

        if let Some(transform) = &self.transform {
            batch = transform.apply(&batch).map_err(LoadError::Transform)?;
        }

        if self.options.index_enabled {
            let ordinals = (0..batch.num_rows() as u64)
                .map(|i| Value::from(rows_before + i))
                .collect();
            batch.insert_column(INDEX_COLUMN, ordinals)?;
        }

        let duplicates_collapsed = match self.options.conflict_policy {
            ConflictPolicy::Update => batch.dedup_keep_last(&self.target.primary_key) as u64,
            ConflictPolicy::Skip => 0,
        };

        batch.validate(&self.options.effective_column_types(), ColumnType::Text)?;

        Ok(PreparedBatch {
            batch,
            geometry_coerced,
            duplicates_collapsed,
        })
    }

    async fn write_page<T: SinkSession>(
        &self,
        session: &mut T,
        page: Page,
        summary: &mut LoadSummary,
    ) -> Result<(), LoadError> {
        let offset = page.offset;
        let records = page.len() as u64;
        let prepared = self.prepare(&page, summary.records)?;
        drop(page);

        let batch = prepared.batch;
        let rows_affected = if batch.is_empty() || batch.num_columns() == 0 {
            debug!(offset, "nothing to write for page");
            0
        } else {
            session.append(&self.target, &batch, &self.options).await?
        };

        summary.pages += 1;
        summary.records += records;
        summary.rows_written += batch.num_rows() as u64;
        summary.rows_affected += rows_affected;
        summary.geometry_coerced += prepared.geometry_coerced;
        summary.duplicates_collapsed += prepared.duplicates_collapsed;
        summary.first_offset.get_or_insert(offset);
        summary.last_offset = Some(offset);
        debug!(
            offset,
            records,
            rows = batch.num_rows(),
            rows_affected,
            "batch committed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBatch {
    pub batch: Batch,
    pub geometry_coerced: u64,
    pub duplicates_collapsed: u64,
}
