pub mod csv_file;
pub mod questdb;

pub use csv_file::CsvReadingSource;
pub use questdb::QuestDbReadingSource;

use std::time::Duration;

use anyhow::{anyhow, Result};
use sqlx::postgres::PgPool;

use crate::{
    config::{AppConfig, SourceKind},
    pipeline::{ReadingQuery, ReadingSource, ReadingStream},
};

/// The source selected by `[source] kind`.
pub enum ConfiguredSource {
    QuestDb(QuestDbReadingSource),
    Csv(CsvReadingSource),
}

impl ConfiguredSource {
    pub fn from_config(cfg: &AppConfig, pool: Option<PgPool>) -> Result<Self> {
        match cfg.source.kind {
            SourceKind::Questdb => {
                let (pool, q) = pool
                    .zip(cfg.questdb.as_ref())
                    .ok_or_else(|| anyhow!("questdb source selected without a [questdb] section"))?;
                Ok(Self::QuestDb(QuestDbReadingSource::new(
                    pool,
                    q.max_retries,
                    Duration::from_millis(q.retry_backoff_ms),
                )))
            }
            SourceKind::Csv => {
                let path = cfg
                    .source
                    .csv_path
                    .clone()
                    .ok_or_else(|| anyhow!("source.csv_path is required when source.kind = \"csv\""))?;
                Ok(Self::Csv(CsvReadingSource::new(path)))
            }
        }
    }
}

#[async_trait::async_trait]
impl ReadingSource for ConfiguredSource {
    async fn stream(&self, query: &ReadingQuery) -> ReadingStream {
        match self {
            Self::QuestDb(s) => s.stream(query).await,
            Self::Csv(s) => s.stream(query).await,
        }
    }
}
