use std::time::Duration;

use readings_client::{db, domain::Reading};
use sqlx::postgres::PgPool;

use crate::pipeline::{PipelineError, ReadingQuery, ReadingSource, ReadingStream};

/// Readings from the QuestDB store over its Postgres wire endpoint.
pub struct QuestDbReadingSource {
    pool: PgPool,
    max_retries: u32,
    retry_backoff: Duration,
}

impl QuestDbReadingSource {
    pub fn new(pool: PgPool, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            max_retries,
            retry_backoff,
        }
    }

    async fn fetch(&self, query: &ReadingQuery) -> Result<Vec<Reading>, PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            match db::readings_in_range(&self.pool, &query.channel_ids, query.start, query.end).await {
                Ok(rows) => {
                    metrics::counter!("analytics_store_rows_fetched_total").increment(rows.len() as u64);
                    return Ok(rows);
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, "reading query failed, retrying with backoff");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "reading query failed, giving up");
                    metrics::counter!("analytics_store_errors_total").increment(1);
                    return Err(PipelineError::Source(e.to_string()));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ReadingSource for QuestDbReadingSource {
    async fn stream(&self, query: &ReadingQuery) -> ReadingStream {
        let fetched = self.fetch(query).await;
        let s = async_stream::try_stream! {
            for r in fetched? {
                yield r;
            }
        };
        Box::pin(s)
    }
}
