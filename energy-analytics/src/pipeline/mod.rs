use std::{path::PathBuf, pin::Pin};

use futures::{Stream, StreamExt};
use readings_client::domain::Reading;
use time::OffsetDateTime;

use crate::{report::WeeklyReport, transform};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type ReadingStream = Pin<Box<dyn Stream<Item = Result<Reading, PipelineError>> + Send>>;

/// Which rows to fetch: a channel set over `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingQuery {
    pub channel_ids: Vec<i64>,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl ReadingQuery {
    pub fn matches(&self, r: &Reading) -> bool {
        self.start <= r.ts && r.ts < self.end && (self.channel_ids.is_empty() || self.channel_ids.contains(&r.channel_id))
    }
}

#[async_trait::async_trait]
pub trait ReadingSource: Send + Sync {
    async fn stream(&self, query: &ReadingQuery) -> ReadingStream;
}

#[async_trait::async_trait]
pub trait ReportSink: Send + Sync {
    /// Persist the report, returning where it was written.
    async fn write(&self, report: &WeeklyReport) -> Result<PathBuf, PipelineError>;
}

/// Drain a source into memory.
///
/// Rows failing [`transform::validate_reading`] are logged and skipped;
/// source errors abort. Duplicate `(channel_id, ts)` rows keep the first
/// occurrence. Row order is otherwise preserved so ordering problems still
/// reach the analyzers.
pub async fn collect_readings<S>(source: &S, query: &ReadingQuery) -> Result<Vec<Reading>, PipelineError>
where
    S: ReadingSource + ?Sized,
{
    let mut stream = source.stream(query).await;
    let mut rows = Vec::new();
    let mut rejected = 0usize;
    while let Some(item) = stream.next().await {
        let reading = item?;
        match transform::validate_reading(reading) {
            Ok(r) => rows.push(r),
            Err(e) => {
                rejected += 1;
                tracing::warn!(error = %e, "reading rejected");
            }
        }
    }
    let fetched = rows.len();
    let rows = transform::dedupe_readings(rows);
    tracing::info!(
        rows = rows.len(),
        rejected,
        duplicates = fetched - rows.len(),
        channels = query.channel_ids.len(),
        "readings collected"
    );
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    struct VecSource(Vec<Result<Reading, String>>);

    #[async_trait::async_trait]
    impl ReadingSource for VecSource {
        async fn stream(&self, _query: &ReadingQuery) -> ReadingStream {
            let items: Vec<_> = self
                .0
                .iter()
                .cloned()
                .map(|r| r.map_err(PipelineError::Source))
                .collect();
            Box::pin(futures::stream::iter(items))
        }
    }

    fn query() -> ReadingQuery {
        ReadingQuery {
            channel_ids: vec![1],
            start: datetime!(2024-01-01 00:00 UTC),
            end: datetime!(2024-01-02 00:00 UTC),
        }
    }

    #[tokio::test]
    async fn skips_invalid_and_duplicate_rows() {
        let t = datetime!(2024-01-01 00:15 UTC);
        let source = VecSource(vec![
            Ok(Reading::energy(1, t, 1.0, 4.0)),
            Ok(Reading::energy(1, t, 9.0, 36.0)),
            Ok(Reading::energy(1, t + time::Duration::minutes(15), -1.0, 4.0)),
            Ok(Reading::energy(1, t + time::Duration::minutes(30), 1.0, 4.0)),
        ]);
        let rows = collect_readings(&source, &query()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].energy_kwh, 1.0);
    }

    #[tokio::test]
    async fn source_error_aborts() {
        let source = VecSource(vec![
            Ok(Reading::energy(1, datetime!(2024-01-01 00:15 UTC), 1.0, 4.0)),
            Err("connection reset".to_string()),
        ]);
        let err = collect_readings(&source, &query()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Source(_)));
    }

    #[test]
    fn query_is_half_open() {
        let q = query();
        assert!(q.matches(&Reading::energy(1, q.start, 1.0, 1.0)));
        assert!(!q.matches(&Reading::energy(1, q.end, 1.0, 1.0)));
        assert!(!q.matches(&Reading::energy(2, q.start, 1.0, 1.0)));
    }
}
