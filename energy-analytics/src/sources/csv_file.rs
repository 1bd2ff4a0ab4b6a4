use std::{fs::File, path::PathBuf};

use csv::StringRecord;
use readings_client::domain::Reading;
use time::OffsetDateTime;

use crate::pipeline::{PipelineError, ReadingQuery, ReadingSource, ReadingStream};

/// Readings from a CSV export.
///
/// Expected header columns (by name):
/// - channel_id
/// - ts (RFC3339 timestamp, interval end)
/// - energy_kwh
/// - power_kw
/// - voltage_v, current_a, power_factor, frequency_hz, neutral_current_a,
///   thd_current (optional, blank when not metered)
///
/// Rows outside the query are skipped.
pub struct CsvReadingSource {
    path: PathBuf,
}

impl CsvReadingSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn parse_optional_f64(s: &str) -> Option<f64> {
    if s.trim().is_empty() {
        None
    } else {
        s.trim().parse().ok()
    }
}

fn parse_required<T>(name: &str, raw: &str) -> Result<T, PipelineError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| PipelineError::Source(format!("invalid {name} '{raw}': {e}")))
}

fn record_to_reading(record: &StringRecord, headers: &StringRecord) -> Result<Reading, PipelineError> {
    let get = |name: &str| -> Result<&str, PipelineError> {
        headers
            .iter()
            .position(|h| h == name)
            .and_then(|idx| record.get(idx))
            .ok_or_else(|| PipelineError::Source(format!("missing column '{name}' in CSV record")))
    };
    let optional = |name: &str| get(name).ok().and_then(parse_optional_f64);

    let ts_str = get("ts")?;
    let ts = OffsetDateTime::parse(ts_str.trim(), &time::format_description::well_known::Rfc3339)
        .map_err(|e| PipelineError::Source(format!("invalid ts '{ts_str}': {e}")))?;

    Ok(Reading {
        channel_id: parse_required("channel_id", get("channel_id")?)?,
        ts,
        energy_kwh: parse_required("energy_kwh", get("energy_kwh")?)?,
        power_kw: parse_required("power_kw", get("power_kw")?)?,
        voltage_v: optional("voltage_v"),
        current_a: optional("current_a"),
        power_factor: optional("power_factor"),
        frequency_hz: optional("frequency_hz"),
        neutral_current_a: optional("neutral_current_a"),
        thd_current: optional("thd_current"),
    })
}

#[async_trait::async_trait]
impl ReadingSource for CsvReadingSource {
    async fn stream(&self, query: &ReadingQuery) -> ReadingStream {
        // Blocking reader inside one async task; exports are a few weeks of
        // 15-minute rows.
        let path = self.path.clone();
        let query = query.clone();
        let s = async_stream::try_stream! {
            let file = File::open(&path)
                .map_err(|e| PipelineError::Source(format!("failed to open CSV file {}: {e}", path.display())))?;
            let mut rdr = csv::Reader::from_reader(file);
            let headers = rdr
                .headers()
                .map_err(|e| PipelineError::Source(format!("failed to read CSV headers: {e}")))?
                .clone();

            for result in rdr.records() {
                let record = result.map_err(|e| PipelineError::Source(format!(
                    "failed to read CSV record: {e}"
                )))?;

                let reading = match record_to_reading(&record, &headers) {
                    Ok(r) => r,
                    Err(e) => {
                        metrics::counter!("analytics_csv_parse_errors_total").increment(1);
                        Err(e)?
                    }
                };

                if query.matches(&reading) {
                    yield reading;
                }
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::collect_readings;
    use time::macros::datetime;

    fn write_csv(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("energy-analytics-{}-{name}.csv", std::process::id()));
        std::fs::write(&path, body).unwrap();
        path
    }

    fn query(channels: Vec<i64>) -> ReadingQuery {
        ReadingQuery {
            channel_ids: channels,
            start: datetime!(2024-01-01 00:00 UTC),
            end: datetime!(2024-01-02 00:00 UTC),
        }
    }

    #[tokio::test]
    async fn reads_rows_by_header_name() {
        let path = write_csv(
            "by-header",
            "ts,power_kw,channel_id,energy_kwh,voltage_v,thd_current\n\
             2024-01-01T00:15:00Z,4.0,1,1.0,121.5,\n\
             2024-01-01T00:30:00Z,8.0,1,2.0,,3.2\n\
             2024-01-01T00:15:00Z,2.0,2,0.5,,\n\
             2024-01-02T00:00:00Z,4.0,1,1.0,,\n",
        );
        let rows = collect_readings(&CsvReadingSource::new(&path), &query(vec![1])).await.unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, datetime!(2024-01-01 00:15 UTC));
        assert_eq!(rows[0].voltage_v, Some(121.5));
        assert_eq!(rows[0].thd_current, None);
        assert_eq!(rows[1].power_kw, 8.0);
        assert_eq!(rows[1].thd_current, Some(3.2));
    }

    #[tokio::test]
    async fn bad_number_is_a_source_error() {
        let path = write_csv(
            "bad-number",
            "channel_id,ts,energy_kwh,power_kw\n1,2024-01-01T00:15:00Z,abc,4.0\n",
        );
        let err = collect_readings(&CsvReadingSource::new(&path), &query(vec![])).await.unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, PipelineError::Source(msg) if msg.contains("energy_kwh")));
    }

    #[tokio::test]
    async fn missing_file_is_a_source_error() {
        let source = CsvReadingSource::new("/nonexistent/readings.csv");
        assert!(matches!(
            collect_readings(&source, &query(vec![])).await,
            Err(PipelineError::Source(_))
        ));
    }
}
