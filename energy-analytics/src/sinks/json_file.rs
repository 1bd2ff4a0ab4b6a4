use std::path::PathBuf;

use crate::{
    pipeline::{PipelineError, ReportSink},
    report::WeeklyReport,
};

/// Writes each report as pretty JSON to `<dir>/<site_id>-<window start date>-<id prefix>.json`.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, report: &WeeklyReport) -> PathBuf {
        let id: String = report.report_id.chars().take(12).collect();
        self.dir
            .join(format!("{}-{}-{id}.json", report.site_id, report.window.current.start.date()))
    }
}

#[async_trait::async_trait]
impl ReportSink for JsonFileSink {
    async fn write(&self, report: &WeeklyReport) -> Result<PathBuf, PipelineError> {
        let body = serde_json::to_vec_pretty(report).map_err(|e| PipelineError::Sink(format!("serialize report: {e}")))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PipelineError::Sink(format!("create {}: {e}", self.dir.display())))?;

        let path = self.path_for(report);
        tokio::fs::write(&path, &body)
            .await
            .map_err(|e| PipelineError::Sink(format!("write {}: {e}", path.display())))?;

        metrics::counter!("analytics_reports_written_total").increment(1);
        tracing::info!(path = %path.display(), bytes = body.len(), "report written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AnalyticsConfig,
        report::{build_report, ReportInput},
        window::AnalysisWindow,
    };
    use time::macros::datetime;

    #[tokio::test]
    async fn writes_pretty_json_named_after_site_and_window() {
        let window = AnalysisWindow::new(datetime!(2024-01-08 00:00 UTC), datetime!(2024-01-15 00:00 UTC)).unwrap();
        let input = ReportInput {
            site_id: "site-a",
            channels: &[],
            readings: &[],
            baseline_readings: &[],
            window,
            historical_peak_kw: None,
            generated_at: datetime!(2024-01-15 06:00 UTC),
        };
        let report = build_report(&input, &AnalyticsConfig::default()).unwrap();

        let dir = std::env::temp_dir().join(format!("energy-analytics-sink-{}", std::process::id()));
        let sink = JsonFileSink::new(&dir);
        let path = sink.write(&report).await.unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("site-a-2024-01-08-"), "{name}");
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("\n  \"report_id\""));
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["report_id"], report.report_id.as_str());

        std::fs::remove_dir_all(&dir).ok();
    }
}
