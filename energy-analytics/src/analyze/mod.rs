//! The analyzers. Each is a pure function of already-fetched rows and the
//! thresholds in [`AnalyticsConfig`]; none of them touch storage.

pub mod after_hours;
pub mod anomaly;
pub mod cost;
pub mod electrical;
pub mod quick_wins;
pub mod sensor_health;
pub mod spikes;

use serde::Serialize;
use time::{Duration, UtcOffset};

use crate::{
    config::AnalyticsConfig,
    error::Result,
    series::ChannelSeries,
    stats,
    window::{AnalysisWindow, Span},
};

pub use after_hours::{analyze_after_hours, AfterHoursReport};
pub use anomaly::{detect_anomalies, AnomalyEvent};
pub use cost::{analyze_costs, analyze_demand, analyze_tou, CostReport};
pub use electrical::{analyze_electrical_health, ElectricalHealthReport};
pub use quick_wins::{rank_quick_wins, Recommendation};
pub use sensor_health::{analyze_sensor_health, SensorHealthReport};
pub use spikes::{detect_short_cycling, detect_spikes, SpikeEvent};

/// Per-run inputs every analyzer shares.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext<'a> {
    pub config: &'a AnalyticsConfig,
    pub window: AnalysisWindow,
    pub offset: UtcOffset,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(config: &'a AnalyticsConfig, window: AnalysisWindow) -> Result<Self> {
        Ok(Self {
            config,
            window,
            offset: config.site.utc_offset()?,
        })
    }

    pub fn expected_interval(&self) -> Duration {
        Duration::minutes(i64::from(self.config.sensor_health.expected_interval_minutes))
    }

    /// Longest spacing between two readings that still counts as contiguous.
    pub fn max_step(&self, interval: Duration) -> Duration {
        interval * self.config.sensor_health.gap_multiplier
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    Baseline,
    Window,
}

/// Power values thresholds are derived from.
///
/// The baseline window is used when it is present and at least
/// `baseline.min_completeness_pct` complete; otherwise the analysis window's
/// own readings are used.
pub fn reference_powers(
    ctx: &AnalysisContext<'_>,
    current: &ChannelSeries<'_>,
    baseline: Option<&ChannelSeries<'_>>,
) -> (Vec<f64>, ThresholdSource) {
    if let (Some(series), Some(span)) = (baseline, ctx.window.baseline) {
        if baseline_completeness(&span, series, ctx.expected_interval()) >= ctx.config.baseline.min_completeness_pct {
            return (series.powers(), ThresholdSource::Baseline);
        }
    }
    (current.powers(), ThresholdSource::Window)
}

fn baseline_completeness(span: &Span, series: &ChannelSeries<'_>, interval: Duration) -> f64 {
    let expected = (span.duration().as_seconds_f64() / interval.as_seconds_f64()).floor() as usize;
    let actual = series.readings().iter().filter(|r| span.contains(r.ts)).count();
    stats::completeness_pct(actual, expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::fixtures::series;
    use time::macros::datetime;

    #[test]
    fn sparse_baseline_falls_back_to_window() {
        let config = AnalyticsConfig::default();
        let start = datetime!(2024-01-08 00:00 UTC);
        let window = AnalysisWindow::new(start, start + Duration::DAY)
            .unwrap()
            .with_baseline(Span::new(start - Duration::DAY, start).unwrap());
        let ctx = AnalysisContext::new(&config, window).unwrap();

        let current = series(1, start, Duration::minutes(15), 96, |_, _| 4.0);
        let current = ChannelSeries::new(1, &current).unwrap();

        let full = series(1, start - Duration::DAY, Duration::minutes(15), 96, |_, _| 2.0);
        let (values, source) = reference_powers(&ctx, &current, Some(&ChannelSeries::new(1, &full).unwrap()));
        assert_eq!(source, ThresholdSource::Baseline);
        assert!(values.iter().all(|v| *v == 2.0));

        // 48 of 96 readings is below the 70% floor
        let sparse = series(1, start - Duration::DAY, Duration::minutes(30), 48, |_, _| 2.0);
        let (values, source) = reference_powers(&ctx, &current, Some(&ChannelSeries::new(1, &sparse).unwrap()));
        assert_eq!(source, ThresholdSource::Window);
        assert!(values.iter().all(|v| *v == 4.0));
    }
}
