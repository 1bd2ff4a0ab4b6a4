//! Energy drawn outside business hours above the channel's own floor.

use serde::Serialize;
use time::OffsetDateTime;

use super::AnalysisContext;
use crate::{
    findings::{Finding, FindingKind, Impact, Severity},
    series::ChannelSeries,
    stats,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelAfterHours {
    pub channel_id: i64,
    /// Low-percentile after-hours draw: the load the channel never gets below.
    pub baseline_kw: f64,
    pub after_hours_intervals: usize,
    pub excess_kwh: f64,
    pub peak_excess_kw: f64,
    pub cost_usd: f64,
    pub annual_excess_kwh: f64,
    pub annual_cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AfterHoursReport {
    /// Only channels whose excess passed the significance thresholds.
    pub channels: Vec<ChannelAfterHours>,
    pub total_excess_kwh: f64,
    pub total_cost_usd: f64,
    pub annual_excess_kwh: f64,
    pub annual_cost_usd: f64,
    pub findings: Vec<Finding>,
}

/// Estimate one channel's after-hours excess. Returns the raw figures even
/// when they fall below the significance thresholds, or `None` when the
/// channel has no after-hours readings in the window.
pub fn channel_excess(ctx: &AnalysisContext<'_>, series: &ChannelSeries<'_>) -> Option<(ChannelAfterHours, Option<(OffsetDateTime, OffsetDateTime)>)> {
    let cfg = &ctx.config.after_hours;
    let span = ctx.window.current;
    let interval_hours = series.typical_interval(ctx.expected_interval()).as_seconds_f64() / 3600.0;

    let after_hours: Vec<_> = series
        .readings()
        .iter()
        .filter(|r| span.contains(r.ts) && !ctx.config.business_hours.is_business_hours(r.ts, ctx.offset))
        .collect();
    if after_hours.is_empty() {
        return None;
    }

    let powers: Vec<f64> = after_hours.iter().map(|r| r.power_kw).collect();
    let baseline_kw = stats::percentile(&powers, cfg.baseline_percentile);

    let mut excess_kwh = 0.0;
    let mut peak_excess_kw: f64 = 0.0;
    let mut first: Option<OffsetDateTime> = None;
    let mut last: Option<OffsetDateTime> = None;
    for r in &after_hours {
        let excess = (r.power_kw - baseline_kw).max(0.0);
        if excess > 0.0 {
            excess_kwh += excess * interval_hours;
            peak_excess_kw = peak_excess_kw.max(excess);
            first.get_or_insert(r.ts);
            last = Some(r.ts);
        }
    }

    let rate = ctx.config.tariff.flat_rate;
    let annual = ctx.window.annualization_factor();
    let result = ChannelAfterHours {
        channel_id: series.channel_id(),
        baseline_kw,
        after_hours_intervals: after_hours.len(),
        excess_kwh,
        peak_excess_kw,
        cost_usd: excess_kwh * rate,
        annual_excess_kwh: excess_kwh * annual,
        annual_cost_usd: excess_kwh * rate * annual,
    };
    Some((result, first.zip(last)))
}

pub fn analyze_after_hours(ctx: &AnalysisContext<'_>, series: &[ChannelSeries<'_>]) -> AfterHoursReport {
    let cfg = &ctx.config.after_hours;
    let rate = ctx.config.tariff.flat_rate;
    let interval = ctx.expected_interval();

    let mut channels = Vec::new();
    let mut findings = Vec::new();
    for s in series {
        let Some((result, period)) = channel_excess(ctx, s) else {
            continue;
        };
        if result.excess_kwh < cfg.min_excess_kwh || result.peak_excess_kw < cfg.min_power_kw {
            tracing::trace!(channel_id = result.channel_id, excess_kwh = result.excess_kwh, "after-hours excess below threshold");
            continue;
        }

        let severity = Severity::from_ratio(if cfg.min_excess_kwh > 0.0 {
            result.excess_kwh / cfg.min_excess_kwh
        } else {
            f64::INFINITY
        });
        let mut finding = Finding::new(
            FindingKind::AfterHoursWaste,
            severity,
            Some(result.channel_id),
            format!(
                "Channel {} drew {:.1} kWh above its {:.2} kW after-hours floor (${:.2}, ~${:.0}/yr)",
                result.channel_id, result.excess_kwh, result.baseline_kw, result.cost_usd, result.annual_cost_usd
            ),
        )
        .with_impact(Impact::energy(result.excess_kwh, rate));
        if let Some((start, end)) = period {
            finding = finding.between(start, end + interval);
        }
        findings.push(finding);
        channels.push(result);
    }

    let total_excess_kwh: f64 = channels.iter().map(|c| c.excess_kwh).sum();
    let annual = ctx.window.annualization_factor();
    tracing::debug!(channels = channels.len(), total_excess_kwh, "after-hours analysis complete");
    AfterHoursReport {
        channels,
        total_excess_kwh,
        total_cost_usd: total_excess_kwh * rate,
        annual_excess_kwh: total_excess_kwh * annual,
        annual_cost_usd: total_excess_kwh * rate * annual,
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AnalyticsConfig, series::fixtures::series, window::AnalysisWindow};
    use readings_client::domain::Reading;
    use time::{macros::datetime, Duration, UtcOffset};

    // Monday
    const T0: OffsetDateTime = datetime!(2024-01-01 00:00 UTC);

    fn week(after_hours_kw: impl Fn(OffsetDateTime) -> f64) -> Vec<Reading> {
        let hours = AnalyticsConfig::default().business_hours;
        series(1, T0, Duration::minutes(15), 96 * 7, |_, ts| {
            if hours.is_business_hours(ts, UtcOffset::UTC) {
                10.0
            } else {
                after_hours_kw(ts)
            }
        })
    }

    fn ctx(config: &AnalyticsConfig) -> AnalysisContext<'_> {
        AnalysisContext::new(config, AnalysisWindow::new(T0, T0 + Duration::weeks(1)).unwrap()).unwrap()
    }

    #[test]
    fn steady_overnight_load_is_not_waste() {
        let config = AnalyticsConfig::default();
        let rows = week(|_| 2.0);
        let s = ChannelSeries::new(1, &rows).unwrap();

        let (raw, period) = channel_excess(&ctx(&config), &s).unwrap();
        assert_eq!(raw.baseline_kw, 2.0);
        assert_eq!(raw.excess_kwh, 0.0);
        assert_eq!(raw.cost_usd, 0.0);
        assert!(period.is_none());

        let report = analyze_after_hours(&ctx(&config), &[s]);
        assert!(report.findings.is_empty());
        assert_eq!(report.total_cost_usd, 0.0);
    }

    #[test]
    fn six_kwh_is_below_the_default_significance_floor() {
        let config = AnalyticsConfig::default();
        let rows = week(|ts| {
            if ts >= datetime!(2024-01-02 20:00 UTC) && ts < datetime!(2024-01-02 22:00 UTC) {
                5.0
            } else {
                2.0
            }
        });
        let s = ChannelSeries::new(1, &rows).unwrap();
        let report = analyze_after_hours(&ctx(&config), &[s]);

        assert!(config.after_hours.min_excess_kwh > 6.0);
        assert!(report.findings.is_empty());
        assert_eq!(report.total_excess_kwh, 0.0);
    }

    #[test]
    fn two_hours_at_five_kw_is_six_kwh() {
        let mut config = AnalyticsConfig::default();
        config.after_hours.min_excess_kwh = 5.0;
        // Tuesday 20:00-22:00
        let rows = week(|ts| {
            if ts >= datetime!(2024-01-02 20:00 UTC) && ts < datetime!(2024-01-02 22:00 UTC) {
                5.0
            } else {
                2.0
            }
        });
        let s = ChannelSeries::new(1, &rows).unwrap();
        let report = analyze_after_hours(&ctx(&config), &[s]);

        assert_eq!(report.channels.len(), 1);
        assert!((report.total_excess_kwh - 6.0).abs() < 1e-9);
        assert!((report.total_cost_usd - 0.72).abs() < 1e-9);
        assert!((report.annual_excess_kwh - 6.0 * 365.0 / 7.0).abs() < 1e-6);

        let f = &report.findings[0];
        assert_eq!(f.kind, FindingKind::AfterHoursWaste);
        assert_eq!(f.start, Some(datetime!(2024-01-02 20:00 UTC)));
        assert_eq!(f.end, Some(datetime!(2024-01-02 22:00 UTC)));
    }

    #[test]
    fn small_excess_is_dropped_at_default_threshold() {
        let config = AnalyticsConfig::default();
        let rows = week(|ts| {
            if ts >= datetime!(2024-01-02 20:00 UTC) && ts < datetime!(2024-01-02 22:00 UTC) {
                5.0
            } else {
                2.0
            }
        });
        let s = ChannelSeries::new(1, &rows).unwrap();
        assert!(analyze_after_hours(&ctx(&config), &[s]).channels.is_empty());
    }

    #[test]
    fn business_hours_only_channel_is_skipped() {
        let config = AnalyticsConfig::default();
        let rows = series(1, datetime!(2024-01-01 08:00 UTC), Duration::minutes(15), 8, |_, _| 10.0);
        let s = ChannelSeries::new(1, &rows).unwrap();
        assert!(channel_excess(&ctx(&config), &s).is_none());
    }
}
