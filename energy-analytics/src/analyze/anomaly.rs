//! IQR outlier runs over a channel's power series.

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use super::{reference_powers, AnalysisContext, ThresholdSource};
use crate::{
    findings::{Finding, FindingKind, Impact, Severity},
    series::ChannelSeries,
    stats::{self, IqrBounds},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyEvent {
    pub channel_id: i64,
    pub direction: Direction,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    /// End of the last flagged interval.
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub intervals: usize,
    pub peak_kw: f64,
    /// Largest distance past the bound, in kW.
    pub peak_deviation_kw: f64,
    pub peak_z_score: f64,
    /// Energy between the readings and the bound they crossed.
    pub excess_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelAnomalies {
    pub channel_id: i64,
    pub bounds: IqrBounds,
    pub threshold_source: ThresholdSource,
    pub events: Vec<AnomalyEvent>,
}

struct Run {
    direction: Direction,
    first: usize,
    last: usize,
}

/// Flag runs of out-of-band readings in `series`.
///
/// Bounds and z-scores come from `baseline` when it is complete enough, else
/// from `series` itself. A run is a sequence of flagged readings on the same
/// side of the band with no spacing wider than the gap limit; runs shorter
/// than `min_run_length` or smaller than `min_excess_kwh` are dropped.
pub fn detect_anomalies(
    ctx: &AnalysisContext<'_>,
    series: &ChannelSeries<'_>,
    baseline: Option<&ChannelSeries<'_>>,
) -> ChannelAnomalies {
    let cfg = &ctx.config.anomaly;
    let (reference, threshold_source) = reference_powers(ctx, series, baseline);
    let bounds = IqrBounds::new(&reference, cfg.iqr_multiplier);
    let mean = stats::mean(&reference);
    let std = stats::std_dev(&reference);

    let interval = series.typical_interval(ctx.expected_interval());
    let max_step = ctx.max_step(interval);
    let readings = series.readings();

    let mut runs: Vec<Run> = Vec::new();
    for (i, r) in readings.iter().enumerate() {
        let direction = match bounds.deviation(r.power_kw) {
            d if d > 0.0 => Direction::Above,
            d if d < 0.0 => Direction::Below,
            _ => continue,
        };
        match runs.last_mut() {
            Some(run) if run.direction == direction && run.last + 1 == i && contiguous(readings[run.last].ts, r.ts, max_step) => {
                run.last = i;
            }
            _ => runs.push(Run { direction, first: i, last: i }),
        }
    }

    let hours = interval.as_seconds_f64() / 3600.0;
    let events: Vec<AnomalyEvent> = runs
        .into_iter()
        .filter(|run| run.last - run.first + 1 >= cfg.min_run_length)
        .map(|run| {
            let points = &readings[run.first..=run.last];
            let mut peak = &points[0];
            let mut excess_kwh = 0.0;
            for p in points {
                let d = bounds.deviation(p.power_kw);
                excess_kwh += d.abs() * hours;
                if d.abs() > bounds.deviation(peak.power_kw).abs() {
                    peak = p;
                }
            }
            AnomalyEvent {
                channel_id: series.channel_id(),
                direction: run.direction,
                start: points[0].ts,
                end: points[points.len() - 1].ts + interval,
                intervals: points.len(),
                peak_kw: peak.power_kw,
                peak_deviation_kw: bounds.deviation(peak.power_kw),
                peak_z_score: stats::z_score(peak.power_kw, mean, std),
                excess_kwh,
            }
        })
        .filter(|e| e.excess_kwh >= cfg.min_excess_kwh)
        .collect();

    tracing::debug!(
        channel_id = series.channel_id(),
        events = events.len(),
        source = ?threshold_source,
        "anomaly detection complete"
    );
    ChannelAnomalies {
        channel_id: series.channel_id(),
        bounds,
        threshold_source,
        events,
    }
}

pub fn anomaly_findings(ctx: &AnalysisContext<'_>, anomalies: &ChannelAnomalies) -> Vec<Finding> {
    let z_threshold = ctx.config.anomaly.z_score_threshold;
    let rate = ctx.config.tariff.flat_rate;
    anomalies
        .events
        .iter()
        .map(|e| {
            let severity = Severity::from_ratio(if z_threshold > 0.0 {
                e.peak_z_score.abs() / z_threshold
            } else {
                f64::INFINITY
            });
            let (word, impact) = match e.direction {
                Direction::Above => ("above", Impact::energy(e.excess_kwh, rate)),
                // reduced consumption costs nothing but may mean a failed load
                Direction::Below => ("below", Impact::default()),
            };
            let bound = match e.direction {
                Direction::Above => anomalies.bounds.upper,
                Direction::Below => anomalies.bounds.lower,
            };
            Finding::new(
                FindingKind::ConsumptionAnomaly,
                severity,
                Some(e.channel_id),
                format!(
                    "Channel {} ran {word} its expected band for {} intervals (peak {:.1} kW vs bound {:.1} kW, z={:.1}, {:.1} kWh)",
                    e.channel_id, e.intervals, e.peak_kw, bound, e.peak_z_score, e.excess_kwh
                ),
            )
            .with_impact(impact)
            .between(e.start, e.end)
        })
        .collect()
}

/// Detect anomalies on every channel; `baseline` is looked up by channel id.
pub fn detect_all<'a>(
    ctx: &AnalysisContext<'_>,
    series: &[ChannelSeries<'a>],
    baseline: impl Fn(i64) -> Option<ChannelSeries<'a>>,
) -> (Vec<AnomalyEvent>, Vec<Finding>) {
    let mut events = Vec::new();
    let mut findings = Vec::new();
    for s in series {
        let b = baseline(s.channel_id());
        let result = detect_anomalies(ctx, s, b.as_ref());
        findings.extend(anomaly_findings(ctx, &result));
        events.extend(result.events);
    }
    (events, findings)
}

/// Whether two flagged readings belong to the same run.
pub(crate) fn contiguous(prev: OffsetDateTime, next: OffsetDateTime, max_step: Duration) -> bool {
    next - prev <= max_step
}
