//! Demand spikes above a percentile threshold, and short cycling.

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use super::{anomaly::contiguous, reference_powers, AnalysisContext, ThresholdSource};
use crate::{
    findings::{Finding, FindingKind, Impact, Severity},
    series::ChannelSeries,
    stats,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpikeEvent {
    pub channel_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub intervals: usize,
    pub peak_kw: f64,
    pub threshold_kw: f64,
    pub excess_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSpikes {
    pub channel_id: i64,
    /// Percentile of the reference readings before the multiplier.
    pub reference_kw: f64,
    pub threshold_kw: f64,
    pub threshold_source: ThresholdSource,
    pub events: Vec<SpikeEvent>,
}

/// Readings strictly above `max(percentile * multiplier, floor)` are spikes;
/// a reading exactly at the threshold is not. Adjacent spiking intervals
/// merge into one event, and events shorter than `min_duration_intervals`
/// are dropped.
pub fn detect_spikes(
    ctx: &AnalysisContext<'_>,
    series: &ChannelSeries<'_>,
    baseline: Option<&ChannelSeries<'_>>,
    is_site_total: bool,
) -> ChannelSpikes {
    let cfg = &ctx.config.spike;
    let (reference, threshold_source) = reference_powers(ctx, series, baseline);
    let reference_kw = stats::percentile(&reference, cfg.baseline_percentile);
    let floor = if is_site_total { cfg.site_min_kw } else { cfg.min_kw };
    let threshold_kw = (reference_kw * cfg.multiplier).max(floor);

    let interval = series.typical_interval(ctx.expected_interval());
    let hours = interval.as_seconds_f64() / 3600.0;
    let max_step = ctx.max_step(interval);

    let mut events: Vec<SpikeEvent> = Vec::new();
    let mut prev_spiking: Option<OffsetDateTime> = None;
    for r in series.readings() {
        if r.power_kw <= threshold_kw {
            prev_spiking = None;
            continue;
        }
        let excess = (r.power_kw - threshold_kw) * hours;
        match (prev_spiking, events.last_mut()) {
            (Some(prev), Some(event)) if contiguous(prev, r.ts, max_step) => {
                event.end = r.ts + interval;
                event.intervals += 1;
                event.peak_kw = event.peak_kw.max(r.power_kw);
                event.excess_kwh += excess;
            }
            _ => events.push(SpikeEvent {
                channel_id: series.channel_id(),
                start: r.ts,
                end: r.ts + interval,
                intervals: 1,
                peak_kw: r.power_kw,
                threshold_kw,
                excess_kwh: excess,
            }),
        }
        prev_spiking = Some(r.ts);
    }
    events.retain(|e| e.intervals >= cfg.min_duration_intervals);

    tracing::debug!(
        channel_id = series.channel_id(),
        threshold_kw,
        events = events.len(),
        "spike detection complete"
    );
    ChannelSpikes {
        channel_id: series.channel_id(),
        reference_kw,
        threshold_kw,
        threshold_source,
        events,
    }
}

pub fn spike_findings(ctx: &AnalysisContext<'_>, spikes: &ChannelSpikes) -> Vec<Finding> {
    let rate = ctx.config.tariff.flat_rate;
    spikes
        .events
        .iter()
        .map(|e| {
            let ratio = if e.threshold_kw > 0.0 { e.peak_kw / e.threshold_kw } else { f64::INFINITY };
            Finding::new(
                FindingKind::DemandSpike,
                Severity::from_ratio(ratio),
                Some(e.channel_id),
                format!(
                    "Channel {} peaked at {:.1} kW against a {:.1} kW spike threshold for {} interval(s)",
                    e.channel_id, e.peak_kw, e.threshold_kw, e.intervals
                ),
            )
            .with_impact(Impact {
                demand_kw: Some(e.peak_kw - e.threshold_kw),
                ..Impact::energy(e.excess_kwh, rate)
            })
            .between(e.start, e.end)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleEpisode {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub transitions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShortCycling {
    pub channel_id: i64,
    pub on_threshold_kw: f64,
    pub total_transitions: usize,
    /// Most transitions seen inside any single window.
    pub max_transitions_in_window: usize,
    pub episodes: Vec<CycleEpisode>,
}

/// Find stretches where the channel flips between on and off at least
/// `min_transitions` times within `window_minutes`.
///
/// On/off is decided against a fixed threshold or, by default, the midpoint
/// of the 10th and 90th power percentiles. Channels whose swing between those
/// percentiles is under `min_swing_kw` never cycle.
pub fn detect_short_cycling(ctx: &AnalysisContext<'_>, series: &ChannelSeries<'_>) -> Option<ShortCycling> {
    let cfg = &ctx.config.spike.short_cycle;
    let powers = series.powers();
    let p10 = stats::percentile(&powers, 10.0);
    let p90 = stats::percentile(&powers, 90.0);
    if p90 - p10 < cfg.min_swing_kw {
        return None;
    }
    let on_threshold_kw = cfg.on_threshold_kw.unwrap_or((p10 + p90) / 2.0);

    let readings = series.readings();
    let transitions: Vec<OffsetDateTime> = readings
        .windows(2)
        .filter(|w| (w[0].power_kw > on_threshold_kw) != (w[1].power_kw > on_threshold_kw))
        .map(|w| w[1].ts)
        .collect();

    let window = Duration::minutes(i64::from(cfg.window_minutes));
    let mut episodes: Vec<CycleEpisode> = Vec::new();
    let mut max_in_window = 0;
    let mut hi = 0;
    for (lo, start) in transitions.iter().enumerate() {
        hi = hi.max(lo);
        while hi + 1 < transitions.len() && transitions[hi + 1] - *start <= window {
            hi += 1;
        }
        let count = hi - lo + 1;
        max_in_window = max_in_window.max(count);
        if count < cfg.min_transitions {
            continue;
        }
        match episodes.last_mut() {
            Some(ep) if *start <= ep.end => ep.end = ep.end.max(transitions[hi]),
            _ => episodes.push(CycleEpisode {
                start: *start,
                end: transitions[hi],
                transitions: 0,
            }),
        }
    }
    if episodes.is_empty() {
        return None;
    }
    for ep in &mut episodes {
        ep.transitions = transitions.iter().filter(|t| **t >= ep.start && **t <= ep.end).count();
    }

    tracing::debug!(
        channel_id = series.channel_id(),
        episodes = episodes.len(),
        max_in_window,
        "short cycling detected"
    );
    Some(ShortCycling {
        channel_id: series.channel_id(),
        on_threshold_kw,
        total_transitions: transitions.len(),
        max_transitions_in_window: max_in_window,
        episodes,
    })
}

pub fn short_cycling_finding(ctx: &AnalysisContext<'_>, cycling: &ShortCycling) -> Finding {
    let cfg = &ctx.config.spike.short_cycle;
    let ratio = cycling.max_transitions_in_window as f64 / cfg.min_transitions.max(1) as f64;
    let mut finding = Finding::new(
        FindingKind::ShortCycling,
        Severity::from_ratio(ratio),
        Some(cycling.channel_id),
        format!(
            "Channel {} switched on/off up to {} times within {} minutes across {} episode(s)",
            cycling.channel_id,
            cycling.max_transitions_in_window,
            cfg.window_minutes,
            cycling.episodes.len()
        ),
    );
    if let (Some(first), Some(last)) = (cycling.episodes.first(), cycling.episodes.last()) {
        finding = finding.between(first.start, last.end);
    }
    finding
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AnalyticsConfig, series::fixtures::series, window::AnalysisWindow};
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-01-01 00:00 UTC);

    fn ctx(config: &AnalyticsConfig) -> AnalysisContext<'_> {
        AnalysisContext::new(config, AnalysisWindow::new(T0, T0 + Duration::DAY).unwrap()).unwrap()
    }

    fn unfloored() -> AnalyticsConfig {
        let mut config = AnalyticsConfig::default();
        config.spike.min_kw = 0.0;
        config.spike.site_min_kw = 0.0;
        config
    }

    #[test]
    fn reading_at_threshold_is_not_a_spike() {
        let config = unfloored();
        // p95 of 95 x 10 kW plus one outlier is 10 kW, threshold 15 kW
        let rows = series(1, T0, Duration::minutes(15), 96, |i, _| if i == 50 { 15.0 } else { 10.0 });
        let s = ChannelSeries::new(1, &rows).unwrap();
        let result = detect_spikes(&ctx(&config), &s, None, false);
        assert_eq!(result.threshold_kw, 15.0);
        assert!(result.events.is_empty());

        let rows = series(1, T0, Duration::minutes(15), 96, |i, _| if i == 50 { 15.01 } else { 10.0 });
        let s = ChannelSeries::new(1, &rows).unwrap();
        let result = detect_spikes(&ctx(&config), &s, None, false);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].start, rows[50].ts);
    }

    #[test]
    fn adjacent_intervals_merge() {
        let config = unfloored();
        let rows = series(1, T0, Duration::minutes(15), 96, |i, _| match i {
            30..=32 => 25.0,
            33 => 30.0,
            _ => 10.0,
        });
        let s = ChannelSeries::new(1, &rows).unwrap();
        let result = detect_spikes(&ctx(&config), &s, None, false);
        assert_eq!(result.events.len(), 1);
        let e = &result.events[0];
        assert_eq!(e.intervals, 4);
        assert_eq!(e.peak_kw, 30.0);
        assert_eq!(e.end, rows[33].ts + Duration::minutes(15));
        // (10 + 10 + 10 + 15) kW over 15 minutes
        assert!((e.excess_kwh - 45.0 * 0.25).abs() < 1e-9);

        let findings = spike_findings(&ctx(&config), &result);
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].impact.demand_kw, Some(15.0));
    }

    #[test]
    fn floor_suppresses_small_channels() {
        let config = AnalyticsConfig::default();
        let rows = series(1, T0, Duration::minutes(15), 96, |i, _| if i == 50 { 3.0 } else { 0.5 });
        let s = ChannelSeries::new(1, &rows).unwrap();
        let result = detect_spikes(&ctx(&config), &s, None, false);
        assert_eq!(result.threshold_kw, 5.0);
        assert!(result.events.is_empty());

        let rows = series(1, T0, Duration::minutes(15), 96, |i, _| if i == 50 { 18.0 } else { 8.0 });
        let s = ChannelSeries::new(1, &rows).unwrap();
        assert_eq!(detect_spikes(&ctx(&config), &s, None, false).events.len(), 1);
        assert!(detect_spikes(&ctx(&config), &s, None, true).events.is_empty());
    }

    #[test]
    fn minimum_duration_filters_single_intervals() {
        let mut config = unfloored();
        config.spike.min_duration_intervals = 2;
        let rows = series(1, T0, Duration::minutes(15), 96, |i, _| if i == 50 { 30.0 } else { 10.0 });
        let s = ChannelSeries::new(1, &rows).unwrap();
        assert!(detect_spikes(&ctx(&config), &s, None, false).events.is_empty());
    }

    #[test]
    fn rapid_toggling_is_short_cycling() {
        let config = AnalyticsConfig::default();
        let rows = series(1, T0, Duration::minutes(15), 96, |i, _| match i {
            0..=39 => 2.0,
            40..=47 if i % 2 == 1 => 8.0,
            40..=47 => 2.0,
            _ => 8.0,
        });
        let s = ChannelSeries::new(1, &rows).unwrap();
        let cycling = detect_short_cycling(&ctx(&config), &s).unwrap();

        assert_eq!(cycling.on_threshold_kw, 5.0);
        assert_eq!(cycling.total_transitions, 7);
        assert_eq!(cycling.max_transitions_in_window, 7);
        assert_eq!(cycling.episodes.len(), 1);
        assert_eq!(cycling.episodes[0].start, rows[41].ts);
        assert_eq!(cycling.episodes[0].end, rows[47].ts);
        assert_eq!(cycling.episodes[0].transitions, 7);

        let finding = short_cycling_finding(&ctx(&config), &cycling);
        assert_eq!(finding.severity, Severity::Medium);
    }

    #[test]
    fn single_step_is_not_cycling() {
        let config = AnalyticsConfig::default();
        let rows = series(1, T0, Duration::minutes(15), 96, |i, _| if i < 48 { 2.0 } else { 8.0 });
        let s = ChannelSeries::new(1, &rows).unwrap();
        assert!(detect_short_cycling(&ctx(&config), &s).is_none());

        let flat = series(1, T0, Duration::minutes(15), 96, |i, _| 5.0 + (i % 2) as f64 * 0.1);
        let s = ChannelSeries::new(1, &flat).unwrap();
        assert!(detect_short_cycling(&ctx(&config), &s).is_none());
    }
}
