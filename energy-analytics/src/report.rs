//! Weekly report assembly: runs every analyzer over one window and merges
//! their output into a single document.
//!
//! Malformed input (unordered or mixed rows, invalid thresholds) aborts the
//! whole report. An analyzer that cannot run on otherwise valid input, for
//! example because a window has no readings, is downgraded to a section
//! warning and the rest of the report is still produced.

use std::{collections::BTreeMap, time::Instant};

use readings_client::domain::{Channel, Reading};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    analyze::{
        after_hours, anomaly, cost, electrical, quick_wins, sensor_health, spikes, AfterHoursReport, AnalysisContext,
        AnomalyEvent, CostReport, ElectricalHealthReport, Recommendation, SensorHealthReport, SpikeEvent,
    },
    config::AnalyticsConfig,
    error::{AnalyticsError, Result},
    findings::{Finding, FindingKind, Severity},
    series::{aggregate_load, group_by_channel, validate_load, ChannelSeries, LoadPoint},
    stats::{self, SummaryStats},
    window::{AnalysisWindow, Span},
};

/// Everything one report run needs, already fetched.
#[derive(Debug, Clone)]
pub struct ReportInput<'a> {
    pub site_id: &'a str,
    /// Channels expected to report. Channels that appear only in `readings`
    /// are analyzed too.
    pub channels: &'a [Channel],
    pub readings: &'a [Reading],
    pub baseline_readings: &'a [Reading],
    pub window: AnalysisWindow,
    pub historical_peak_kw: Option<f64>,
    pub generated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionWarning {
    pub section: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub total_energy_kwh: f64,
    pub reading_count: usize,
    pub channel_count: usize,
    /// Distribution of the site load's interval power.
    pub load_kw: SummaryStats,
    /// Highest average power over any trailing hour of the site load.
    pub peak_hour_avg_kw: f64,
    /// Median of the non-zero site load.
    pub typical_operating_kw: f64,
    /// Site load intervals outside the anomaly IQR band.
    pub load_outlier_intervals: usize,
    /// Missing, stale and flatline findings.
    pub data_quality_issues: usize,
    pub findings_by_kind: BTreeMap<FindingKind, usize>,
    pub findings_by_severity: BTreeMap<Severity, usize>,
    pub weekly_savings_usd: f64,
    pub annual_savings_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpikeSection {
    pub events: Vec<SpikeEvent>,
    pub short_cycling: Vec<spikes::ShortCycling>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyReport {
    /// Fingerprint of the inputs and thresholds; identical runs share an id.
    pub report_id: String,
    pub site_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub window: AnalysisWindow,
    pub summary: ReportSummary,
    pub sensor_health: Option<SensorHealthReport>,
    pub after_hours: Option<AfterHoursReport>,
    pub anomalies: Option<Vec<AnomalyEvent>>,
    pub spikes: Option<SpikeSection>,
    pub costs: Option<CostReport>,
    pub electrical_health: Option<ElectricalHealthReport>,
    pub findings: Vec<Finding>,
    pub quick_wins: Vec<Recommendation>,
    pub warnings: Vec<SectionWarning>,
}

fn hash_f64(hasher: &mut blake3::Hasher, v: f64) {
    hasher.update(&v.to_bits().to_le_bytes());
}

fn hash_opt_f64(hasher: &mut blake3::Hasher, v: Option<f64>) {
    match v {
        Some(x) => {
            hasher.update(&[1]);
            hash_f64(hasher, x);
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_reading(hasher: &mut blake3::Hasher, r: &Reading) {
    hasher.update(&r.channel_id.to_le_bytes());
    hasher.update(&r.ts.unix_timestamp_nanos().to_le_bytes());
    hash_f64(hasher, r.energy_kwh);
    hash_f64(hasher, r.power_kw);
    hash_opt_f64(hasher, r.voltage_v);
    hash_opt_f64(hasher, r.current_a);
    hash_opt_f64(hasher, r.power_factor);
    hash_opt_f64(hasher, r.frequency_hz);
    hash_opt_f64(hasher, r.neutral_current_a);
    hash_opt_f64(hasher, r.thd_current);
}

fn hash_span(hasher: &mut blake3::Hasher, span: &Span) {
    hasher.update(&span.start.unix_timestamp_nanos().to_le_bytes());
    hasher.update(&span.end.unix_timestamp_nanos().to_le_bytes());
}

fn hash_serialized<T: Serialize>(hasher: &mut blake3::Hasher, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| AnalyticsError::Fingerprint(e.to_string()))?;
    hasher.update(&bytes);
    Ok(())
}

/// Deterministic report id over site, window, rows and thresholds.
/// `generated_at` is deliberately left out.
pub fn report_id(input: &ReportInput<'_>, config: &AnalyticsConfig) -> Result<String> {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, input.site_id);
    hash_span(&mut h, &input.window.current);
    match &input.window.baseline {
        Some(b) => {
            h.update(&[1]);
            hash_span(&mut h, b);
        }
        None => {
            h.update(&[0]);
        }
    }
    hash_opt_f64(&mut h, input.historical_peak_kw);
    h.update(&(input.readings.len() as u64).to_le_bytes());
    for r in input.readings {
        hash_reading(&mut h, r);
    }
    h.update(&(input.baseline_readings.len() as u64).to_le_bytes());
    for r in input.baseline_readings {
        hash_reading(&mut h, r);
    }
    hash_serialized(&mut h, config)?;
    Ok(h.finalize().to_hex().to_string())
}

/// Collects section outcomes, timing each analyzer and turning failures into
/// warnings.
struct Sections {
    findings: Vec<Finding>,
    warnings: Vec<SectionWarning>,
}

impl Sections {
    fn run<T>(&mut self, section: &'static str, f: impl FnOnce() -> Result<(T, Vec<Finding>)>) -> Option<T> {
        let started = Instant::now();
        let outcome = f();
        metrics::histogram!("analytics_analyzer_duration_seconds", "analyzer" => section)
            .record(started.elapsed().as_secs_f64());
        match outcome {
            Ok((value, mut findings)) => {
                tracing::debug!(section, findings = findings.len(), "section complete");
                self.findings.append(&mut findings);
                Some(value)
            }
            Err(e) => {
                tracing::warn!(section, error = %e, "section skipped");
                metrics::counter!("analytics_section_failures_total", "section" => section).increment(1);
                self.warnings.push(SectionWarning {
                    section,
                    message: e.to_string(),
                });
                None
            }
        }
    }
}

fn require_readings(what: &'static str, have: usize) -> Result<()> {
    if have == 0 {
        return Err(AnalyticsError::InsufficientData { what, needed: 1, have });
    }
    Ok(())
}

fn in_span(rows: &[Reading], span: Option<Span>) -> Vec<Reading> {
    match span {
        Some(span) => rows.iter().filter(|r| span.contains(r.ts)).cloned().collect(),
        None => Vec::new(),
    }
}

fn validated<'a>(groups: &'a BTreeMap<i64, Vec<Reading>>) -> Result<Vec<ChannelSeries<'a>>> {
    groups
        .iter()
        .map(|(id, rows)| ChannelSeries::new(*id, rows))
        .collect()
}

/// Site load for the cost model: the site-total channels when any reported,
/// else the sum of every channel.
fn site_load(channels: &[Channel], series: &[ChannelSeries<'_>]) -> Result<Vec<LoadPoint>> {
    let totals: Vec<ChannelSeries<'_>> = series
        .iter()
        .filter(|s| channels.iter().any(|c| c.channel_id == s.channel_id() && c.is_site_total))
        .copied()
        .collect();
    let load = if totals.is_empty() {
        aggregate_load(series.iter().copied())
    } else {
        aggregate_load(totals)
    };
    validate_load(&load)?;
    Ok(load)
}

fn load_summary(load: &[LoadPoint], config: &AnalyticsConfig) -> (SummaryStats, f64, f64, usize) {
    let powers: Vec<f64> = load.iter().map(|p| p.power_kw).collect();
    let per_hour = (60 / config.sensor_health.expected_interval_minutes).max(1) as usize;
    let peak_hour_avg_kw = stats::rolling_stats(&powers, per_hour.min(powers.len()))
        .iter()
        .map(|r| r.mean)
        .fold(0.0, f64::max);
    let outliers = stats::detect_outliers(&powers, config.anomaly.iqr_multiplier)
        .iter()
        .filter(|p| p.is_outlier)
        .count();
    (
        SummaryStats::of(&powers),
        peak_hour_avg_kw,
        stats::non_zero_percentile(&powers, 50.0),
        outliers,
    )
}

/// Run every analyzer and assemble the report.
pub fn build_report(input: &ReportInput<'_>, config: &AnalyticsConfig) -> Result<WeeklyReport> {
    config.validate()?;
    let ctx = AnalysisContext::new(config, input.window)?;
    let report_id = report_id(input, config)?;

    let current_rows = in_span(input.readings, Some(input.window.current));
    let baseline_rows = in_span(input.baseline_readings, input.window.baseline);
    let current_groups = group_by_channel(&current_rows);
    let baseline_groups = group_by_channel(&baseline_rows);
    let series = validated(&current_groups)?;
    let baseline = validated(&baseline_groups)?;
    let baseline_for = |id: i64| baseline.iter().find(|b| b.channel_id() == id).copied();
    let is_site_total = |id: i64| input.channels.iter().any(|c| c.channel_id == id && c.is_site_total);

    let load = site_load(input.channels, &series)?;
    tracing::info!(
        site_id = input.site_id,
        report_id = %report_id,
        channels = series.len(),
        readings = current_rows.len(),
        baseline_readings = baseline_rows.len(),
        "building report"
    );

    let mut sections = Sections {
        findings: Vec::new(),
        warnings: Vec::new(),
    };

    let expected: Vec<i64> = input.channels.iter().map(|c| c.channel_id).collect();
    let sensor_health = sections.run("sensor_health", || {
        let r = sensor_health::analyze_sensor_health(
            &expected,
            &series,
            &ctx.window.current,
            &config.sensor_health,
            ctx.offset,
        );
        let f = r.findings.clone();
        Ok((r, f))
    });

    let after_hours = sections.run("after_hours", || {
        require_readings("after-hours analysis", current_rows.len())?;
        let r = after_hours::analyze_after_hours(&ctx, &series);
        let f = r.findings.clone();
        Ok((r, f))
    });

    let anomalies = sections.run("anomalies", || {
        require_readings("anomaly detection", current_rows.len())?;
        Ok(anomaly::detect_all(&ctx, &series, baseline_for))
    });

    let spikes = sections.run("spikes", || {
        require_readings("spike detection", current_rows.len())?;
        let mut events = Vec::new();
        let mut short_cycling = Vec::new();
        let mut findings = Vec::new();
        for s in &series {
            let result = spikes::detect_spikes(&ctx, s, baseline_for(s.channel_id()).as_ref(), is_site_total(s.channel_id()));
            findings.extend(spikes::spike_findings(&ctx, &result));
            events.extend(result.events);
            if let Some(cycling) = spikes::detect_short_cycling(&ctx, s) {
                findings.push(spikes::short_cycling_finding(&ctx, &cycling));
                short_cycling.push(cycling);
            }
        }
        Ok((SpikeSection { events, short_cycling }, findings))
    });

    let costs = sections.run("costs", || {
        let r = cost::analyze_costs(&ctx, &load, input.historical_peak_kw)?;
        let f = r.findings.clone();
        Ok((r, f))
    });

    let electrical_health = sections.run("electrical_health", || {
        require_readings("electrical health screening", current_rows.len())?;
        let r = electrical::analyze_electrical_health(&ctx, &series);
        let f = r.findings.clone();
        Ok((r, f))
    });

    let Sections { mut findings, warnings } = sections;
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(a.kind.cmp(&b.kind))
            .then(a.channel_id.cmp(&b.channel_id))
            .then(a.start.cmp(&b.start))
    });
    for f in &findings {
        metrics::counter!("analytics_findings_total", "kind" => f.kind.as_str()).increment(1);
    }

    let quick_wins = quick_wins::rank_quick_wins(&ctx, &findings);

    let mut findings_by_kind: BTreeMap<FindingKind, usize> = BTreeMap::new();
    let mut findings_by_severity: BTreeMap<Severity, usize> = BTreeMap::new();
    for f in &findings {
        *findings_by_kind.entry(f.kind).or_default() += 1;
        *findings_by_severity.entry(f.severity).or_default() += 1;
    }
    let (load_kw, peak_hour_avg_kw, typical_operating_kw, load_outlier_intervals) = load_summary(&load, config);
    let summary = ReportSummary {
        total_energy_kwh: load.iter().map(|p| p.energy_kwh).sum(),
        reading_count: current_rows.len(),
        channel_count: series.len(),
        load_kw,
        peak_hour_avg_kw,
        typical_operating_kw,
        load_outlier_intervals,
        data_quality_issues: findings.iter().filter(|f| f.kind.is_data_quality()).count(),
        findings_by_kind,
        findings_by_severity,
        weekly_savings_usd: quick_wins.iter().map(|q| q.weekly_usd).sum(),
        annual_savings_usd: quick_wins.iter().map(|q| q.annual_usd).sum(),
    };

    tracing::info!(
        report_id = %report_id,
        findings = findings.len(),
        quick_wins = quick_wins.len(),
        warnings = warnings.len(),
        "report built"
    );
    Ok(WeeklyReport {
        report_id,
        site_id: input.site_id.to_string(),
        generated_at: input.generated_at,
        window: input.window,
        summary,
        sensor_health,
        after_hours,
        anomalies,
        spikes,
        costs,
        electrical_health,
        findings,
        quick_wins,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::fixtures::series;
    use time::{macros::datetime, Duration, UtcOffset};

    // Monday
    const T0: OffsetDateTime = datetime!(2024-01-08 00:00 UTC);

    fn channels() -> Vec<Channel> {
        vec![
            Channel {
                channel_id: 1,
                channel_name: "Main".to_string(),
                site_id: Some("site-a".to_string()),
                is_site_total: true,
            },
            Channel {
                channel_id: 2,
                channel_name: "RTU-1".to_string(),
                site_id: Some("site-a".to_string()),
                is_site_total: false,
            },
            Channel {
                channel_id: 3,
                channel_name: "Lighting".to_string(),
                site_id: Some("site-a".to_string()),
                is_site_total: false,
            },
        ]
    }

    fn week(channel_id: i64, start: OffsetDateTime, scale: f64) -> Vec<Reading> {
        let hours = AnalyticsConfig::default().business_hours;
        series(channel_id, start, Duration::minutes(15), 96 * 7, |i, ts| {
            let base = if hours.is_business_hours(ts, UtcOffset::UTC) { 10.0 } else { 2.0 };
            scale * (base + (i % 4) as f64 * 0.25)
        })
    }

    fn window() -> AnalysisWindow {
        AnalysisWindow::new(T0, T0 + Duration::weeks(1)).unwrap().with_baseline_weeks(1)
    }

    fn input<'a>(channels: &'a [Channel], readings: &'a [Reading], baseline: &'a [Reading]) -> ReportInput<'a> {
        ReportInput {
            site_id: "site-a",
            channels,
            readings,
            baseline_readings: baseline,
            window: window(),
            historical_peak_kw: Some(40.0),
            generated_at: datetime!(2024-01-15 06:00 UTC),
        }
    }

    #[test]
    fn full_week_produces_every_section() {
        let channels = channels();
        let readings = [week(1, T0, 3.0), week(2, T0, 1.0)].concat();
        let baseline = [week(1, T0 - Duration::weeks(1), 3.0), week(2, T0 - Duration::weeks(1), 1.0)].concat();
        let config = AnalyticsConfig::default();

        let report = build_report(&input(&channels, &readings, &baseline), &config).unwrap();
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert!(report.sensor_health.is_some());
        assert!(report.after_hours.is_some());
        assert!(report.anomalies.is_some());
        assert!(report.spikes.is_some());
        assert!(report.electrical_health.is_some());
        assert_eq!(report.summary.channel_count, 2);
        assert_eq!(report.summary.reading_count, 2 * 96 * 7);

        // channel 3 never reported
        assert!(report
            .findings
            .iter()
            .any(|f| f.kind == FindingKind::MissingData && f.channel_id == Some(3)));
        // cost model runs on the site-total channel only
        let costs = report.costs.unwrap();
        let main_kwh: f64 = readings.iter().filter(|r| r.channel_id == 1).map(|r| r.energy_kwh).sum();
        assert!((costs.tou.total_kwh - main_kwh).abs() < 1e-6);
        assert!(costs.demand.billed_demand_kw >= 0.8 * 40.0);

        assert!(report.findings.windows(2).all(|w| w[0].severity >= w[1].severity));
        assert!(report.quick_wins.len() <= config.quick_wins.max_count);
    }

    #[test]
    fn report_id_is_deterministic() {
        let channels = channels();
        let readings = week(1, T0, 1.0);
        let config = AnalyticsConfig::default();

        let a = build_report(&input(&channels, &readings, &[]), &config).unwrap();
        let mut later = input(&channels, &readings, &[]);
        later.generated_at += Duration::hours(3);
        let b = build_report(&later, &config).unwrap();
        assert_eq!(a.report_id, b.report_id);

        let mut changed = readings.clone();
        changed[10].power_kw += 1.0;
        let c = build_report(&input(&channels, &changed, &[]), &config).unwrap();
        assert_ne!(a.report_id, c.report_id);

        let mut tuned = config.clone();
        tuned.spike.multiplier = 2.0;
        let d = build_report(&input(&channels, &readings, &[]), &tuned).unwrap();
        assert_ne!(a.report_id, d.report_id);
    }

    #[test]
    fn summary_describes_the_site_load() {
        let channels = channels();
        let mut readings = [week(1, T0, 1.0), week(2, T0, 1.0)].concat();
        // one hour at 50 kW on the site-total channel, Tuesday 14:00
        for r in readings.iter_mut().filter(|r| r.channel_id == 1) {
            if r.ts >= T0 + Duration::hours(38) && r.ts < T0 + Duration::hours(39) {
                r.power_kw = 50.0;
                r.energy_kwh = 12.5;
            }
        }
        let report = build_report(&input(&channels, &readings, &[]), &AnalyticsConfig::default()).unwrap();
        let s = &report.summary;

        assert_eq!(s.load_kw.count, 96 * 7);
        assert_eq!(s.load_kw.max, 50.0);
        assert_eq!(s.peak_hour_avg_kw, 50.0);
        assert!(s.typical_operating_kw > 2.0 && s.typical_operating_kw < 11.0);
        assert_eq!(s.load_outlier_intervals, 4);
        // channel 3 never reported
        assert!(s.data_quality_issues >= 1);
        let data_quality = report.findings.iter().filter(|f| f.kind.is_data_quality()).count();
        assert_eq!(s.data_quality_issues, data_quality);
    }

    #[test]
    fn unserializable_fingerprint_input_is_an_error() {
        use std::collections::HashMap;

        let mut h = blake3::Hasher::new();
        let keyed_by_pair: HashMap<(i64, i64), f64> = [((1, 2), 3.0)].into_iter().collect();
        assert!(matches!(
            hash_serialized(&mut h, &keyed_by_pair),
            Err(AnalyticsError::Fingerprint(_))
        ));
        assert!(hash_serialized(&mut h, &AnalyticsConfig::default()).is_ok());
    }

    #[test]
    fn empty_window_downgrades_sections_to_warnings() {
        let channels = channels();
        let config = AnalyticsConfig::default();
        let report = build_report(&input(&channels, &[], &[]), &config).unwrap();

        let skipped: Vec<_> = report.warnings.iter().map(|w| w.section).collect();
        assert!(skipped.contains(&"costs"));
        assert!(skipped.contains(&"after_hours"));
        assert!(report.costs.is_none());
        // every expected channel is reported missing
        let sensor = report.sensor_health.unwrap();
        assert_eq!(sensor.channels_with_issues, 3);
    }

    #[test]
    fn unordered_rows_abort_the_report() {
        let channels = channels();
        let mut readings = week(2, T0, 1.0);
        readings.swap(3, 4);
        let config = AnalyticsConfig::default();
        assert!(matches!(
            build_report(&input(&channels, &readings, &[]), &config),
            Err(AnalyticsError::NonMonotonicTimestamps { channel_id: 2, .. })
        ));
    }

    #[test]
    fn invalid_config_aborts_the_report() {
        let channels = channels();
        let mut config = AnalyticsConfig::default();
        config.tou_schedule.periods.clear();
        assert!(matches!(
            build_report(&input(&channels, &[], &[]), &config),
            Err(AnalyticsError::Config(_))
        ));
    }

    #[test]
    fn report_serializes_to_json() {
        let channels = channels();
        let readings = week(1, T0, 1.0);
        let report = build_report(&input(&channels, &readings, &[]), &AnalyticsConfig::default()).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["site_id"], "site-a");
        assert_eq!(json["window"]["current"]["start"], "2024-01-08T00:00:00Z");
        assert!(json["summary"]["findings_by_kind"].is_object());
    }
}
