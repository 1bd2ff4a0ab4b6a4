//! Electrical health screening: voltage, current, frequency, neutral current
//! and current THD, rolled up into a weighted score.
//!
//! The extended fields are optional on [`Reading`]; a section whose field is
//! absent from every row reports `data_available = false` and is left out of
//! the score rather than counted as healthy.

use serde::Serialize;
use time::OffsetDateTime;

use super::AnalysisContext;
use crate::{
    config::ElectricalHealthConfig,
    findings::{Finding, FindingKind, Severity},
    series::ChannelSeries,
    stats,
};
use readings_client::domain::Reading;

const TOP_CURRENT_EVENTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Poor,
    Fair,
    Good,
}

impl Grade {
    fn score(self) -> u32 {
        match self {
            Grade::Good => 100,
            Grade::Fair => 65,
            Grade::Poor => 30,
        }
    }

    /// Lower-is-better metric graded against `(good_below, fair_below)`.
    fn of(value: f64, good_below: f64, fair_below: f64) -> Self {
        if value < good_below {
            Grade::Good
        } else if value < fair_below {
            Grade::Fair
        } else {
            Grade::Poor
        }
    }

    fn overall(score: u32) -> Self {
        if score >= 80 {
            Grade::Good
        } else if score >= 50 {
            Grade::Fair
        } else {
            Grade::Poor
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelVoltage {
    pub channel_id: i64,
    pub min_v: f64,
    pub max_v: f64,
    pub avg_v: f64,
    pub pct_outside_band: f64,
    pub sag_count: usize,
    pub swell_count: usize,
    pub reading_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoltageSection {
    pub data_available: bool,
    pub nominal_v: f64,
    pub low_limit_v: f64,
    pub high_limit_v: f64,
    pub channels: Vec<ChannelVoltage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelCurrent {
    pub channel_id: i64,
    pub peak_a: f64,
    pub avg_a: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub peak_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentEvent {
    pub channel_id: i64,
    pub current_a: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentSection {
    pub data_available: bool,
    pub channels: Vec<ChannelCurrent>,
    pub top_events: Vec<CurrentEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrequencySection {
    pub data_available: bool,
    pub avg_hz: f64,
    pub min_hz: f64,
    pub max_hz: f64,
    pub excursion_count: usize,
    pub excursion_pct: f64,
    pub total_readings: usize,
    pub band_low_hz: f64,
    pub band_high_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelNeutral {
    pub channel_id: i64,
    pub avg_neutral_a: f64,
    pub max_neutral_a: f64,
    pub elevated_count: usize,
    pub reading_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeutralSection {
    pub data_available: bool,
    pub channels: Vec<ChannelNeutral>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelThd {
    pub channel_id: i64,
    pub avg_thd_pct: f64,
    pub max_thd_pct: f64,
    pub above_limit_count: usize,
    pub reading_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThdSection {
    pub data_available: bool,
    pub limit_pct: f64,
    pub channels: Vec<ChannelThd>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComponentScores {
    pub voltage: Option<Grade>,
    pub current: Option<Grade>,
    pub frequency: Option<Grade>,
    pub thd: Option<Grade>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthScore {
    pub grade: Grade,
    pub score: u32,
    pub components: ComponentScores,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElectricalHealthReport {
    pub voltage: VoltageSection,
    pub current: CurrentSection,
    pub frequency: FrequencySection,
    pub neutral: NeutralSection,
    pub thd: ThdSection,
    /// `None` when no section had data.
    pub score: Option<HealthScore>,
    pub findings: Vec<Finding>,
}

fn values(series: &ChannelSeries<'_>, field: impl Fn(&Reading) -> Option<f64>) -> Vec<f64> {
    series.readings().iter().filter_map(&field).filter(|v| v.is_finite()).collect()
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
}

/// Closest standard service voltage to the observed average.
pub fn detect_nominal_voltage(avg_v: f64, nominal: &[f64]) -> f64 {
    nominal
        .iter()
        .copied()
        .min_by(|a, b| (a - avg_v).abs().total_cmp(&(b - avg_v).abs()))
        .unwrap_or(120.0)
}

fn voltage_section(series: &[ChannelSeries<'_>], cfg: &ElectricalHealthConfig) -> VoltageSection {
    let per_channel: Vec<(i64, Vec<f64>)> = series
        .iter()
        .map(|s| (s.channel_id(), values(s, |r| r.voltage_v)))
        .filter(|(_, v)| !v.is_empty())
        .collect();
    let all: Vec<f64> = per_channel.iter().flat_map(|(_, v)| v.iter().copied()).collect();
    let nominal_v = detect_nominal_voltage(stats::mean(&all), &cfg.nominal_voltages);
    let low_limit_v = nominal_v * (1.0 - cfg.voltage_tolerance_pct / 100.0);
    let high_limit_v = nominal_v * (1.0 + cfg.voltage_tolerance_pct / 100.0);

    let channels = per_channel
        .into_iter()
        .map(|(channel_id, v)| {
            let sag_count = v.iter().filter(|x| **x < low_limit_v).count();
            let swell_count = v.iter().filter(|x| **x > high_limit_v).count();
            let (min_v, max_v) = min_max(&v);
            ChannelVoltage {
                channel_id,
                min_v,
                max_v,
                avg_v: stats::mean(&v),
                pct_outside_band: (sag_count + swell_count) as f64 / v.len() as f64 * 100.0,
                sag_count,
                swell_count,
                reading_count: v.len(),
            }
        })
        .collect::<Vec<_>>();
    VoltageSection {
        data_available: !channels.is_empty(),
        nominal_v,
        low_limit_v,
        high_limit_v,
        channels,
    }
}

fn current_section(series: &[ChannelSeries<'_>]) -> CurrentSection {
    let mut channels = Vec::new();
    let mut events = Vec::new();
    for s in series {
        let with_current: Vec<(&Reading, f64)> = s
            .readings()
            .iter()
            .filter_map(|r| r.current_a.filter(|a| a.is_finite()).map(|a| (r, a)))
            .collect();
        let Some((peak_row, peak_a)) = with_current.iter().copied().max_by(|a, b| a.1.total_cmp(&b.1)) else {
            continue;
        };
        channels.push(ChannelCurrent {
            channel_id: s.channel_id(),
            peak_a,
            avg_a: with_current.iter().map(|(_, a)| a).sum::<f64>() / with_current.len() as f64,
            peak_at: peak_row.ts,
        });
        events.extend(with_current.iter().map(|(r, a)| CurrentEvent {
            channel_id: r.channel_id,
            current_a: *a,
            ts: r.ts,
        }));
    }
    events.sort_by(|a, b| b.current_a.total_cmp(&a.current_a).then(a.ts.cmp(&b.ts)));
    events.truncate(TOP_CURRENT_EVENTS);
    CurrentSection {
        data_available: !channels.is_empty(),
        channels,
        top_events: events,
    }
}

fn frequency_section(series: &[ChannelSeries<'_>], cfg: &ElectricalHealthConfig) -> FrequencySection {
    let (band_low_hz, band_high_hz) = cfg.frequency_band;
    let freq: Vec<f64> = series.iter().flat_map(|s| values(s, |r| r.frequency_hz)).collect();
    let excursion_count = freq.iter().filter(|f| **f < band_low_hz || **f > band_high_hz).count();
    let (min_hz, max_hz) = if freq.is_empty() { (0.0, 0.0) } else { min_max(&freq) };
    FrequencySection {
        data_available: !freq.is_empty(),
        avg_hz: stats::mean(&freq),
        min_hz,
        max_hz,
        excursion_count,
        excursion_pct: if freq.is_empty() { 0.0 } else { excursion_count as f64 / freq.len() as f64 * 100.0 },
        total_readings: freq.len(),
        band_low_hz,
        band_high_hz,
    }
}

fn neutral_section(series: &[ChannelSeries<'_>], cfg: &ElectricalHealthConfig) -> NeutralSection {
    let channels: Vec<ChannelNeutral> = series
        .iter()
        .filter_map(|s| {
            let neutral = values(s, |r| r.neutral_current_a);
            if neutral.is_empty() {
                return None;
            }
            let avg_phase = stats::mean(&values(s, |r| r.current_a));
            let limit = avg_phase * cfg.neutral_current_elevated_pct / 100.0;
            let elevated_count = if avg_phase > 0.0 { neutral.iter().filter(|n| **n > limit).count() } else { 0 };
            Some(ChannelNeutral {
                channel_id: s.channel_id(),
                avg_neutral_a: stats::mean(&neutral),
                max_neutral_a: min_max(&neutral).1,
                elevated_count,
                reading_count: neutral.len(),
            })
        })
        .collect();
    NeutralSection {
        data_available: !channels.is_empty(),
        channels,
    }
}

fn thd_section(series: &[ChannelSeries<'_>], cfg: &ElectricalHealthConfig) -> ThdSection {
    let limit = cfg.thd_current_limit_pct;
    let channels: Vec<ChannelThd> = series
        .iter()
        .filter_map(|s| {
            let thd = values(s, |r| r.thd_current);
            (!thd.is_empty()).then(|| ChannelThd {
                channel_id: s.channel_id(),
                avg_thd_pct: stats::mean(&thd),
                max_thd_pct: min_max(&thd).1,
                above_limit_count: thd.iter().filter(|t| **t > limit).count(),
                reading_count: thd.len(),
            })
        })
        .collect();
    ThdSection {
        data_available: !channels.is_empty(),
        limit_pct: limit,
        channels,
    }
}

/// Grade each section that has data and combine them with the configured
/// weights, renormalized over the sections actually scored.
pub fn health_score(
    voltage: &VoltageSection,
    current: &CurrentSection,
    frequency: &FrequencySection,
    thd: &ThdSection,
    cfg: &ElectricalHealthConfig,
) -> Option<HealthScore> {
    let mut components = ComponentScores::default();
    let mut notes = Vec::new();

    if voltage.data_available {
        let outside = stats::mean(&voltage.channels.iter().map(|c| c.pct_outside_band).collect::<Vec<_>>());
        let grade = Grade::of(outside, 2.0, 10.0);
        notes.push(format!(
            "Voltage outside +/-{}% band {outside:.1}% of the time ({grade:?})",
            cfg.voltage_tolerance_pct
        ));
        components.voltage = Some(grade);
    }

    let ratios: Vec<f64> = current
        .channels
        .iter()
        .filter(|c| c.avg_a > 0.0)
        .map(|c| c.peak_a / c.avg_a)
        .collect();
    if !ratios.is_empty() {
        let ratio = stats::mean(&ratios);
        let grade = Grade::of(ratio, 3.0, 5.0);
        notes.push(format!("Peak/avg current ratio {ratio:.1}x ({grade:?})"));
        components.current = Some(grade);
    }

    if frequency.data_available {
        let grade = Grade::of(frequency.excursion_count as f64, 5.0, 20.0);
        notes.push(format!("{} frequency excursions ({grade:?})", frequency.excursion_count));
        components.frequency = Some(grade);
    }

    if thd.data_available {
        let avg = stats::mean(&thd.channels.iter().map(|c| c.avg_thd_pct).collect::<Vec<_>>());
        let grade = Grade::of(avg, 5.0, 8.0);
        notes.push(format!("Average current THD {avg:.1}% ({grade:?})"));
        components.thd = Some(grade);
    }

    let w = &cfg.weights;
    let weighted: Vec<(f64, Grade)> = [
        (w.voltage, components.voltage),
        (w.current, components.current),
        (w.frequency, components.frequency),
        (w.thd, components.thd),
    ]
    .into_iter()
    .filter_map(|(weight, grade)| grade.map(|g| (weight, g)))
    .collect();
    if weighted.is_empty() {
        return None;
    }
    let total_weight: f64 = weighted.iter().map(|(w, _)| w).sum();
    let score = if total_weight > 0.0 {
        (weighted.iter().map(|(w, g)| w * f64::from(g.score())).sum::<f64>() / total_weight).round() as u32
    } else {
        100
    };
    Some(HealthScore {
        grade: Grade::overall(score),
        score,
        components,
        notes,
    })
}

fn component_finding(name: &str, grade: Option<Grade>, detail: String) -> Option<Finding> {
    let severity = match grade? {
        Grade::Good => return None,
        Grade::Fair => Severity::Medium,
        Grade::Poor => Severity::High,
    };
    Some(Finding::new(FindingKind::ElectricalHealth, severity, None, format!("{name}: {detail}")))
}

pub fn analyze_electrical_health(ctx: &AnalysisContext<'_>, series: &[ChannelSeries<'_>]) -> ElectricalHealthReport {
    let cfg = &ctx.config.electrical_health;
    let voltage = voltage_section(series, cfg);
    let current = current_section(series);
    let frequency = frequency_section(series, cfg);
    let neutral = neutral_section(series, cfg);
    let thd = thd_section(series, cfg);
    let score = health_score(&voltage, &current, &frequency, &thd, cfg);

    let mut findings = Vec::new();
    if let Some(s) = &score {
        let c = &s.components;
        let sags: usize = voltage.channels.iter().map(|v| v.sag_count).sum();
        let swells: usize = voltage.channels.iter().map(|v| v.swell_count).sum();
        findings.extend(component_finding(
            "Voltage",
            c.voltage,
            format!("{sags} sags and {swells} swells against {:.0} V nominal", voltage.nominal_v),
        ));
        findings.extend(component_finding(
            "Current",
            c.current,
            "high peak-to-average current indicates demand spikes".to_string(),
        ));
        findings.extend(component_finding(
            "Frequency",
            c.frequency,
            format!(
                "{} readings outside {:.2}-{:.2} Hz",
                frequency.excursion_count, frequency.band_low_hz, frequency.band_high_hz
            ),
        ));
        findings.extend(component_finding(
            "Current THD",
            c.thd,
            format!("average above the {:.1}% limit", thd.limit_pct),
        ));
    }
    for n in neutral.channels.iter().filter(|n| n.elevated_count > 0) {
        let share = n.elevated_count as f64 / n.reading_count as f64;
        let severity = if share >= 0.5 {
            Severity::High
        } else if share >= 0.1 {
            Severity::Medium
        } else {
            Severity::Low
        };
        findings.push(Finding::new(
            FindingKind::ElectricalHealth,
            severity,
            Some(n.channel_id),
            format!(
                "Channel {} neutral current exceeded {}% of phase current in {} of {} readings (max {:.1} A)",
                n.channel_id, cfg.neutral_current_elevated_pct, n.elevated_count, n.reading_count, n.max_neutral_a
            ),
        ));
    }

    tracing::debug!(
        score = score.as_ref().map(|s| s.score),
        findings = findings.len(),
        "electrical health screening complete"
    );
    ElectricalHealthReport {
        voltage,
        current,
        frequency,
        neutral,
        thd,
        score,
        findings,
    }
}
