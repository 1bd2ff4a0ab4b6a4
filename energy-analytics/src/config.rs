use readings_client::domain::Channel;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use time::{Duration, UtcOffset};

use crate::{
    calendar::{BusinessHours, TouSchedule},
    error::ConfigError,
};

/// Thresholds for every analyzer, passed by reference into each call.
///
/// All sections default individually, so a per-site TOML file only has to
/// name the values it overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub site: SiteConfig,
    pub business_hours: BusinessHours,
    pub baseline: BaselineConfig,
    pub sensor_health: SensorHealthConfig,
    pub after_hours: AfterHoursConfig,
    pub anomaly: AnomalyConfig,
    pub spike: SpikeConfig,
    pub tariff: TariffConfig,
    pub tou_schedule: TouSchedule,
    pub demand: DemandConfig,
    pub electrical_health: ElectricalHealthConfig,
    pub quick_wins: QuickWinsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Fixed offset of the site's wall clock from UTC, in minutes.
    pub utc_offset_minutes: i32,
}

impl SiteConfig {
    pub fn utc_offset(&self) -> Result<UtcOffset, ConfigError> {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes * 60).map_err(|_| ConfigError::OutOfRange {
            field: "site.utc_offset_minutes",
            expected: "within +/- 24h",
            value: f64::from(self.utc_offset_minutes),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Length of the comparison window preceding the analysis window.
    pub weeks: u32,
    /// Below this completeness the baseline window is ignored and thresholds
    /// come from the analysis window itself.
    pub min_completeness_pct: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            weeks: 4,
            min_completeness_pct: 70.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorHealthConfig {
    pub expected_interval_minutes: u32,
    pub stale_hours: f64,
    /// `missing_data` fires when more than this share of expected readings is absent.
    pub missing_threshold_pct: f64,
    pub gap_multiplier: f64,
    pub flatline_window_hours: f64,
    /// kW² variance below which a trailing window counts as flat.
    pub flatline_epsilon: f64,
}

impl Default for SensorHealthConfig {
    fn default() -> Self {
        Self {
            expected_interval_minutes: 15,
            stale_hours: 2.0,
            missing_threshold_pct: 10.0,
            gap_multiplier: 2.0,
            flatline_window_hours: 6.0,
            flatline_epsilon: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AfterHoursConfig {
    pub baseline_percentile: f64,
    /// Excess peaks smaller than this are treated as metering noise.
    pub min_power_kw: f64,
    pub min_excess_kwh: f64,
}

impl Default for AfterHoursConfig {
    fn default() -> Self {
        Self {
            baseline_percentile: 5.0,
            min_power_kw: 0.1,
            min_excess_kwh: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub iqr_multiplier: f64,
    pub z_score_threshold: f64,
    pub min_run_length: usize,
    pub min_excess_kwh: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            iqr_multiplier: 3.0,
            z_score_threshold: 3.0,
            min_run_length: 3,
            min_excess_kwh: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeConfig {
    pub baseline_percentile: f64,
    pub multiplier: f64,
    /// Absolute floor for the spike threshold on circuit-level channels.
    pub min_kw: f64,
    /// Absolute floor for site-total channels.
    pub site_min_kw: f64,
    pub min_duration_intervals: usize,
    pub short_cycle: ShortCycleConfig,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            baseline_percentile: 95.0,
            multiplier: 1.5,
            min_kw: 5.0,
            site_min_kw: 20.0,
            min_duration_intervals: 1,
            short_cycle: ShortCycleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortCycleConfig {
    pub window_minutes: u32,
    pub min_transitions: usize,
    /// Fixed on/off threshold. When unset the midpoint of the channel's
    /// 10th and 90th power percentiles is used.
    pub on_threshold_kw: Option<f64>,
    /// Channels whose on/off swing is smaller than this are never cycling.
    pub min_swing_kw: f64,
}

impl Default for ShortCycleConfig {
    fn default() -> Self {
        Self {
            window_minutes: 120,
            min_transitions: 4,
            on_threshold_kw: None,
            min_swing_kw: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TariffConfig {
    /// Flat $/kWh used for waste costing and the flat-vs-TOU comparison.
    pub flat_rate: f64,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self { flat_rate: 0.12 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemandConfig {
    pub rate_per_kw: f64,
    pub billing_period_days: u32,
    /// Billed demand never drops below this share of the historical peak.
    pub ratchet_fraction: f64,
    pub ratchet_months: u32,
    pub shaving_percentages: Vec<f64>,
}

impl DemandConfig {
    /// How far back the ratchet's historical peak reaches.
    pub fn ratchet_lookback(&self) -> Duration {
        Duration::days(i64::from(self.billing_period_days) * i64::from(self.ratchet_months))
    }
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            rate_per_kw: 12.0,
            billing_period_days: 30,
            ratchet_fraction: 0.8,
            ratchet_months: 11,
            shaving_percentages: vec![5.0, 10.0, 15.0, 20.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectricalHealthConfig {
    pub nominal_voltages: Vec<f64>,
    pub voltage_tolerance_pct: f64,
    pub frequency_band: (f64, f64),
    pub thd_current_limit_pct: f64,
    pub neutral_current_elevated_pct: f64,
    pub weights: HealthScoreWeights,
}

impl Default for ElectricalHealthConfig {
    fn default() -> Self {
        Self {
            nominal_voltages: vec![120.0, 208.0, 277.0, 480.0],
            voltage_tolerance_pct: 5.0,
            frequency_band: (59.95, 60.05),
            thd_current_limit_pct: 5.0,
            neutral_current_elevated_pct: 20.0,
            weights: HealthScoreWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthScoreWeights {
    pub voltage: f64,
    pub current: f64,
    pub frequency: f64,
    pub thd: f64,
}

impl Default for HealthScoreWeights {
    fn default() -> Self {
        Self {
            voltage: 0.35,
            current: 0.25,
            frequency: 0.20,
            thd: 0.20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickWinsConfig {
    pub max_count: usize,
    pub min_weekly_kwh: f64,
}

impl Default for QuickWinsConfig {
    fn default() -> Self {
        Self {
            max_count: 10,
            min_weekly_kwh: 10.0,
        }
    }
}

fn check(field: &'static str, expected: &'static str, value: f64, ok: bool) -> Result<(), ConfigError> {
    if ok && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, expected, value })
    }
}

const MINUTES_PER_DAY: u32 = 24 * 60;
const HOURS_PER_YEAR: f64 = 8760.0;
const MAX_GAP_MULTIPLIER: f64 = 100.0;

fn percentile_ok(p: f64) -> bool {
    (0.0..=100.0).contains(&p)
}

impl AnalyticsConfig {
    /// Reject thresholds that would make an analyzer meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.site.utc_offset()?;
        self.business_hours.validate()?;
        self.tou_schedule.validate()?;

        check(
            "baseline.min_completeness_pct",
            "in 0..=100",
            self.baseline.min_completeness_pct,
            percentile_ok(self.baseline.min_completeness_pct),
        )?;

        let sh = &self.sensor_health;
        check(
            "sensor_health.expected_interval_minutes",
            "in 1..=1440",
            f64::from(sh.expected_interval_minutes),
            (1..=MINUTES_PER_DAY).contains(&sh.expected_interval_minutes),
        )?;
        check(
            "sensor_health.stale_hours",
            "in (0, 8760]",
            sh.stale_hours,
            sh.stale_hours > 0.0 && sh.stale_hours <= HOURS_PER_YEAR,
        )?;
        check(
            "sensor_health.missing_threshold_pct",
            "in 0..100",
            sh.missing_threshold_pct,
            (0.0..100.0).contains(&sh.missing_threshold_pct),
        )?;
        check(
            "sensor_health.gap_multiplier",
            "in 1..=100",
            sh.gap_multiplier,
            (1.0..=MAX_GAP_MULTIPLIER).contains(&sh.gap_multiplier),
        )?;
        check(
            "sensor_health.flatline_window_hours",
            "in (0, 8760]",
            sh.flatline_window_hours,
            sh.flatline_window_hours > 0.0 && sh.flatline_window_hours <= HOURS_PER_YEAR,
        )?;
        check("sensor_health.flatline_epsilon", ">= 0", sh.flatline_epsilon, sh.flatline_epsilon >= 0.0)?;

        let ah = &self.after_hours;
        check(
            "after_hours.baseline_percentile",
            "in 0..=100",
            ah.baseline_percentile,
            percentile_ok(ah.baseline_percentile),
        )?;
        check("after_hours.min_power_kw", ">= 0", ah.min_power_kw, ah.min_power_kw >= 0.0)?;
        check("after_hours.min_excess_kwh", ">= 0", ah.min_excess_kwh, ah.min_excess_kwh >= 0.0)?;

        let an = &self.anomaly;
        check("anomaly.iqr_multiplier", ">= 0", an.iqr_multiplier, an.iqr_multiplier >= 0.0)?;
        check("anomaly.z_score_threshold", "> 0", an.z_score_threshold, an.z_score_threshold > 0.0)?;
        check(
            "anomaly.min_run_length",
            ">= 1",
            an.min_run_length as f64,
            an.min_run_length >= 1,
        )?;
        check("anomaly.min_excess_kwh", ">= 0", an.min_excess_kwh, an.min_excess_kwh >= 0.0)?;

        let sp = &self.spike;
        check(
            "spike.baseline_percentile",
            "in 0..=100",
            sp.baseline_percentile,
            percentile_ok(sp.baseline_percentile),
        )?;
        check("spike.multiplier", ">= 1", sp.multiplier, sp.multiplier >= 1.0)?;
        check("spike.min_kw", ">= 0", sp.min_kw, sp.min_kw >= 0.0)?;
        check("spike.site_min_kw", ">= 0", sp.site_min_kw, sp.site_min_kw >= 0.0)?;
        check(
            "spike.min_duration_intervals",
            ">= 1",
            sp.min_duration_intervals as f64,
            sp.min_duration_intervals >= 1,
        )?;
        check(
            "spike.short_cycle.window_minutes",
            "> 0",
            f64::from(sp.short_cycle.window_minutes),
            sp.short_cycle.window_minutes > 0,
        )?;
        check(
            "spike.short_cycle.min_transitions",
            ">= 2",
            sp.short_cycle.min_transitions as f64,
            sp.short_cycle.min_transitions >= 2,
        )?;
        check(
            "spike.short_cycle.min_swing_kw",
            ">= 0",
            sp.short_cycle.min_swing_kw,
            sp.short_cycle.min_swing_kw >= 0.0,
        )?;
        if let Some(kw) = sp.short_cycle.on_threshold_kw {
            check("spike.short_cycle.on_threshold_kw", ">= 0", kw, kw >= 0.0)?;
        }

        check("tariff.flat_rate", ">= 0", self.tariff.flat_rate, self.tariff.flat_rate >= 0.0)?;

        let d = &self.demand;
        check("demand.rate_per_kw", ">= 0", d.rate_per_kw, d.rate_per_kw >= 0.0)?;
        check(
            "demand.billing_period_days",
            "in 1..=366",
            f64::from(d.billing_period_days),
            (1..=366).contains(&d.billing_period_days),
        )?;
        check(
            "demand.ratchet_months",
            "<= 36",
            f64::from(d.ratchet_months),
            d.ratchet_months <= 36,
        )?;
        check(
            "demand.ratchet_fraction",
            "in 0..=1",
            d.ratchet_fraction,
            (0.0..=1.0).contains(&d.ratchet_fraction),
        )?;
        for &pct in &d.shaving_percentages {
            check("demand.shaving_percentages", "in 0..100", pct, (0.0..100.0).contains(&pct))?;
        }

        let eh = &self.electrical_health;
        check(
            "electrical_health.nominal_voltages",
            "non-empty",
            eh.nominal_voltages.len() as f64,
            !eh.nominal_voltages.is_empty(),
        )?;
        check(
            "electrical_health.frequency_band",
            "low < high",
            eh.frequency_band.0,
            eh.frequency_band.0 < eh.frequency_band.1,
        )?;
        check(
            "electrical_health.frequency_band",
            "finite",
            eh.frequency_band.1,
            true,
        )?;

        let qw = &self.quick_wins;
        check("quick_wins.min_weekly_kwh", ">= 0", qw.min_weekly_kwh, qw.min_weekly_kwh >= 0.0)?;

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Questdb,
    Csv,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestDbConfig {
    pub uri: String,
    pub max_connections: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// CSV export path, required when `kind = "csv"`.
    pub csv_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    pub site_id: String,
    pub output_dir: PathBuf,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    /// Highest billed demand of the trailing ratchet window. When unset it is
    /// read from the store, if one is configured.
    pub historical_peak_kw: Option<f64>,
    /// Channel list; when empty it is loaded from the store.
    #[serde(default)]
    pub channels: Vec<Channel>,
}

fn default_window_days() -> u32 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub questdb: Option<QuestDbConfig>,
    pub source: SourceConfig,
    pub report: ReportConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("ANALYTICS_CONFIG").unwrap_or_else(|_| "analytics-config.toml".to_string());
        let contents = fs::read_to_string(&path).map_err(|e| ConfigError::Load(format!("{path}: {e}")))?;
        let cfg = Self::from_toml(&contents)?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.analytics.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AnalyticsConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let cfg = AppConfig::from_toml(
            r#"
            [source]
            kind = "csv"
            csv_path = "readings.csv"

            [report]
            site_id = "23271"
            output_dir = "reports"

            [analytics.anomaly]
            iqr_multiplier = 1.5

            [analytics.business_hours]
            saturday = { start = 8, end = 12 }
            "#,
        )
        .unwrap();

        assert_eq!(cfg.source.kind, SourceKind::Csv);
        assert_eq!(cfg.report.window_days, 7);
        assert_eq!(cfg.analytics.anomaly.iqr_multiplier, 1.5);
        assert_eq!(cfg.analytics.anomaly.min_run_length, 3);
        assert_eq!(cfg.analytics.business_hours.saturday.hours(), 4);
        assert_eq!(cfg.analytics.business_hours.monday.start, 7);
        assert_eq!(cfg.analytics.demand.ratchet_fraction, 0.8);
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let mut cfg = AnalyticsConfig::default();
        cfg.demand.ratchet_fraction = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "demand.ratchet_fraction", .. })
        ));

        let mut cfg = AnalyticsConfig::default();
        cfg.spike.baseline_percentile = 101.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AnalyticsConfig::default();
        cfg.sensor_health.expected_interval_minutes = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_values_that_would_break_the_analyzers() {
        let mut cfg = AnalyticsConfig::default();
        cfg.sensor_health.gap_multiplier = 1e300;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "sensor_health.gap_multiplier", .. })
        ));

        let mut cfg = AnalyticsConfig::default();
        cfg.sensor_health.stale_hours = f64::NAN;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "sensor_health.stale_hours", .. })
        ));

        let mut cfg = AnalyticsConfig::default();
        cfg.sensor_health.expected_interval_minutes = 10_000;
        assert!(cfg.validate().is_err());

        let mut cfg = AnalyticsConfig::default();
        cfg.spike.min_kw = -1.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "spike.min_kw", .. })
        ));

        let mut cfg = AnalyticsConfig::default();
        cfg.spike.min_duration_intervals = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AnalyticsConfig::default();
        cfg.spike.short_cycle.on_threshold_kw = Some(f64::NEG_INFINITY);
        assert!(cfg.validate().is_err());

        let mut cfg = AnalyticsConfig::default();
        cfg.anomaly.min_excess_kwh = -5.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AnalyticsConfig::default();
        cfg.quick_wins.min_weekly_kwh = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = AnalyticsConfig::default();
        cfg.baseline.min_completeness_pct = 120.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AnalyticsConfig::default();
        cfg.demand.billing_period_days = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ratchet_lookback_spans_the_billing_months() {
        let d = DemandConfig::default();
        assert_eq!(d.ratchet_lookback(), Duration::days(330));
    }

    #[test]
    fn example_file_spells_out_the_defaults() {
        let cfg = AppConfig::from_toml(include_str!("../analytics-config.example.toml")).unwrap();
        assert_eq!(cfg.source.kind, SourceKind::Questdb);
        assert_eq!(cfg.questdb.unwrap().max_retries, 3);
        let expected = AnalyticsConfig {
            site: SiteConfig { utc_offset_minutes: -300 },
            ..AnalyticsConfig::default()
        };
        assert_eq!(cfg.analytics, expected);
    }

    #[test]
    fn utc_offset_from_minutes() {
        let site = SiteConfig { utc_offset_minutes: -300 };
        assert_eq!(site.utc_offset().unwrap().whole_hours(), -5);
    }
}
