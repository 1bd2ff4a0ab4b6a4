use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    MissingData,
    #[serde(rename = "stale")]
    StaleData,
    Flatline,
    AfterHoursWaste,
    ConsumptionAnomaly,
    DemandSpike,
    ShortCycling,
    TouLoadShift,
    DemandCharge,
    ElectricalHealth,
}

impl FindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingKind::MissingData => "missing_data",
            FindingKind::StaleData => "stale",
            FindingKind::Flatline => "flatline",
            FindingKind::AfterHoursWaste => "after_hours_waste",
            FindingKind::ConsumptionAnomaly => "consumption_anomaly",
            FindingKind::DemandSpike => "demand_spike",
            FindingKind::ShortCycling => "short_cycling",
            FindingKind::TouLoadShift => "tou_load_shift",
            FindingKind::DemandCharge => "demand_charge",
            FindingKind::ElectricalHealth => "electrical_health",
        }
    }

    /// Sensor and communication problems rather than energy opportunities.
    pub fn is_data_quality(self) -> bool {
        matches!(
            self,
            FindingKind::MissingData | FindingKind::StaleData | FindingKind::Flatline
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Grade by how far a metric has passed its threshold: `ratio` is
    /// metric / threshold, so 1.0 is exactly at the threshold.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 2.0 {
            Severity::High
        } else if ratio >= 1.5 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Ordering for recommendations, independent of how severe the underlying
/// finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Quantified effect of a finding over the analysis window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Impact {
    pub energy_kwh: f64,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demand_kw: Option<f64>,
}

impl Impact {
    pub fn energy(energy_kwh: f64, rate: f64) -> Self {
        Self {
            energy_kwh,
            cost_usd: energy_kwh * rate,
            demand_kw: None,
        }
    }
}

/// One analyzer observation. Produced fresh per run and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    /// `None` for site-level findings.
    pub channel_id: Option<i64>,
    pub description: String,
    pub impact: Impact,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub end: Option<OffsetDateTime>,
}

impl Finding {
    pub fn new(kind: FindingKind, severity: Severity, channel_id: Option<i64>, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            channel_id,
            description: description.into(),
            impact: Impact::default(),
            start: None,
            end: None,
        }
    }

    pub fn with_impact(mut self, impact: Impact) -> Self {
        self.impact = impact;
        self
    }

    pub fn between(mut self, start: OffsetDateTime, end: OffsetDateTime) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }
}
