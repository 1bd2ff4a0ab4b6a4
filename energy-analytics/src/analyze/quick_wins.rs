//! Turn findings from every analyzer into a short, dollar-ranked action list.

use std::collections::BTreeMap;

use serde::Serialize;

use super::AnalysisContext;
use crate::findings::{Finding, FindingKind, Priority, Severity};

const HIGH_PRIORITY_ANNUAL_USD: f64 = 1000.0;
const MEDIUM_PRIORITY_ANNUAL_USD: f64 = 250.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub title: String,
    pub kind: FindingKind,
    pub channel_id: Option<i64>,
    pub priority: Priority,
    pub severity: Severity,
    pub confidence: Confidence,
    pub effort: Effort,
    /// Dollar impact over the analysis window.
    pub impact_usd: f64,
    pub weekly_kwh: f64,
    pub weekly_usd: f64,
    pub annual_usd: f64,
    pub detail: String,
}

fn is_energy_kind(kind: FindingKind) -> bool {
    matches!(
        kind,
        FindingKind::AfterHoursWaste | FindingKind::ConsumptionAnomaly | FindingKind::DemandSpike | FindingKind::TouLoadShift
    )
}

fn effort_and_confidence(kind: FindingKind) -> (Effort, Confidence) {
    match kind {
        FindingKind::MissingData | FindingKind::StaleData | FindingKind::Flatline => (Effort::Low, Confidence::High),
        FindingKind::AfterHoursWaste => (Effort::Low, Confidence::High),
        FindingKind::ConsumptionAnomaly => (Effort::Medium, Confidence::Medium),
        FindingKind::DemandSpike | FindingKind::ShortCycling => (Effort::Medium, Confidence::Medium),
        FindingKind::DemandCharge => (Effort::High, Confidence::Medium),
        // upper bound: assumes every on-peak kWh can move
        FindingKind::TouLoadShift => (Effort::High, Confidence::Low),
        FindingKind::ElectricalHealth => (Effort::High, Confidence::Medium),
    }
}

fn title(kind: FindingKind, channel_id: Option<i64>) -> String {
    let target = channel_id.map_or_else(|| "site".to_string(), |id| format!("channel {id}"));
    match kind {
        FindingKind::MissingData => format!("Restore data collection on {target}"),
        FindingKind::StaleData => format!("Reconnect stalled meter on {target}"),
        FindingKind::Flatline => format!("Inspect flatlined sensor on {target}"),
        FindingKind::AfterHoursWaste => format!("Reduce after-hours load on {target}"),
        FindingKind::ConsumptionAnomaly => format!("Investigate abnormal consumption on {target}"),
        FindingKind::DemandSpike => format!("Stagger equipment causing demand spikes on {target}"),
        FindingKind::ShortCycling => format!("Service short-cycling equipment on {target}"),
        FindingKind::TouLoadShift => format!("Shift on-peak usage to off-peak hours ({target})"),
        FindingKind::DemandCharge => format!("Shave billing peak demand ({target})"),
        FindingKind::ElectricalHealth => format!("Review power quality on {target}"),
    }
}

fn priority(annual_usd: f64, severity: Severity) -> Priority {
    if annual_usd >= HIGH_PRIORITY_ANNUAL_USD || severity == Severity::High {
        Priority::High
    } else if annual_usd >= MEDIUM_PRIORITY_ANNUAL_USD || severity == Severity::Medium {
        Priority::Medium
    } else {
        Priority::Low
    }
}

fn better(a: &Finding, b: &Finding) -> bool {
    a.impact
        .cost_usd
        .total_cmp(&b.impact.cost_usd)
        .then(a.severity.cmp(&b.severity))
        .is_gt()
}

/// Rank findings into at most `quick_wins.max_count` recommendations.
///
/// Findings touching the same channel and issue type collapse into one,
/// keeping the higher-impact finding. Energy recommendations worth less than
/// `quick_wins.min_weekly_kwh` per week are dropped. The rest are ordered by
/// dollar impact, then priority, then title.
pub fn rank_quick_wins(ctx: &AnalysisContext<'_>, findings: &[Finding]) -> Vec<Recommendation> {
    let cfg = &ctx.config.quick_wins;
    let weekly = ctx.window.weekly_factor();
    let annual = ctx.window.annualization_factor();

    let mut best: BTreeMap<(FindingKind, Option<i64>), &Finding> = BTreeMap::new();
    for f in findings {
        best.entry((f.kind, f.channel_id))
            .and_modify(|cur| {
                if better(f, *cur) {
                    *cur = f;
                }
            })
            .or_insert(f);
    }

    let mut recs: Vec<Recommendation> = best
        .into_values()
        .filter(|f| !is_energy_kind(f.kind) || f.impact.energy_kwh * weekly >= cfg.min_weekly_kwh)
        .map(|f| {
            let (effort, confidence) = effort_and_confidence(f.kind);
            let annual_usd = f.impact.cost_usd * annual;
            Recommendation {
                title: title(f.kind, f.channel_id),
                kind: f.kind,
                channel_id: f.channel_id,
                priority: priority(annual_usd, f.severity),
                severity: f.severity,
                confidence,
                effort,
                impact_usd: f.impact.cost_usd,
                weekly_kwh: f.impact.energy_kwh * weekly,
                weekly_usd: f.impact.cost_usd * weekly,
                annual_usd,
                detail: f.description.clone(),
            }
        })
        .collect();

    recs.sort_by(|a, b| {
        b.impact_usd
            .total_cmp(&a.impact_usd)
            .then(b.priority.cmp(&a.priority))
            .then_with(|| a.title.cmp(&b.title))
    });
    recs.truncate(cfg.max_count);
    tracing::debug!(input = findings.len(), recommendations = recs.len(), "quick wins ranked");
    recs
}
