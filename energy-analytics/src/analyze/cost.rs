//! Time-of-use allocation and demand-charge modelling over a site load series.

use std::collections::BTreeMap;

use serde::Serialize;
use time::{Date, OffsetDateTime};

use super::AnalysisContext;
use crate::{
    calendar::DayKind,
    error::{AnalyticsError, ConfigError, Result},
    findings::{Finding, FindingKind, Impact, Priority, Severity},
    series::LoadPoint,
};

const TOP_PEAKS: usize = 10;
const CONCENTRATION_SAMPLE: usize = 50;
const CONCENTRATION_HOURS: usize = 3;
const STORAGE_REVIEW_MONTHLY_USD: f64 = 500.0;
const WEEKDAY_WEEKEND_SHIFT_RATIO: f64 = 2.0;
/// Shaving scenario quoted in the combined savings estimate.
const HEADLINE_SHAVING_PCT: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodUsage {
    pub name: String,
    pub rate: f64,
    pub energy_kwh: f64,
    pub cost_usd: f64,
    pub intervals: usize,
    pub pct_of_total_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadShift {
    pub from_period: String,
    pub to_period: String,
    pub shiftable_kwh: f64,
    pub rate_spread: f64,
    pub max_savings_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCost {
    pub date: Date,
    pub energy_kwh: f64,
    pub flat_cost_usd: f64,
    pub tou_cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TouAnalysis {
    pub schedule: String,
    pub total_kwh: f64,
    pub flat_rate: f64,
    pub flat_cost_usd: f64,
    pub tou_cost_usd: f64,
    /// Positive when the TOU tariff would be cheaper than flat.
    pub tou_vs_flat_savings_usd: f64,
    pub tou_vs_flat_pct: f64,
    pub periods: Vec<PeriodUsage>,
    pub load_shift: LoadShift,
    pub daily: Vec<DailyCost>,
}

fn uncovered(ctx: &AnalysisContext<'_>, ts: OffsetDateTime) -> AnalyticsError {
    let local = ts.to_offset(ctx.offset);
    ConfigError::UncoveredTouHour {
        schedule: ctx.config.tou_schedule.name.clone(),
        day_kind: DayKind::of(local.weekday()).label(),
        hour: local.hour(),
    }
    .into()
}

/// Allocate every interval's energy to the TOU period owning its local hour.
///
/// The allocation partitions the input: per-period energy sums to the total.
pub fn analyze_tou(ctx: &AnalysisContext<'_>, load: &[LoadPoint]) -> Result<TouAnalysis> {
    let schedule = &ctx.config.tou_schedule;
    let flat_rate = ctx.config.tariff.flat_rate;

    let mut periods: BTreeMap<&str, PeriodUsage> = schedule
        .periods
        .iter()
        .map(|(name, p)| {
            (
                name.as_str(),
                PeriodUsage {
                    name: name.clone(),
                    rate: p.rate,
                    energy_kwh: 0.0,
                    cost_usd: 0.0,
                    intervals: 0,
                    pct_of_total_kwh: 0.0,
                },
            )
        })
        .collect();
    let mut daily: BTreeMap<Date, DailyCost> = BTreeMap::new();

    for p in load {
        let (name, rate) = schedule.classify(p.ts, ctx.offset).ok_or_else(|| uncovered(ctx, p.ts))?;
        let cost = p.energy_kwh * rate;
        if let Some(usage) = periods.get_mut(name) {
            usage.energy_kwh += p.energy_kwh;
            usage.cost_usd += cost;
            usage.intervals += 1;
        }
        let date = p.ts.to_offset(ctx.offset).date();
        let day = daily.entry(date).or_insert(DailyCost {
            date,
            energy_kwh: 0.0,
            flat_cost_usd: 0.0,
            tou_cost_usd: 0.0,
        });
        day.energy_kwh += p.energy_kwh;
        day.flat_cost_usd += p.energy_kwh * flat_rate;
        day.tou_cost_usd += cost;
    }

    let total_kwh: f64 = load.iter().map(|p| p.energy_kwh).sum();
    let tou_cost_usd: f64 = periods.values().map(|u| u.cost_usd).sum();
    let flat_cost_usd = total_kwh * flat_rate;
    for usage in periods.values_mut() {
        usage.pct_of_total_kwh = if total_kwh > 0.0 { usage.energy_kwh / total_kwh * 100.0 } else { 0.0 };
    }

    let ((hi_name, hi_rate), (lo_name, lo_rate)) = schedule
        .rate_extremes()
        .ok_or_else(|| uncovered(ctx, ctx.window.current.start))?;
    let shiftable_kwh = periods.get(hi_name).map_or(0.0, |u| u.energy_kwh);
    let load_shift = LoadShift {
        from_period: hi_name.to_string(),
        to_period: lo_name.to_string(),
        shiftable_kwh,
        rate_spread: hi_rate - lo_rate,
        max_savings_usd: shiftable_kwh * (hi_rate - lo_rate),
    };

    let savings = flat_cost_usd - tou_cost_usd;
    tracing::debug!(total_kwh, flat_cost_usd, tou_cost_usd, "TOU allocation complete");
    Ok(TouAnalysis {
        schedule: schedule.name.clone(),
        total_kwh,
        flat_rate,
        flat_cost_usd,
        tou_cost_usd,
        tou_vs_flat_savings_usd: savings,
        tou_vs_flat_pct: if flat_cost_usd > 0.0 { savings / flat_cost_usd * 100.0 } else { 0.0 },
        periods: periods.into_values().collect(),
        load_shift,
        daily: daily.into_values().collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub demand_kw: f64,
    pub hour_of_day: u8,
    pub day_of_week: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShavingScenario {
    pub reduction_pct: f64,
    pub reduced_peak_kw: f64,
    /// Reduced peak after the ratchet floor is applied.
    pub billed_kw: f64,
    pub monthly_charge_usd: f64,
    pub monthly_savings_usd: f64,
    pub annual_savings_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyLoad {
    pub hour: u8,
    pub avg_kw: f64,
    pub max_kw: f64,
    pub avg_kwh: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationCategory {
    LoadShifting,
    PeakShaving,
    Investment,
    Monitoring,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DemandRecommendation {
    pub priority: Priority,
    pub category: RecommendationCategory,
    pub title: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DemandAnalysis {
    pub peak_kw: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub peak_at: OffsetDateTime,
    pub historical_peak_kw: Option<f64>,
    pub ratchet_floor_kw: Option<f64>,
    pub billed_demand_kw: f64,
    pub ratchet_applied: bool,
    pub rate_per_kw: f64,
    pub monthly_charge_usd: f64,
    pub annual_charge_usd: f64,
    pub average_kw: f64,
    pub top_peaks: Vec<PeakEvent>,
    pub shaving: Vec<ShavingScenario>,
    pub hourly_profile: Vec<HourlyLoad>,
    pub weekday_peak_kw: f64,
    pub weekend_peak_kw: f64,
    pub peak_concentration_hours: Vec<u8>,
    pub recommendations: Vec<DemandRecommendation>,
}

/// Billing-peak demand, ratchet and shaving scenarios.
///
/// Billed demand is the window's peak interval power, raised to
/// `ratchet_fraction * historical_peak_kw` when a historical peak is known.
pub fn analyze_demand(
    ctx: &AnalysisContext<'_>,
    load: &[LoadPoint],
    historical_peak_kw: Option<f64>,
) -> Result<DemandAnalysis> {
    let cfg = &ctx.config.demand;
    let peak = load
        .iter()
        .max_by(|a, b| a.power_kw.total_cmp(&b.power_kw))
        .ok_or(AnalyticsError::InsufficientData {
            what: "demand analysis",
            needed: 1,
            have: 0,
        })?;
    let peak_kw = peak.power_kw;

    let ratchet_floor_kw = historical_peak_kw.map(|h| h * cfg.ratchet_fraction);
    let floor = ratchet_floor_kw.unwrap_or(0.0);
    let billed_demand_kw = peak_kw.max(floor);
    let monthly_charge_usd = billed_demand_kw * cfg.rate_per_kw;

    let mut ranked: Vec<&LoadPoint> = load.iter().collect();
    ranked.sort_by(|a, b| b.power_kw.total_cmp(&a.power_kw).then(a.ts.cmp(&b.ts)));
    let top_peaks = ranked
        .iter()
        .take(TOP_PEAKS)
        .map(|p| {
            let local = p.ts.to_offset(ctx.offset);
            PeakEvent {
                ts: p.ts,
                demand_kw: p.power_kw,
                hour_of_day: local.hour(),
                day_of_week: local.weekday().to_string(),
            }
        })
        .collect();

    let shaving = cfg
        .shaving_percentages
        .iter()
        .map(|pct| {
            let reduced_peak_kw = peak_kw * (1.0 - pct / 100.0);
            let billed_kw = reduced_peak_kw.max(floor);
            let charge = billed_kw * cfg.rate_per_kw;
            let monthly_savings_usd = monthly_charge_usd - charge;
            ShavingScenario {
                reduction_pct: *pct,
                reduced_peak_kw,
                billed_kw,
                monthly_charge_usd: charge,
                monthly_savings_usd,
                annual_savings_usd: monthly_savings_usd * 12.0,
            }
        })
        .collect();

    // (sum kW, max kW, sum kWh, count) per local hour
    let mut by_hour: BTreeMap<u8, (f64, f64, f64, usize)> = BTreeMap::new();
    let mut weekday_peak_kw: f64 = 0.0;
    let mut weekend_peak_kw: f64 = 0.0;
    for p in load {
        let local = p.ts.to_offset(ctx.offset);
        let slot = by_hour.entry(local.hour()).or_insert((0.0, f64::MIN, 0.0, 0));
        slot.0 += p.power_kw;
        slot.1 = slot.1.max(p.power_kw);
        slot.2 += p.energy_kwh;
        slot.3 += 1;
        match DayKind::of(local.weekday()) {
            DayKind::Weekday => weekday_peak_kw = weekday_peak_kw.max(p.power_kw),
            DayKind::Weekend => weekend_peak_kw = weekend_peak_kw.max(p.power_kw),
        }
    }
    let hourly_profile = by_hour
        .into_iter()
        .map(|(hour, (sum_kw, max_kw, sum_kwh, n))| HourlyLoad {
            hour,
            avg_kw: sum_kw / n as f64,
            max_kw,
            avg_kwh: sum_kwh / n as f64,
        })
        .collect();

    let mut hour_counts: BTreeMap<u8, usize> = BTreeMap::new();
    for p in ranked.iter().take(CONCENTRATION_SAMPLE) {
        *hour_counts.entry(p.ts.to_offset(ctx.offset).hour()).or_default() += 1;
    }
    let mut concentration: Vec<(u8, usize)> = hour_counts.into_iter().collect();
    concentration.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let peak_concentration_hours: Vec<u8> = concentration.into_iter().take(CONCENTRATION_HOURS).map(|(h, _)| h).collect();

    let recommendations = demand_recommendations(
        peak_kw,
        weekday_peak_kw,
        weekend_peak_kw,
        &peak_concentration_hours,
        monthly_charge_usd,
    );

    let average_kw = load.iter().map(|p| p.power_kw).sum::<f64>() / load.len() as f64;
    tracing::debug!(peak_kw, billed_demand_kw, monthly_charge_usd, "demand analysis complete");
    Ok(DemandAnalysis {
        peak_kw,
        peak_at: peak.ts,
        historical_peak_kw,
        ratchet_floor_kw,
        billed_demand_kw,
        ratchet_applied: floor > peak_kw,
        rate_per_kw: cfg.rate_per_kw,
        monthly_charge_usd,
        annual_charge_usd: monthly_charge_usd * 12.0,
        average_kw,
        top_peaks,
        shaving,
        hourly_profile,
        weekday_peak_kw,
        weekend_peak_kw,
        peak_concentration_hours,
        recommendations,
    })
}

fn demand_recommendations(
    peak_kw: f64,
    weekday_peak: f64,
    weekend_peak: f64,
    peak_hours: &[u8],
    monthly_charge: f64,
) -> Vec<DemandRecommendation> {
    let mut recs = Vec::new();

    if weekday_peak > 0.0 && weekend_peak > 0.0 {
        let ratio = weekday_peak / weekend_peak;
        if ratio > WEEKDAY_WEEKEND_SHIFT_RATIO {
            recs.push(DemandRecommendation {
                priority: Priority::High,
                category: RecommendationCategory::LoadShifting,
                title: "Shift non-critical weekday loads".to_string(),
                detail: format!(
                    "Weekday peak ({weekday_peak:.0} kW) is {ratio:.1}x the weekend peak ({weekend_peak:.0} kW). \
                     Batch processes, HVAC pre-cooling or EV charging can move to off-peak hours."
                ),
            });
        }
    }

    if !peak_hours.is_empty() {
        let mut hours = peak_hours.to_vec();
        hours.sort_unstable();
        let hours = hours.iter().map(|h| format!("{h}:00")).collect::<Vec<_>>().join(", ");
        recs.push(DemandRecommendation {
            priority: Priority::High,
            category: RecommendationCategory::PeakShaving,
            title: "Target peak concentration hours".to_string(),
            detail: format!(
                "Demand peaks concentrate around {hours}. Stagger equipment start-up or use \
                 demand-limiting controls during these hours."
            ),
        });
    }

    if monthly_charge > STORAGE_REVIEW_MONTHLY_USD {
        let ten_pct = monthly_charge * 0.10;
        recs.push(DemandRecommendation {
            priority: Priority::Medium,
            category: RecommendationCategory::Investment,
            title: "Evaluate battery energy storage".to_string(),
            detail: format!(
                "At ${monthly_charge:.0}/month in demand charges a 10% reduction saves ~${ten_pct:.2}/month \
                 (${:.0}/year).",
                ten_pct * 12.0
            ),
        });
    }

    if recs.is_empty() {
        recs.push(DemandRecommendation {
            priority: Priority::Low,
            category: RecommendationCategory::Monitoring,
            title: "Continue monitoring demand patterns".to_string(),
            detail: format!("Current peak of {peak_kw:.0} kW shows no immediate high-impact optimization."),
        });
    }
    recs
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSummary {
    pub total_energy_kwh: f64,
    pub flat_cost_usd: f64,
    pub tou_cost_usd: f64,
    pub monthly_demand_charge_usd: f64,
    pub estimated_monthly_savings_usd: f64,
    pub estimated_annual_savings_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostReport {
    pub tou: TouAnalysis,
    pub demand: DemandAnalysis,
    pub summary: CostSummary,
    pub findings: Vec<Finding>,
}

/// Run both cost models and turn their opportunities into findings.
pub fn analyze_costs(
    ctx: &AnalysisContext<'_>,
    load: &[LoadPoint],
    historical_peak_kw: Option<f64>,
) -> Result<CostReport> {
    let tou = analyze_tou(ctx, load)?;
    let demand = analyze_demand(ctx, load, historical_peak_kw)?;

    let window_days = ctx.window.current.days();
    let billing_days = f64::from(ctx.config.demand.billing_period_days);
    let to_billing_period = if window_days > 0.0 { billing_days / window_days } else { 0.0 };
    let headline = demand
        .shaving
        .iter()
        .find(|s| s.reduction_pct == HEADLINE_SHAVING_PCT)
        .or_else(|| demand.shaving.first());
    let demand_savings = headline.map_or(0.0, |s| s.monthly_savings_usd);
    let monthly = tou.tou_vs_flat_savings_usd.max(0.0) * to_billing_period + demand_savings;
    let summary = CostSummary {
        total_energy_kwh: tou.total_kwh,
        flat_cost_usd: tou.flat_cost_usd,
        tou_cost_usd: tou.tou_cost_usd,
        monthly_demand_charge_usd: demand.monthly_charge_usd,
        estimated_monthly_savings_usd: monthly,
        estimated_annual_savings_usd: monthly * 12.0,
    };

    let mut findings = Vec::new();
    let shift = &tou.load_shift;
    if shift.max_savings_usd > 0.0 {
        let period = ctx.config.tou_schedule.periods.get(&shift.from_period);
        // share of the week's hours the expensive period covers
        let time_share = period.map_or(0.0, |p| (p.weekday_hours.len() * 5 + p.weekend_hours.len() * 2) as f64 / 168.0);
        let energy_share = if tou.total_kwh > 0.0 { shift.shiftable_kwh / tou.total_kwh } else { 0.0 };
        let ratio = if time_share > 0.0 { energy_share / time_share } else { 0.0 };
        findings.push(
            Finding::new(
                FindingKind::TouLoadShift,
                Severity::from_ratio(ratio),
                None,
                format!(
                    "{:.0} kWh fell in {} (${:.2}/kWh); moving it to {} would save up to ${:.2}",
                    shift.shiftable_kwh,
                    shift.from_period,
                    period.map_or(0.0, |p| p.rate),
                    shift.to_period,
                    shift.max_savings_usd
                ),
            )
            .with_impact(Impact {
                energy_kwh: shift.shiftable_kwh,
                cost_usd: shift.max_savings_usd,
                demand_kw: None,
            })
            .between(ctx.window.current.start, ctx.window.current.end),
        );
    }

    if let Some(s) = headline.filter(|s| s.monthly_savings_usd > 0.0) {
        let ratio = if demand.average_kw > 0.0 { demand.peak_kw / demand.average_kw } else { 0.0 };
        let mut description = format!(
            "Billed demand {:.1} kW costs ${:.2}/month; shaving the peak {:.0}% saves ${:.2}/month",
            demand.billed_demand_kw, demand.monthly_charge_usd, s.reduction_pct, s.monthly_savings_usd
        );
        if demand.ratchet_applied {
            description.push_str(" (ratchet floor in effect)");
        }
        findings.push(
            Finding::new(FindingKind::DemandCharge, Severity::from_ratio(ratio), None, description)
                .with_impact(Impact {
                    energy_kwh: 0.0,
                    cost_usd: if billing_days > 0.0 { s.monthly_savings_usd * window_days / billing_days } else { 0.0 },
                    demand_kw: Some(demand.billed_demand_kw - s.billed_kw),
                })
                .between(demand.peak_at, demand.peak_at),
        );
    }

    tracing::debug!(
        monthly_savings = summary.estimated_monthly_savings_usd,
        findings = findings.len(),
        "cost analysis complete"
    );
    Ok(CostReport {
        tou,
        demand,
        summary,
        findings,
    })
}
