use std::collections::HashSet;

use crate::pipeline::PipelineError;
use readings_client::domain::Reading;
use time::{macros::datetime, OffsetDateTime};

/// Pure validation of a `Reading` at the ingestion boundary.
///
/// Rules:
/// - energy and power must be finite, energy non-negative.
/// - populated electrical columns must be finite.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01].
pub fn validate_reading(r: Reading) -> Result<Reading, PipelineError> {
    match check(&r) {
        Ok(()) => Ok(r),
        Err(e) => {
            metrics::counter!("analytics_readings_rejected_total").increment(1);
            Err(e)
        }
    }
}

fn check(r: &Reading) -> Result<(), PipelineError> {
    if !r.energy_kwh.is_finite() || !r.power_kw.is_finite() {
        return Err(PipelineError::Transform(format!(
            "channel {}: energy and power must be finite",
            r.channel_id
        )));
    }
    if r.energy_kwh < 0.0 {
        return Err(PipelineError::Transform(format!(
            "channel {}: energy_kwh must be non-negative",
            r.channel_id
        )));
    }

    let optional = [
        ("voltage_v", r.voltage_v),
        ("current_a", r.current_a),
        ("power_factor", r.power_factor),
        ("frequency_hz", r.frequency_hz),
        ("neutral_current_a", r.neutral_current_a),
        ("thd_current", r.thd_current),
    ];
    if let Some((field, _)) = optional.iter().find(|(_, v)| v.is_some_and(|x| !x.is_finite())) {
        return Err(PipelineError::Transform(format!(
            "channel {}: {field} must be finite",
            r.channel_id
        )));
    }

    const MIN_TS: OffsetDateTime = datetime!(2000-01-01 00:00:00 UTC);
    const MAX_TS: OffsetDateTime = datetime!(2100-01-01 00:00:00 UTC);
    if r.ts < MIN_TS || r.ts > MAX_TS {
        return Err(PipelineError::Transform("timestamp out of allowed range".to_string()));
    }

    Ok(())
}

/// Drop repeated `(channel_id, ts)` rows, keeping the first.
pub fn dedupe_readings(rows: Vec<Reading>) -> Vec<Reading> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.into_iter()
        .filter(|r| seen.insert((r.channel_id, r.ts)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(kwh: f64) -> Reading {
        Reading::energy(1, datetime!(2024-01-01 00:00:00 UTC), kwh, kwh * 4.0)
    }

    #[test]
    fn accepts_valid_record() {
        assert!(validate_reading(reading(1.0)).is_ok());
    }

    #[test]
    fn rejects_negative_energy() {
        assert!(matches!(validate_reading(reading(-0.1)), Err(PipelineError::Transform(_))));
    }

    #[test]
    fn rejects_non_finite_values() {
        assert!(validate_reading(reading(f64::NAN)).is_err());

        let mut r = reading(1.0);
        r.thd_current = Some(f64::INFINITY);
        assert!(validate_reading(r).is_err());
    }

    #[test]
    fn rejects_out_of_range_ts() {
        let mut r = reading(1.0);
        r.ts = datetime!(1800-01-01 00:00:00 UTC);
        assert!(matches!(validate_reading(r), Err(PipelineError::Transform(_))));
    }

    #[test]
    fn dedupe_keeps_first_and_order() {
        let a = reading(1.0);
        let mut b = reading(2.0);
        b.ts += time::Duration::minutes(15);
        let dup = reading(5.0);
        let out = dedupe_readings(vec![b.clone(), a.clone(), dup]);
        assert_eq!(out, vec![b, a]);
    }
}
