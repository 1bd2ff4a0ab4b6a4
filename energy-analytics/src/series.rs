use std::collections::BTreeMap;

use readings_client::domain::Reading;
use time::{Duration, OffsetDateTime};

use crate::error::{AnalyticsError, Result};

/// A validated, time-ordered run of readings for one channel.
///
/// Construction checks that every row belongs to the same channel, that
/// timestamps strictly increase and that energy and power are finite, so the
/// analyzers never need to re-check ordering.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSeries<'a> {
    channel_id: i64,
    readings: &'a [Reading],
}

impl<'a> ChannelSeries<'a> {
    pub fn new(channel_id: i64, readings: &'a [Reading]) -> Result<Self> {
        let mut prev: Option<OffsetDateTime> = None;
        for (index, r) in readings.iter().enumerate() {
            if r.channel_id != channel_id {
                return Err(AnalyticsError::MixedChannels {
                    expected: channel_id,
                    found: r.channel_id,
                });
            }
            if let Some(p) = prev {
                if r.ts <= p {
                    return Err(AnalyticsError::NonMonotonicTimestamps {
                        channel_id,
                        index,
                        ts: r.ts,
                    });
                }
            }
            if !r.energy_kwh.is_finite() {
                return Err(AnalyticsError::NonFiniteValue {
                    channel_id,
                    index,
                    field: "energy_kwh",
                });
            }
            if !r.power_kw.is_finite() {
                return Err(AnalyticsError::NonFiniteValue {
                    channel_id,
                    index,
                    field: "power_kw",
                });
            }
            prev = Some(r.ts);
        }
        Ok(Self { channel_id, readings })
    }

    /// A channel that is expected but returned no rows.
    pub fn empty(channel_id: i64) -> Self {
        Self { channel_id, readings: &[] }
    }

    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }

    pub fn readings(&self) -> &'a [Reading] {
        self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn powers(&self) -> Vec<f64> {
        self.readings.iter().map(|r| r.power_kw).collect()
    }

    pub fn timestamps(&self) -> Vec<OffsetDateTime> {
        self.readings.iter().map(|r| r.ts).collect()
    }

    pub fn last_ts(&self) -> Option<OffsetDateTime> {
        self.readings.last().map(|r| r.ts)
    }

    pub fn total_energy_kwh(&self) -> f64 {
        self.readings.iter().map(|r| r.energy_kwh).sum()
    }

    /// Median spacing between consecutive readings, or `fallback` when the
    /// series has fewer than two rows.
    pub fn typical_interval(&self, fallback: Duration) -> Duration {
        let mut deltas: Vec<Duration> = self.readings.windows(2).map(|w| w[1].ts - w[0].ts).collect();
        if deltas.is_empty() {
            return fallback;
        }
        deltas.sort();
        deltas[deltas.len() / 2]
    }
}

/// Split store rows into per-channel vectors keyed by channel id.
///
/// Row order within a channel is preserved, so ordering problems still surface
/// when the groups are wrapped in [`ChannelSeries`].
pub fn group_by_channel(readings: &[Reading]) -> BTreeMap<i64, Vec<Reading>> {
    let mut out: BTreeMap<i64, Vec<Reading>> = BTreeMap::new();
    for r in readings {
        out.entry(r.channel_id).or_default().push(r.clone());
    }
    out
}

/// One interval of aggregated load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadPoint {
    pub ts: OffsetDateTime,
    pub energy_kwh: f64,
    pub power_kw: f64,
}

impl From<&Reading> for LoadPoint {
    fn from(r: &Reading) -> Self {
        Self {
            ts: r.ts,
            energy_kwh: r.energy_kwh,
            power_kw: r.power_kw,
        }
    }
}

/// Sum energy and power across channels per timestamp.
pub fn aggregate_load<'a>(series: impl IntoIterator<Item = ChannelSeries<'a>>) -> Vec<LoadPoint> {
    let mut by_ts: BTreeMap<OffsetDateTime, (f64, f64)> = BTreeMap::new();
    for s in series {
        for r in s.readings() {
            let slot = by_ts.entry(r.ts).or_insert((0.0, 0.0));
            slot.0 += r.energy_kwh;
            slot.1 += r.power_kw;
        }
    }
    by_ts
        .into_iter()
        .map(|(ts, (energy_kwh, power_kw))| LoadPoint { ts, energy_kwh, power_kw })
        .collect()
}

/// Check a load series the same way [`ChannelSeries::new`] checks readings.
pub fn validate_load(points: &[LoadPoint]) -> Result<()> {
    for (index, pair) in points.windows(2).enumerate() {
        if pair[1].ts <= pair[0].ts {
            return Err(AnalyticsError::NonMonotonicTimestamps {
                channel_id: 0,
                index: index + 1,
                ts: pair[1].ts,
            });
        }
    }
    if let Some(index) = points
        .iter()
        .position(|p| !p.energy_kwh.is_finite() || !p.power_kw.is_finite())
    {
        return Err(AnalyticsError::NonFiniteValue {
            channel_id: 0,
            index,
            field: "load",
        });
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures::series;
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-01-01 00:00 UTC);

    #[test]
    fn rejects_non_monotonic_rows() {
        let mut rows = series(1, T0, Duration::minutes(15), 4, |_, _| 1.0);
        rows.swap(1, 2);
        let err = ChannelSeries::new(1, &rows).unwrap_err();
        assert!(matches!(err, AnalyticsError::NonMonotonicTimestamps { index: 2, .. }));
    }

    #[test]
    fn rejects_duplicates_and_mixed_channels() {
        let mut rows = series(1, T0, Duration::minutes(15), 3, |_, _| 1.0);
        rows[2].ts = rows[1].ts;
        assert!(ChannelSeries::new(1, &rows).is_err());

        let rows = series(2, T0, Duration::minutes(15), 3, |_, _| 1.0);
        assert!(matches!(
            ChannelSeries::new(1, &rows),
            Err(AnalyticsError::MixedChannels { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn rejects_non_finite_power() {
        let mut rows = series(1, T0, Duration::minutes(15), 3, |_, _| 1.0);
        rows[1].power_kw = f64::NAN;
        assert!(matches!(
            ChannelSeries::new(1, &rows),
            Err(AnalyticsError::NonFiniteValue { field: "power_kw", index: 1, .. })
        ));
    }

    #[test]
    fn typical_interval_is_median_spacing() {
        let mut rows = series(1, T0, Duration::minutes(15), 5, |_, _| 1.0);
        rows[4].ts = rows[3].ts + Duration::hours(2);
        let s = ChannelSeries::new(1, &rows).unwrap();
        assert_eq!(s.typical_interval(Duration::minutes(5)), Duration::minutes(15));

        let single = &rows[..1];
        let s = ChannelSeries::new(1, single).unwrap();
        assert_eq!(s.typical_interval(Duration::minutes(5)), Duration::minutes(5));
    }

    #[test]
    fn aggregate_sums_per_timestamp() {
        let a = series(1, T0, Duration::minutes(15), 4, |_, _| 2.0);
        let b = series(2, T0, Duration::minutes(15), 4, |_, _| 3.0);
        let grouped = group_by_channel(&[a, b].concat());
        let channels: Vec<_> = grouped
            .iter()
            .map(|(id, rows)| ChannelSeries::new(*id, rows).unwrap())
            .collect();
        let load = aggregate_load(channels);
        assert_eq!(load.len(), 4);
        assert!(load.iter().all(|p| p.power_kw == 5.0));
        validate_load(&load).unwrap();
    }
}
