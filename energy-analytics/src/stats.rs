//! Numeric helpers shared by the analyzers.
//!
//! Every function accepts an empty slice and returns a neutral value (zero,
//! an empty vector) rather than an error; callers that cannot proceed on
//! empty input check for it themselves.

use serde::Serialize;
use time::{Duration, OffsetDateTime};

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance.
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    out.sort_by(f64::total_cmp);
    out
}

/// Percentile `p` (0..=100) of an already sorted slice, interpolating
/// linearly between the two closest ranks.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

pub fn percentile(values: &[f64], p: f64) -> f64 {
    percentile_sorted(&sorted(values), p)
}

pub fn median(values: &[f64]) -> f64 {
    percentile(values, 50.0)
}

/// Percentile over the strictly positive values only.
pub fn non_zero_percentile(values: &[f64], p: f64) -> f64 {
    let positive: Vec<f64> = values.iter().copied().filter(|v| *v > 0.0).collect();
    percentile(&positive, p)
}

pub fn z_score(value: f64, mean: f64, std: f64) -> f64 {
    if std == 0.0 {
        return 0.0;
    }
    (value - mean) / std
}

/// Z-score of every point against the series' own mean and population std.
pub fn z_scores(values: &[f64]) -> Vec<f64> {
    let m = mean(values);
    let s = std_dev(values);
    values.iter().map(|v| z_score(*v, m, s)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IqrBounds {
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
    pub lower: f64,
    pub upper: f64,
}

impl IqrBounds {
    pub fn new(values: &[f64], multiplier: f64) -> Self {
        let s = sorted(values);
        let q1 = percentile_sorted(&s, 25.0);
        let q3 = percentile_sorted(&s, 75.0);
        let iqr = q3 - q1;
        Self {
            q1,
            q3,
            iqr,
            lower: q1 - multiplier * iqr,
            upper: q3 + multiplier * iqr,
        }
    }

    /// Signed distance past the nearest bound; zero inside the band.
    pub fn deviation(&self, value: f64) -> f64 {
        if value > self.upper {
            value - self.upper
        } else if value < self.lower {
            value - self.lower
        } else {
            0.0
        }
    }

    pub fn is_outlier(&self, value: f64) -> bool {
        value > self.upper || value < self.lower
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummaryStats {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub std: f64,
}

impl SummaryStats {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                count: 0,
                sum: 0.0,
                mean: 0.0,
                min: 0.0,
                max: 0.0,
                median: 0.0,
                std: 0.0,
            };
        }
        let s = sorted(values);
        Self {
            count: s.len(),
            sum: s.iter().sum(),
            mean: mean(&s),
            min: s[0],
            max: s[s.len() - 1],
            median: percentile_sorted(&s, 50.0),
            std: std_dev(&s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RollingStat {
    /// Index of the last value in the window.
    pub index: usize,
    pub mean: f64,
    pub variance: f64,
    pub std: f64,
}

/// Mean and variance of every full window of `window` consecutive values.
pub fn rolling_stats(values: &[f64], window: usize) -> Vec<RollingStat> {
    if window == 0 || values.len() < window {
        return Vec::new();
    }
    values
        .windows(window)
        .enumerate()
        .map(|(i, w)| {
            let variance = variance(w);
            RollingStat {
                index: i + window - 1,
                mean: mean(w),
                variance,
                std: variance.sqrt(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OutlierPoint {
    pub index: usize,
    pub value: f64,
    pub z_score: f64,
    pub is_outlier: bool,
}

/// Classify every point against IQR bounds computed from the series itself.
pub fn detect_outliers(values: &[f64], multiplier: f64) -> Vec<OutlierPoint> {
    let bounds = IqrBounds::new(values, multiplier);
    let m = mean(values);
    let s = std_dev(values);
    values
        .iter()
        .enumerate()
        .map(|(index, &value)| OutlierPoint {
            index,
            value,
            z_score: z_score(value, m, s),
            is_outlier: bounds.is_outlier(value),
        })
        .collect()
}

/// Share of expected readings present, in percent, capped at 100.
pub fn completeness_pct(actual: usize, expected: usize) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    (actual as f64 / expected as f64 * 100.0).min(100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Gap {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub hours: f64,
    pub missing_intervals: u64,
}

/// Spans between consecutive timestamps longer than `expected * multiplier`.
pub fn find_gaps(timestamps: &[OffsetDateTime], expected: Duration, multiplier: f64) -> Vec<Gap> {
    if expected <= Duration::ZERO {
        return Vec::new();
    }
    let expected_secs = expected.as_seconds_f64();
    timestamps
        .windows(2)
        .filter_map(|pair| {
            let delta = (pair[1] - pair[0]).as_seconds_f64();
            if delta <= expected_secs * multiplier {
                return None;
            }
            let missing = ((delta / expected_secs).round() as u64).saturating_sub(1);
            Some(Gap {
                start: pair[0],
                end: pair[1],
                hours: delta / 3600.0,
                missing_intervals: missing,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn one_to_ten() -> Vec<f64> {
        (1..=10).map(f64::from).collect()
    }

    #[test]
    fn summary_of_one_to_ten() {
        let s = SummaryStats::of(&one_to_ten());
        assert_eq!(s.count, 10);
        assert_eq!(s.sum, 55.0);
        assert_eq!(s.mean, 5.5);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 10.0);
        assert_eq!(s.median, 5.5);
    }

    #[test]
    fn empty_input_is_neutral() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(SummaryStats::of(&[]).count, 0);
        assert_eq!(IqrBounds::new(&[], 3.0).iqr, 0.0);
        assert!(rolling_stats(&[], 3).is_empty());
        assert_eq!(SummaryStats::of(&[42.0]).std, 0.0);
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let v = one_to_ten();
        assert_eq!(percentile(&v, 25.0), 3.25);
        assert_eq!(percentile(&v, 75.0), 7.75);
        assert_eq!(percentile(&v, 0.0), 1.0);
        assert_eq!(percentile(&v, 100.0), 10.0);
    }

    #[test]
    fn median_matches_reference_for_odd_and_even_lengths() {
        assert_eq!(median(&[5.0, 1.0, 3.0, 2.0, 4.0]), 3.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&[7.0]), 7.0);
        // unsorted with duplicates
        assert_eq!(median(&[9.0, 2.0, 2.0, 8.0, 2.0, 1.0]), 2.0);
    }

    #[test]
    fn iqr_of_one_to_ten() {
        let b = IqrBounds::new(&one_to_ten(), 1.5);
        assert_eq!(b.q1, 3.25);
        assert_eq!(b.q3, 7.75);
        assert_eq!(b.iqr, 4.5);
        assert_eq!(b.upper, 7.75 + 6.75);
        assert_eq!(b.deviation(20.0), 20.0 - b.upper);
        assert_eq!(b.deviation(5.0), 0.0);
    }

    #[test]
    fn z_score_handles_zero_std() {
        assert_eq!(z_score(10.0, 5.0, 2.5), 2.0);
        assert_eq!(z_score(0.0, 5.0, 2.5), -2.0);
        assert_eq!(z_score(10.0, 5.0, 0.0), 0.0);
        assert!(z_scores(&[3.0, 3.0, 3.0]).iter().all(|z| *z == 0.0));
    }

    #[test]
    fn non_zero_percentile_ignores_zeros() {
        assert_eq!(non_zero_percentile(&[0.0, 0.0, 0.0, 5.0, 10.0, 15.0], 50.0), 10.0);
        assert_eq!(non_zero_percentile(&[0.0, 0.0], 50.0), 0.0);
    }

    #[test]
    fn rolling_windows() {
        let r = rolling_stats(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(r.len(), 3);
        assert_eq!(r[0].mean, 2.0);
        assert_eq!(r[0].index, 2);
        assert!(r.iter().all(|s| s.variance >= 0.0));
    }

    #[test]
    fn outliers() {
        let flagged: Vec<_> = detect_outliers(&[1.0, 2.0, 3.0, 4.0, 5.0, 100.0], 1.5)
            .into_iter()
            .filter(|p| p.is_outlier)
            .collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].value, 100.0);

        let none = detect_outliers(&[3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], 1.5);
        assert!(none.iter().all(|p| !p.is_outlier));
    }

    #[test]
    fn completeness() {
        assert_eq!(completeness_pct(100, 100), 100.0);
        assert_eq!(completeness_pct(50, 100), 50.0);
        assert_eq!(completeness_pct(10, 0), 0.0);
        assert_eq!(completeness_pct(120, 100), 100.0);
    }

    #[test]
    fn gaps_count_missing_intervals() {
        let t1 = datetime!(2026-01-01 00:00 UTC);
        let t2 = t1 + Duration::hours(1);
        let t3 = t2 + Duration::hours(3);

        let gaps = find_gaps(&[t1, t2, t3], Duration::hours(1), 2.0);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].missing_intervals, 2);
        assert_eq!(gaps[0].start, t2);

        let regular = [t1, t2, t2 + Duration::hours(1)];
        assert!(find_gaps(&regular, Duration::hours(1), 2.0).is_empty());
    }
}
