use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::error::{AnalyticsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl Span {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self> {
        if end <= start {
            return Err(AnalyticsError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn hours(&self) -> f64 {
        self.duration().as_seconds_f64() / 3600.0
    }

    pub fn days(&self) -> f64 {
        self.hours() / 24.0
    }

    /// Half-open membership, `[start, end)`.
    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// The period under analysis plus the comparison period that precedes it.
/// Built per report run, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnalysisWindow {
    pub current: Span,
    pub baseline: Option<Span>,
}

impl AnalysisWindow {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self> {
        Ok(Self {
            current: Span::new(start, end)?,
            baseline: None,
        })
    }

    /// Attach a baseline of `weeks` whole weeks ending where the window starts.
    pub fn with_baseline_weeks(mut self, weeks: u32) -> Self {
        self.baseline = (weeks > 0).then(|| Span {
            start: self.current.start - Duration::weeks(i64::from(weeks)),
            end: self.current.start,
        });
        self
    }

    pub fn with_baseline(mut self, baseline: Span) -> Self {
        self.baseline = Some(baseline);
        self
    }

    /// Factor that scales a window total to a yearly figure.
    pub fn annualization_factor(&self) -> f64 {
        365.0 / self.current.days()
    }

    /// Factor that scales a window total to a weekly figure.
    pub fn weekly_factor(&self) -> f64 {
        7.0 / self.current.days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn rejects_inverted_window() {
        let t = datetime!(2024-01-08 00:00 UTC);
        assert!(matches!(
            AnalysisWindow::new(t, t),
            Err(AnalyticsError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn baseline_precedes_window() {
        let w = AnalysisWindow::new(datetime!(2024-01-08 00:00 UTC), datetime!(2024-01-15 00:00 UTC))
            .unwrap()
            .with_baseline_weeks(4);
        let b = w.baseline.unwrap();
        assert_eq!(b.end, w.current.start);
        assert_eq!(b.start, datetime!(2023-12-11 00:00 UTC));
        assert_eq!(w.current.days(), 7.0);
        assert!((w.annualization_factor() - 365.0 / 7.0).abs() < 1e-12);
        assert_eq!(w.weekly_factor(), 1.0);
        assert!(w.current.contains(datetime!(2024-01-08 00:00 UTC)));
        assert!(!w.current.contains(datetime!(2024-01-15 00:00 UTC)));
    }
}
