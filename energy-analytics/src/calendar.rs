use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset, Weekday};

use crate::error::ConfigError;

/// Opening hours for a single day, `[start, end)` in local wall-clock hours.
/// `start == end` marks the day as closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub start: u8,
    pub end: u8,
}

impl DayHours {
    pub const CLOSED: DayHours = DayHours { start: 0, end: 0 };

    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, hour: u8) -> bool {
        self.start <= hour && hour < self.end
    }

    pub fn hours(&self) -> u8 {
        self.end.saturating_sub(self.start)
    }
}

/// Weekly business-hours calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessHours {
    pub monday: DayHours,
    pub tuesday: DayHours,
    pub wednesday: DayHours,
    pub thursday: DayHours,
    pub friday: DayHours,
    pub saturday: DayHours,
    pub sunday: DayHours,
}

impl Default for BusinessHours {
    fn default() -> Self {
        let weekday = DayHours::new(7, 18);
        Self {
            monday: weekday,
            tuesday: weekday,
            wednesday: weekday,
            thursday: weekday,
            friday: weekday,
            saturday: DayHours::CLOSED,
            sunday: DayHours::CLOSED,
        }
    }
}

impl BusinessHours {
    pub fn for_weekday(&self, day: Weekday) -> DayHours {
        match day {
            Weekday::Monday => self.monday,
            Weekday::Tuesday => self.tuesday,
            Weekday::Wednesday => self.wednesday,
            Weekday::Thursday => self.thursday,
            Weekday::Friday => self.friday,
            Weekday::Saturday => self.saturday,
            Weekday::Sunday => self.sunday,
        }
    }

    /// True when the local time of `ts` falls inside business hours.
    pub fn is_business_hours(&self, ts: OffsetDateTime, offset: UtcOffset) -> bool {
        let local = ts.to_offset(offset);
        self.for_weekday(local.weekday()).contains(local.hour())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let days = [
            ("monday", self.monday),
            ("tuesday", self.tuesday),
            ("wednesday", self.wednesday),
            ("thursday", self.thursday),
            ("friday", self.friday),
            ("saturday", self.saturday),
            ("sunday", self.sunday),
        ];
        for (day, hours) in days {
            if hours.start > hours.end || hours.end > 24 {
                return Err(ConfigError::InvalidBusinessHours {
                    day,
                    start: hours.start,
                    end: hours.end,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayKind {
    Weekday,
    Weekend,
}

impl DayKind {
    pub fn of(day: Weekday) -> Self {
        match day {
            Weekday::Saturday | Weekday::Sunday => DayKind::Weekend,
            _ => DayKind::Weekday,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DayKind::Weekday => "weekday",
            DayKind::Weekend => "weekend",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouPeriod {
    /// $/kWh
    pub rate: f64,
    #[serde(default)]
    pub weekday_hours: Vec<u8>,
    #[serde(default)]
    pub weekend_hours: Vec<u8>,
}

impl TouPeriod {
    fn hours_for(&self, kind: DayKind) -> &[u8] {
        match kind {
            DayKind::Weekday => &self.weekday_hours,
            DayKind::Weekend => &self.weekend_hours,
        }
    }
}

/// Time-of-use tariff: named periods, each owning a set of wall-clock hours.
///
/// A valid schedule assigns every hour of both day kinds to exactly one period,
/// so classification is a total function and allocations partition the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouSchedule {
    pub name: String,
    pub periods: BTreeMap<String, TouPeriod>,
}

impl Default for TouSchedule {
    fn default() -> Self {
        let mut periods = BTreeMap::new();
        periods.insert(
            "off_peak".to_string(),
            TouPeriod {
                rate: 0.06,
                weekday_hours: (0..7).chain(21..24).collect(),
                weekend_hours: (0..24).collect(),
            },
        );
        periods.insert(
            "mid_peak".to_string(),
            TouPeriod {
                rate: 0.10,
                weekday_hours: (7..12).chain(18..21).collect(),
                weekend_hours: Vec::new(),
            },
        );
        periods.insert(
            "on_peak".to_string(),
            TouPeriod {
                rate: 0.20,
                weekday_hours: (12..18).collect(),
                weekend_hours: Vec::new(),
            },
        );
        Self {
            name: "Standard TOU".to_string(),
            periods,
        }
    }
}

impl TouSchedule {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for period in self.periods.values() {
            if !period.rate.is_finite() || period.rate < 0.0 {
                return Err(ConfigError::OutOfRange {
                    field: "tou_schedule.periods.rate",
                    expected: "a non-negative $/kWh rate",
                    value: period.rate,
                });
            }
        }

        for kind in [DayKind::Weekday, DayKind::Weekend] {
            let mut owner: [Option<&str>; 24] = [None; 24];
            for (name, period) in &self.periods {
                for &hour in period.hours_for(kind) {
                    let Some(slot) = owner.get_mut(hour as usize) else {
                        return Err(ConfigError::OutOfRange {
                            field: "tou_schedule.periods.hours",
                            expected: "hours in 0..=23",
                            value: f64::from(hour),
                        });
                    };
                    if let Some(first) = slot {
                        return Err(ConfigError::OverlappingTouHour {
                            schedule: self.name.clone(),
                            day_kind: kind.label(),
                            hour,
                            first: first.to_string(),
                            second: name.clone(),
                        });
                    }
                    *slot = Some(name.as_str());
                }
            }
            if let Some(hour) = owner.iter().position(Option::is_none) {
                return Err(ConfigError::UncoveredTouHour {
                    schedule: self.name.clone(),
                    day_kind: kind.label(),
                    hour: hour as u8,
                });
            }
        }
        Ok(())
    }

    /// Period name and rate for the local hour of `ts`.
    ///
    /// Returns `None` only for schedules that fail [`TouSchedule::validate`].
    pub fn classify(&self, ts: OffsetDateTime, offset: UtcOffset) -> Option<(&str, f64)> {
        let local = ts.to_offset(offset);
        let kind = DayKind::of(local.weekday());
        let hour = local.hour();
        self.periods
            .iter()
            .find(|(_, p)| p.hours_for(kind).contains(&hour))
            .map(|(name, p)| (name.as_str(), p.rate))
    }

    /// Highest- and lowest-rate periods, used to size load-shifting savings.
    pub fn rate_extremes(&self) -> Option<((&str, f64), (&str, f64))> {
        let mut iter = self.periods.iter().map(|(n, p)| (n.as_str(), p.rate));
        let first = iter.next()?;
        Some(iter.fold((first, first), |(hi, lo), cur| {
            (
                if cur.1 > hi.1 { cur } else { hi },
                if cur.1 < lo.1 { cur } else { lo },
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    #[test]
    fn default_calendar_is_weekday_seven_to_six() {
        let hours = BusinessHours::default();
        // 2024-01-01 is a Monday
        assert!(hours.is_business_hours(datetime!(2024-01-01 07:00 UTC), UtcOffset::UTC));
        assert!(hours.is_business_hours(datetime!(2024-01-01 17:45 UTC), UtcOffset::UTC));
        assert!(!hours.is_business_hours(datetime!(2024-01-01 18:00 UTC), UtcOffset::UTC));
        assert!(!hours.is_business_hours(datetime!(2024-01-06 12:00 UTC), UtcOffset::UTC));
    }

    #[test]
    fn business_hours_use_local_offset() {
        let hours = BusinessHours::default();
        // 12:00 UTC is 07:00 in UTC-5
        assert!(hours.is_business_hours(datetime!(2024-01-01 12:00 UTC), offset!(-5)));
        assert!(!hours.is_business_hours(datetime!(2024-01-01 11:59 UTC), offset!(-5)));
    }

    #[test]
    fn default_tou_schedule_is_valid_and_classifies() {
        let tou = TouSchedule::default();
        tou.validate().unwrap();

        let (name, rate) = tou.classify(datetime!(2024-01-01 13:00 UTC), UtcOffset::UTC).unwrap();
        assert_eq!(name, "on_peak");
        assert_eq!(rate, 0.20);

        let (name, _) = tou.classify(datetime!(2024-01-06 13:00 UTC), UtcOffset::UTC).unwrap();
        assert_eq!(name, "off_peak");

        let ((hi, _), (lo, _)) = tou.rate_extremes().unwrap();
        assert_eq!(hi, "on_peak");
        assert_eq!(lo, "off_peak");
    }

    #[test]
    fn tou_validation_rejects_gaps_and_overlaps() {
        let mut tou = TouSchedule::default();
        tou.periods.get_mut("on_peak").unwrap().weekday_hours.pop();
        assert!(matches!(
            tou.validate(),
            Err(ConfigError::UncoveredTouHour { hour: 17, .. })
        ));

        let mut tou = TouSchedule::default();
        tou.periods.get_mut("on_peak").unwrap().weekday_hours.push(3);
        assert!(matches!(tou.validate(), Err(ConfigError::OverlappingTouHour { hour: 3, .. })));
    }

    #[test]
    fn business_hours_validation() {
        let mut hours = BusinessHours::default();
        hours.friday = DayHours::new(18, 7);
        assert!(matches!(
            hours.validate(),
            Err(ConfigError::InvalidBusinessHours { day: "friday", .. })
        ));
    }
}
