use time::OffsetDateTime;

pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// Validation failures raised by the analyzers.
///
/// Analyzers do no I/O, so every error here describes malformed or
/// insufficient input and is returned to the caller unchanged.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AnalyticsError {
    #[error("{what} requires at least {needed} values, got {have}")]
    InsufficientData {
        what: &'static str,
        needed: usize,
        have: usize,
    },
    #[error("channel {channel_id}: timestamp {ts} at row {index} is not after the previous row")]
    NonMonotonicTimestamps {
        channel_id: i64,
        index: usize,
        ts: OffsetDateTime,
    },
    #[error("series mixes channels {expected} and {found}")]
    MixedChannels { expected: i64, found: i64 },
    #[error("channel {channel_id}: non-finite {field} at row {index}")]
    NonFiniteValue {
        channel_id: i64,
        index: usize,
        field: &'static str,
    },
    #[error("analysis window end {end} is not after start {start}")]
    InvalidWindow {
        start: OffsetDateTime,
        end: OffsetDateTime,
    },
    #[error("failed to fingerprint report inputs: {0}")]
    Fingerprint(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: f64,
    },
    #[error("TOU schedule '{schedule}' does not cover {day_kind} hour {hour}")]
    UncoveredTouHour {
        schedule: String,
        day_kind: &'static str,
        hour: u8,
    },
    #[error("TOU schedule '{schedule}' assigns {day_kind} hour {hour} to both '{first}' and '{second}'")]
    OverlappingTouHour {
        schedule: String,
        day_kind: &'static str,
        hour: u8,
        first: String,
        second: String,
    },
    #[error("business hours for {day}: start {start} must be before end {end} and end <= 24")]
    InvalidBusinessHours { day: &'static str, start: u8, end: u8 },
    #[error("failed to read config: {0}")]
    Load(String),
}
