pub mod analyze;
pub mod calendar;
pub mod config;
pub mod error;
pub mod findings;
pub mod observability;
pub mod pipeline;
pub mod report;
pub mod series;
pub mod sinks;
pub mod sources;
pub mod stats;
pub mod transform;
pub mod window;

pub use error::{AnalyticsError, ConfigError};
pub use findings::{Finding, FindingKind, Severity};
pub use report::{build_report, ReportInput, WeeklyReport};
