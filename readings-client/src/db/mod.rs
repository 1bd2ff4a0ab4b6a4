pub mod readings_queries;

pub use readings_queries::{channel_coverage, channels_for_site, peak_load_in_range, readings_in_range, ChannelCoverage};
