#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Channel {
    pub channel_id: i64,
    pub channel_name: String,
    pub site_id: Option<String>,
    /// True when the channel meters the whole site rather than a single circuit.
    #[cfg_attr(feature = "serde", serde(default))]
    pub is_site_total: bool,
}
