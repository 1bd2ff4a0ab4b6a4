use time::OffsetDateTime;

/// One normalized interval reading for a channel.
///
/// `energy_kwh` is the energy consumed during the interval ending at `ts` and
/// `power_kw` the average real power over that interval. The electrical-health
/// columns are only populated for meters that report them.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reading {
    pub channel_id: i64,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    pub energy_kwh: f64,
    pub power_kw: f64,
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub power_factor: Option<f64>,
    pub frequency_hz: Option<f64>,
    pub neutral_current_a: Option<f64>,
    pub thd_current: Option<f64>,
}

impl Reading {
    /// Reading with only the energy columns set.
    pub fn energy(channel_id: i64, ts: OffsetDateTime, energy_kwh: f64, power_kw: f64) -> Self {
        Self {
            channel_id,
            ts,
            energy_kwh,
            power_kw,
            voltage_v: None,
            current_a: None,
            power_factor: None,
            frequency_hz: None,
            neutral_current_a: None,
            thd_current: None,
        }
    }
}
