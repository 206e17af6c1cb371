use serde::{Deserialize, Serialize};

/// Bit 0 of [`SampleRecord::flags`]: the heater was switched on when sampled.
pub const FLAG_HEATER: u16 = 1 << 0;

/// One fixed-point reading from the sensor subsystem.
///
/// Units are chosen so every field is an integer: milliamps, deciwatts and
/// centidegrees Celsius. Records are immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Seconds since the Unix epoch.
    pub ts: u32,
    #[serde(rename = "current_mA")]
    pub current_ma: i32,
    #[serde(rename = "power_dW")]
    pub power_dw: i32,
    #[serde(rename = "temp_cC")]
    pub temp_cc: i16,
    #[serde(default)]
    pub flags: u16,
}

impl SampleRecord {
    pub fn heater_active(&self) -> bool {
        self.flags & FLAG_HEATER != 0
    }
}
