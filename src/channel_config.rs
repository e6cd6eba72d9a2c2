//! Closed tables for the ps2000 channel and timing constants.

use std::fmt;
use std::str::FromStr;

/// Largest ADC count the ps2000 family reports for a full-scale input.
pub const MAX_ADC_VALUE: i16 = 32767;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub const ALL: [Self; 2] = [Self::A, Self::B];

    pub fn code(self) -> i16 {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coupling {
    AC,
    #[default]
    DC,
}

impl Coupling {
    /// Value of the driver's `dc` flag.
    pub fn code(self) -> i16 {
        match self {
            Self::AC => 0,
            Self::DC => 1,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeParseError {
    #[error("Unknown voltage range label '{0}'")]
    UnknownLabel(String),

    #[error("Unknown voltage range code {0}")]
    UnknownCode(i16),
}

/// Input voltage range shared by both channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VoltageRange {
    Mv20,
    #[default]
    Mv50,
    Mv100,
    Mv200,
    Mv500,
    V1,
    V2,
    V5,
    V10,
    V20,
}

impl VoltageRange {
    pub const ALL: [Self; 10] = [
        Self::Mv20,
        Self::Mv50,
        Self::Mv100,
        Self::Mv200,
        Self::Mv500,
        Self::V1,
        Self::V2,
        Self::V5,
        Self::V10,
        Self::V20,
    ];

    /// Vendor range code passed to `ps2000_set_channel`.
    pub fn code(self) -> i16 {
        match self {
            Self::Mv20 => 1,
            Self::Mv50 => 2,
            Self::Mv100 => 3,
            Self::Mv200 => 4,
            Self::Mv500 => 5,
            Self::V1 => 6,
            Self::V2 => 7,
            Self::V5 => 8,
            Self::V10 => 9,
            Self::V20 => 10,
        }
    }

    pub fn from_code(code: i16) -> Result<Self, RangeParseError> {
        Self::ALL
            .into_iter()
            .find(|range| range.code() == code)
            .ok_or(RangeParseError::UnknownCode(code))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mv20 => "20MV",
            Self::Mv50 => "50MV",
            Self::Mv100 => "100MV",
            Self::Mv200 => "200MV",
            Self::Mv500 => "500MV",
            Self::V1 => "1V",
            Self::V2 => "2V",
            Self::V5 => "5V",
            Self::V10 => "10V",
            Self::V20 => "20V",
        }
    }

    /// Input voltage (mV) that maps to [`MAX_ADC_VALUE`].
    pub fn full_scale_mv(self) -> f64 {
        match self {
            Self::Mv20 => 20.0,
            Self::Mv50 => 50.0,
            Self::Mv100 => 100.0,
            Self::Mv200 => 200.0,
            Self::Mv500 => 500.0,
            Self::V1 => 1_000.0,
            Self::V2 => 2_000.0,
            Self::V5 => 5_000.0,
            Self::V10 => 10_000.0,
            Self::V20 => 20_000.0,
        }
    }

    /// Convert a raw ADC count to millivolts for this range.
    pub fn adc_to_mv(self, raw: i16) -> f64 {
        f64::from(raw) * self.full_scale_mv() / f64::from(MAX_ADC_VALUE)
    }

    /// Convert millivolts to the nearest ADC count, saturating at full scale.
    pub fn mv_to_adc(self, mv: f64) -> i16 {
        let counts = (mv * f64::from(MAX_ADC_VALUE) / self.full_scale_mv()).round();
        counts.clamp(-f64::from(MAX_ADC_VALUE), f64::from(MAX_ADC_VALUE)) as i16
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoltageRange {
    type Err = RangeParseError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|range| range.as_str().eq_ignore_ascii_case(label.trim()))
            .ok_or_else(|| RangeParseError::UnknownLabel(label.to_string()))
    }
}

/// Unit the driver uses when it reports sample times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Femtoseconds,
    Picoseconds,
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Femtoseconds),
            1 => Some(Self::Picoseconds),
            2 => Some(Self::Nanoseconds),
            3 => Some(Self::Microseconds),
            4 => Some(Self::Milliseconds),
            5 => Some(Self::Seconds),
            _ => None,
        }
    }

    pub fn code(self) -> i16 {
        match self {
            Self::Femtoseconds => 0,
            Self::Picoseconds => 1,
            Self::Nanoseconds => 2,
            Self::Microseconds => 3,
            Self::Milliseconds => 4,
            Self::Seconds => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Femtoseconds => "fs",
            Self::Picoseconds => "ps",
            Self::Nanoseconds => "ns",
            Self::Microseconds => "us",
            Self::Milliseconds => "ms",
            Self::Seconds => "s",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `ps2000_set_channel` receives for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSetting {
    pub channel: Channel,
    pub enabled: bool,
    pub coupling: Coupling,
    pub range: VoltageRange,
}

impl ChannelSetting {
    pub fn enabled_dc(channel: Channel, range: VoltageRange) -> Self {
        Self {
            channel,
            enabled: true,
            coupling: Coupling::DC,
            range,
        }
    }
}
