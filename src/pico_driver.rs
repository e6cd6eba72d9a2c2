//! The boundary between this crate and the vendor driver.
//!
//! [`PicoDriver`] mirrors the `ps2000_*` C calls one to one. Raw results are
//! handed back unchanged so callers can log them; every call returns a value
//! greater than zero on success.

use std::fmt;
use std::sync::Arc;

use crate::channel_config::ChannelSetting;
use crate::trigger_config::SimpleTrigger;

/// Handle of an opened unit. Only ever constructed from a positive driver result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitHandle(i16);

impl UnitHandle {
    pub fn from_raw(raw: i16) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn raw(self) -> i16 {
        self.0
    }
}

/// A unit seen during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub serial: String,
    pub variant: String,
}

impl UnitInfo {
    pub fn new(serial: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            variant: variant.into(),
        }
    }
}

impl fmt::Display for UnitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.serial, self.variant)
    }
}

/// Out-parameters of `ps2000_get_timebase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimebaseReport {
    pub time_interval_ns: i32,
    pub time_units: i16,
    pub max_samples: i32,
}

/// Out-parameters of `ps2000_get_values`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValuesReport {
    pub overflow: i16,
}

/// `PS2000_ERROR_CODE` values reported through unit info line 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicoErrorCode {
    Ok,
    MaxUnitsOpened,
    MemoryFail,
    NotFound,
    FirmwareFail,
    NotResponding,
    ConfigFail,
    OsNotSupported,
    PicoppTooOld,
    Unknown(i16),
}

impl PicoErrorCode {
    pub fn from_code(code: i16) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::MaxUnitsOpened,
            2 => Self::MemoryFail,
            3 => Self::NotFound,
            4 => Self::FirmwareFail,
            5 => Self::NotResponding,
            6 => Self::ConfigFail,
            7 => Self::OsNotSupported,
            8 => Self::PicoppTooOld,
            other => Self::Unknown(other),
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Ok => "no error",
            Self::MaxUnitsOpened => "the maximum number of units is already open",
            Self::MemoryFail => "not enough memory on the host machine",
            Self::NotFound => "no PicoScope could be found",
            Self::FirmwareFail => "unable to download firmware",
            Self::NotResponding => "the oscilloscope is not responding",
            Self::ConfigFail => "the configuration information is corrupt or missing",
            Self::OsNotSupported => "the operating system is not supported by this driver",
            Self::PicoppTooOld => "the PicoPP driver is too old",
            Self::Unknown(_) => "unknown driver error",
        }
    }
}

impl fmt::Display for PicoErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "{} ({})", self.description(), code),
            _ => f.write_str(self.description()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Failed to load the ps2000 driver library: {0}")]
    Load(#[from] libloading::Error),

    #[error("Driver library is missing symbol {symbol}")]
    MissingSymbol {
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    #[error("Unit enumeration failed: {0}")]
    Enumeration(PicoErrorCode),
}

/// The calls a session and the discovery helper make into the vendor driver.
///
/// All methods take `&self`; implementations use interior mutability where
/// they keep state.
pub trait PicoDriver {
    /// Every unit currently attached. Units are closed again before returning.
    fn enumerate_units(&self) -> Result<Vec<UnitInfo>, DriverError>;

    /// Open the unit with `serial`. Returns a positive handle, 0 when no unit
    /// was found, or a negative value when opening failed.
    fn open_unit(&self, serial: &str) -> i16;

    fn set_channel(&self, handle: UnitHandle, setting: &ChannelSetting) -> i16;

    fn set_trigger(&self, handle: UnitHandle, trigger: &SimpleTrigger) -> i16;

    fn get_timebase(
        &self,
        handle: UnitHandle,
        timebase: i16,
        no_of_samples: i32,
        oversample: i16,
    ) -> (i16, TimebaseReport);

    /// Returns the status and the time in ms the unit will be busy.
    fn run_block(
        &self,
        handle: UnitHandle,
        no_of_values: i32,
        timebase: i16,
        oversample: i16,
    ) -> (i16, i32);

    /// Positive when the block is complete, 0 while busy, negative if the unit is gone.
    fn ready(&self, handle: UnitHandle) -> i16;

    /// Fills both buffers and returns the number of values written per channel.
    fn get_values(
        &self,
        handle: UnitHandle,
        buffer_a: &mut [i16],
        buffer_b: &mut [i16],
    ) -> (i32, ValuesReport);

    fn stop(&self, handle: UnitHandle) -> i16;

    fn close_unit(&self, handle: UnitHandle) -> i16;

    /// Error recorded by the driver for `handle`, or for the last failed open
    /// when `handle` is `None`.
    fn last_error(&self, handle: Option<UnitHandle>) -> Option<PicoErrorCode>;
}

macro_rules! forward_driver {
    ($($wrapper:ty),+ $(,)?) => {
        $(
            impl<D: PicoDriver + ?Sized> PicoDriver for $wrapper {
                fn enumerate_units(&self) -> Result<Vec<UnitInfo>, DriverError> {
                    (**self).enumerate_units()
                }

                fn open_unit(&self, serial: &str) -> i16 {
                    (**self).open_unit(serial)
                }

                fn set_channel(&self, handle: UnitHandle, setting: &ChannelSetting) -> i16 {
                    (**self).set_channel(handle, setting)
                }

                fn set_trigger(&self, handle: UnitHandle, trigger: &SimpleTrigger) -> i16 {
                    (**self).set_trigger(handle, trigger)
                }

                fn get_timebase(
                    &self,
                    handle: UnitHandle,
                    timebase: i16,
                    no_of_samples: i32,
                    oversample: i16,
                ) -> (i16, TimebaseReport) {
                    (**self).get_timebase(handle, timebase, no_of_samples, oversample)
                }

                fn run_block(
                    &self,
                    handle: UnitHandle,
                    no_of_values: i32,
                    timebase: i16,
                    oversample: i16,
                ) -> (i16, i32) {
                    (**self).run_block(handle, no_of_values, timebase, oversample)
                }

                fn ready(&self, handle: UnitHandle) -> i16 {
                    (**self).ready(handle)
                }

                fn get_values(
                    &self,
                    handle: UnitHandle,
                    buffer_a: &mut [i16],
                    buffer_b: &mut [i16],
                ) -> (i32, ValuesReport) {
                    (**self).get_values(handle, buffer_a, buffer_b)
                }

                fn stop(&self, handle: UnitHandle) -> i16 {
                    (**self).stop(handle)
                }

                fn close_unit(&self, handle: UnitHandle) -> i16 {
                    (**self).close_unit(handle)
                }

                fn last_error(&self, handle: Option<UnitHandle>) -> Option<PicoErrorCode> {
                    (**self).last_error(handle)
                }
            }
        )+
    };
}

forward_driver!(&D, Box<D>, Arc<D>);
