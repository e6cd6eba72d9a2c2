//! [`PicoDriver`] backed by the PicoSDK `ps2000` shared library, loaded at runtime.
#![allow(unsafe_code)]

use std::ffi::OsStr;

use libloading::Library;

use crate::channel_config::ChannelSetting;
use crate::pico_driver::{
    DriverError, PicoDriver, PicoErrorCode, TimebaseReport, UnitHandle, UnitInfo, ValuesReport,
};
use crate::trigger_config::SimpleTrigger;

/// `ps2000_get_unit_info` line selectors.
const INFO_VARIANT: i16 = 3;
const INFO_BATCH_AND_SERIAL: i16 = 4;
const INFO_ERROR_CODE: i16 = 6;

/// The driver supports at most this many units open at once.
const MAX_UNITS: usize = 64;
const INFO_BUFFER_LEN: usize = 64;

type FnOpenUnit = unsafe extern "C" fn() -> i16;
type FnCloseUnit = unsafe extern "C" fn(handle: i16) -> i16;
type FnGetUnitInfo =
    unsafe extern "C" fn(handle: i16, string: *mut i8, string_length: i16, line: i16) -> i16;
type FnSetChannel =
    unsafe extern "C" fn(handle: i16, channel: i16, enabled: i16, dc: i16, range: i16) -> i16;
type FnSetTrigger = unsafe extern "C" fn(
    handle: i16,
    source: i16,
    threshold: i16,
    direction: i16,
    delay: i16,
    auto_trigger_ms: i16,
) -> i16;
type FnGetTimebase = unsafe extern "C" fn(
    handle: i16,
    timebase: i16,
    no_of_samples: i32,
    time_interval: *mut i32,
    time_units: *mut i16,
    oversample: i16,
    max_samples: *mut i32,
) -> i16;
type FnRunBlock = unsafe extern "C" fn(
    handle: i16,
    no_of_values: i32,
    timebase: i16,
    oversample: i16,
    time_indisposed_ms: *mut i32,
) -> i16;
type FnReady = unsafe extern "C" fn(handle: i16) -> i16;
type FnGetValues = unsafe extern "C" fn(
    handle: i16,
    buffer_a: *mut i16,
    buffer_b: *mut i16,
    buffer_c: *mut i16,
    buffer_d: *mut i16,
    overflow: *mut i16,
    no_of_values: i32,
) -> i32;
type FnStop = unsafe extern "C" fn(handle: i16) -> i16;

/// Function table resolved from the vendor library.
///
/// The function pointers stay valid for as long as `_lib` is loaded, which is
/// the lifetime of this struct.
pub struct Ps2000Library {
    _lib: Library,
    open_unit: FnOpenUnit,
    close_unit: FnCloseUnit,
    get_unit_info: FnGetUnitInfo,
    set_channel: FnSetChannel,
    set_trigger: FnSetTrigger,
    get_timebase: FnGetTimebase,
    run_block: FnRunBlock,
    ready: FnReady,
    get_values: FnGetValues,
    stop: FnStop,
}

impl std::fmt::Debug for Ps2000Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ps2000Library").finish_non_exhaustive()
    }
}

impl Ps2000Library {
    /// Load the driver by its platform file name (`libps2000.so`, `ps2000.dll`, ...)
    /// from the system library search path.
    pub fn load() -> Result<Self, DriverError> {
        Self::load_from(libloading::library_filename("ps2000"))
    }

    /// Load the driver from an explicit path.
    pub fn load_from<P: AsRef<OsStr>>(path: P) -> Result<Self, DriverError> {
        log::debug!("Loading ps2000 driver from {:?}", path.as_ref());
        // SAFETY: Loading runs the library's initialisers; the PicoSDK driver has no
        // initialisation requirements beyond being loaded once per process.
        let lib = unsafe { Library::new(path.as_ref())? };

        macro_rules! symbol {
            ($ty:ty, $name:literal) => {{
                // SAFETY: The function type matches the prototype in `ps2000.h`.
                let symbol = unsafe { lib.get::<$ty>(concat!($name, "\0").as_bytes()) }
                    .map_err(|source| DriverError::MissingSymbol {
                        symbol: $name,
                        source,
                    })?;
                *symbol
            }};
        }

        Ok(Self {
            open_unit: symbol!(FnOpenUnit, "ps2000_open_unit"),
            close_unit: symbol!(FnCloseUnit, "ps2000_close_unit"),
            get_unit_info: symbol!(FnGetUnitInfo, "ps2000_get_unit_info"),
            set_channel: symbol!(FnSetChannel, "ps2000_set_channel"),
            set_trigger: symbol!(FnSetTrigger, "ps2000_set_trigger"),
            get_timebase: symbol!(FnGetTimebase, "ps2000_get_timebase"),
            run_block: symbol!(FnRunBlock, "ps2000_run_block"),
            ready: symbol!(FnReady, "ps2000_ready"),
            get_values: symbol!(FnGetValues, "ps2000_get_values"),
            stop: symbol!(FnStop, "ps2000_stop"),
            _lib: lib,
        })
    }

    fn unit_info(&self, handle: i16, line: i16) -> Option<String> {
        let mut buffer = [0i8; INFO_BUFFER_LEN];
        // SAFETY: The driver writes at most `string_length` bytes into `buffer`.
        let written = unsafe {
            (self.get_unit_info)(handle, buffer.as_mut_ptr(), INFO_BUFFER_LEN as i16, line)
        };
        if written <= 0 {
            return None;
        }
        let bytes: Vec<u8> = buffer[..(written as usize).min(INFO_BUFFER_LEN)]
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        Some(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    /// Open every attached unit, one per call to `ps2000_open_unit`.
    fn open_all(&self) -> Result<Vec<i16>, PicoErrorCode> {
        let mut handles = Vec::new();
        while handles.len() < MAX_UNITS {
            // SAFETY: No arguments; returns a handle or a status.
            let handle = unsafe { (self.open_unit)() };
            log::trace!("ps2000_open_unit() = {}", handle);
            match handle {
                h if h > 0 => handles.push(h),
                0 => break,
                _ => {
                    let error = self.last_error(None).unwrap_or(PicoErrorCode::Unknown(-1));
                    self.close_all(&handles);
                    return Err(error);
                }
            }
        }
        Ok(handles)
    }

    fn close_all(&self, handles: &[i16]) {
        for &handle in handles {
            // SAFETY: `handle` was returned by `ps2000_open_unit` and is closed once.
            let status = unsafe { (self.close_unit)(handle) };
            if status <= 0 {
                log::warn!("ps2000_close_unit({}) failed", handle);
            }
        }
    }
}

impl PicoDriver for Ps2000Library {
    fn enumerate_units(&self) -> Result<Vec<UnitInfo>, DriverError> {
        let handles = self.open_all().map_err(DriverError::Enumeration)?;
        let units = handles
            .iter()
            .map(|&handle| {
                UnitInfo::new(
                    self.unit_info(handle, INFO_BATCH_AND_SERIAL).unwrap_or_default(),
                    self.unit_info(handle, INFO_VARIANT).unwrap_or_default(),
                )
            })
            .collect();
        self.close_all(&handles);
        Ok(units)
    }

    fn open_unit(&self, serial: &str) -> i16 {
        let handles = match self.open_all() {
            Ok(handles) => handles,
            Err(_) => return -1,
        };
        let found = handles
            .iter()
            .copied()
            .find(|&handle| self.unit_info(handle, INFO_BATCH_AND_SERIAL).as_deref() == Some(serial));
        let others: Vec<i16> = handles
            .iter()
            .copied()
            .filter(|&handle| Some(handle) != found)
            .collect();
        self.close_all(&others);
        found.unwrap_or(0)
    }

    fn set_channel(&self, handle: UnitHandle, setting: &ChannelSetting) -> i16 {
        // SAFETY: Plain integer arguments.
        unsafe {
            (self.set_channel)(
                handle.raw(),
                setting.channel.code(),
                i16::from(setting.enabled),
                setting.coupling.code(),
                setting.range.code(),
            )
        }
    }

    fn set_trigger(&self, handle: UnitHandle, trigger: &SimpleTrigger) -> i16 {
        // SAFETY: Plain integer arguments.
        unsafe {
            (self.set_trigger)(
                handle.raw(),
                trigger.source.code(),
                trigger.threshold_adc,
                trigger.direction.code(),
                trigger.delay_percent,
                trigger.auto_trigger_ms,
            )
        }
    }

    fn get_timebase(
        &self,
        handle: UnitHandle,
        timebase: i16,
        no_of_samples: i32,
        oversample: i16,
    ) -> (i16, TimebaseReport) {
        let mut report = TimebaseReport::default();
        // SAFETY: The three out-pointers refer to live fields of `report`.
        let status = unsafe {
            (self.get_timebase)(
                handle.raw(),
                timebase,
                no_of_samples,
                &mut report.time_interval_ns,
                &mut report.time_units,
                oversample,
                &mut report.max_samples,
            )
        };
        (status, report)
    }

    fn run_block(
        &self,
        handle: UnitHandle,
        no_of_values: i32,
        timebase: i16,
        oversample: i16,
    ) -> (i16, i32) {
        let mut time_indisposed_ms = 0i32;
        // SAFETY: The out-pointer refers to a live local.
        let status = unsafe {
            (self.run_block)(
                handle.raw(),
                no_of_values,
                timebase,
                oversample,
                &mut time_indisposed_ms,
            )
        };
        (status, time_indisposed_ms)
    }

    fn ready(&self, handle: UnitHandle) -> i16 {
        // SAFETY: Plain integer argument.
        unsafe { (self.ready)(handle.raw()) }
    }

    fn get_values(
        &self,
        handle: UnitHandle,
        buffer_a: &mut [i16],
        buffer_b: &mut [i16],
    ) -> (i32, ValuesReport) {
        let mut report = ValuesReport::default();
        let no_of_values = buffer_a.len().min(buffer_b.len()).min(i32::MAX as usize) as i32;
        // SAFETY: Both buffers hold at least `no_of_values` samples; channels C and D
        // do not exist on the 2000 series and are passed as null.
        let count = unsafe {
            (self.get_values)(
                handle.raw(),
                buffer_a.as_mut_ptr(),
                buffer_b.as_mut_ptr(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut report.overflow,
                no_of_values,
            )
        };
        (count, report)
    }

    fn stop(&self, handle: UnitHandle) -> i16 {
        // SAFETY: Plain integer argument.
        unsafe { (self.stop)(handle.raw()) }
    }

    fn close_unit(&self, handle: UnitHandle) -> i16 {
        // SAFETY: Plain integer argument.
        unsafe { (self.close_unit)(handle.raw()) }
    }

    fn last_error(&self, handle: Option<UnitHandle>) -> Option<PicoErrorCode> {
        let raw = handle.map_or(0, UnitHandle::raw);
        self.unit_info(raw, INFO_ERROR_CODE)
            .and_then(|text| text.parse::<i16>().ok())
            .map(PicoErrorCode::from_code)
    }
}
