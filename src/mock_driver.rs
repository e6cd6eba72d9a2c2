//! In-memory stand-in for the ps2000 driver.
//!
//! Used by the unit tests and by the demos when no hardware is attached.
//! Behaviour is configured up front with the `with_*` builders; every call the
//! driver receives is appended to a log that tests can inspect with
//! [`MockPicoDriver::calls`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::channel_config::{Channel, ChannelSetting};
use crate::pico_driver::{
    DriverError, PicoDriver, PicoErrorCode, TimebaseReport, UnitHandle, UnitInfo, ValuesReport,
};
use crate::trigger_config::SimpleTrigger;

/// Driver call as recorded by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Enumerate,
    Open(String),
    SetChannel(ChannelSetting),
    SetTrigger(SimpleTrigger),
    GetTimebase(i16),
    RunBlock { no_of_values: i32, timebase: i16 },
    Ready,
    GetValues(usize),
    Stop,
    Close,
}

/// When the mock reports a finished block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyBehavior {
    /// Ready after this many polls returned "busy".
    AfterPolls(u32),
    Never,
    /// `ps2000_ready` returns a negative value.
    UnitLost,
}

type IntervalFn = Box<dyn Fn(i16) -> i32 + Send + Sync>;
type SampleFn = Box<dyn Fn(Channel, usize) -> i16 + Send + Sync>;

struct MockState {
    calls: Vec<MockCall>,
    open: HashMap<i16, String>,
    next_handle: i16,
    polls_since_run: u32,
    last_error: PicoErrorCode,
}

pub struct MockPicoDriver {
    units: Vec<UnitInfo>,
    interval_ns: IntervalFn,
    sample: SampleFn,
    max_samples: i32,
    max_timebase: i16,
    values_returned: Option<i32>,
    ready_behavior: ReadyBehavior,
    failing_channel: Option<Channel>,
    fail_trigger: bool,
    fail_run_block: bool,
    fail_stop: bool,
    fail_close: bool,
    overflow: i16,
    state: Mutex<MockState>,
}

impl std::fmt::Debug for MockPicoDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPicoDriver")
            .field("units", &self.units)
            .field("max_samples", &self.max_samples)
            .field("ready_behavior", &self.ready_behavior)
            .finish_non_exhaustive()
    }
}

impl Default for MockPicoDriver {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MockPicoDriver {
    /// A driver seeing `units`, with a PicoScope 2204-like timebase table
    /// (10 ns doubling per timebase) and 8064 samples of memory.
    pub fn new(units: Vec<UnitInfo>) -> Self {
        Self {
            units,
            interval_ns: Box::new(|timebase| 10 * (1 << timebase.clamp(0, 20))),
            sample: Box::new(|channel, index| {
                let ramp = (index % 256) as i16 * 128;
                match channel {
                    Channel::A => ramp,
                    Channel::B => -ramp,
                }
            }),
            max_samples: 8064,
            max_timebase: 19,
            values_returned: None,
            ready_behavior: ReadyBehavior::AfterPolls(2),
            failing_channel: None,
            fail_trigger: false,
            fail_run_block: false,
            fail_stop: false,
            fail_close: false,
            overflow: 0,
            state: Mutex::new(MockState {
                calls: Vec::new(),
                open: HashMap::new(),
                next_handle: 1,
                polls_since_run: 0,
                last_error: PicoErrorCode::Ok,
            }),
        }
    }

    /// A driver with one unit attached.
    pub fn single(serial: &str) -> Self {
        Self::new(vec![UnitInfo::new(serial, "2204A")])
    }

    pub fn with_interval_ns<F>(mut self, interval: F) -> Self
    where
        F: Fn(i16) -> i32 + Send + Sync + 'static,
    {
        self.interval_ns = Box::new(interval);
        self
    }

    pub fn with_samples<F>(mut self, sample: F) -> Self
    where
        F: Fn(Channel, usize) -> i16 + Send + Sync + 'static,
    {
        self.sample = Box::new(sample);
        self
    }

    /// Memory reported by `get_timebase`. Larger requests are not rejected here,
    /// leaving the check to the caller.
    pub fn with_max_samples(mut self, max_samples: i32) -> Self {
        self.max_samples = max_samples;
        self
    }

    /// Timebases above this are rejected by `get_timebase`.
    pub fn with_max_timebase(mut self, max_timebase: i16) -> Self {
        self.max_timebase = max_timebase;
        self
    }

    /// Make `get_values` report fewer values than requested.
    pub fn with_values_returned(mut self, count: i32) -> Self {
        self.values_returned = Some(count);
        self
    }

    pub fn with_ready_behavior(mut self, behavior: ReadyBehavior) -> Self {
        self.ready_behavior = behavior;
        self
    }

    pub fn with_failing_channel(mut self, channel: Channel) -> Self {
        self.failing_channel = Some(channel);
        self
    }

    pub fn with_failing_trigger(mut self) -> Self {
        self.fail_trigger = true;
        self
    }

    pub fn with_failing_run_block(mut self) -> Self {
        self.fail_run_block = true;
        self
    }

    pub fn with_failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn with_overflow(mut self, overflow: i16) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn open_handles(&self) -> usize {
        self.lock().open.len()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: MockCall) -> MutexGuard<'_, MockState> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }

    fn is_open(state: &MockState, handle: UnitHandle) -> bool {
        state.open.contains_key(&handle.raw())
    }

    fn status(ok: bool) -> i16 {
        i16::from(ok)
    }

    /// Status for `ok`, recording `error` as the driver's last error on failure.
    fn status_or(state: &mut MockState, ok: bool, error: PicoErrorCode) -> i16 {
        if !ok {
            state.last_error = error;
        }
        Self::status(ok)
    }
}

impl PicoDriver for MockPicoDriver {
    fn enumerate_units(&self) -> Result<Vec<UnitInfo>, DriverError> {
        drop(self.record(MockCall::Enumerate));
        Ok(self.units.clone())
    }

    fn open_unit(&self, serial: &str) -> i16 {
        let mut state = self.record(MockCall::Open(serial.to_string()));
        let known = self.units.iter().any(|unit| unit.serial == serial);
        let already_open = state.open.values().any(|open| open == serial);
        if !known {
            state.last_error = PicoErrorCode::NotFound;
            return 0;
        }
        if already_open {
            state.last_error = PicoErrorCode::MaxUnitsOpened;
            return -1;
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.open.insert(handle, serial.to_string());
        state.last_error = PicoErrorCode::Ok;
        handle
    }

    fn set_channel(&self, handle: UnitHandle, setting: &ChannelSetting) -> i16 {
        let mut state = self.record(MockCall::SetChannel(*setting));
        let ok = Self::is_open(&state, handle) && self.failing_channel != Some(setting.channel);
        if !ok {
            state.last_error = PicoErrorCode::ConfigFail;
        }
        Self::status(ok)
    }

    fn set_trigger(&self, handle: UnitHandle, trigger: &SimpleTrigger) -> i16 {
        let mut state = self.record(MockCall::SetTrigger(*trigger));
        let ok = Self::is_open(&state, handle) && !self.fail_trigger;
        Self::status_or(&mut state, ok, PicoErrorCode::ConfigFail)
    }

    fn get_timebase(
        &self,
        handle: UnitHandle,
        timebase: i16,
        _no_of_samples: i32,
        _oversample: i16,
    ) -> (i16, TimebaseReport) {
        let mut state = self.record(MockCall::GetTimebase(timebase));
        let ok = Self::is_open(&state, handle) && (0..=self.max_timebase).contains(&timebase);
        if !ok {
            state.last_error = PicoErrorCode::ConfigFail;
            return (0, TimebaseReport::default());
        }
        let report = TimebaseReport {
            time_interval_ns: (self.interval_ns)(timebase),
            time_units: 2,
            max_samples: self.max_samples,
        };
        (1, report)
    }

    fn run_block(
        &self,
        handle: UnitHandle,
        no_of_values: i32,
        timebase: i16,
        _oversample: i16,
    ) -> (i16, i32) {
        let mut state = self.record(MockCall::RunBlock {
            no_of_values,
            timebase,
        });
        state.polls_since_run = 0;
        let ok = Self::is_open(&state, handle) && !self.fail_run_block;
        (Self::status_or(&mut state, ok, PicoErrorCode::NotResponding), 0)
    }

    fn ready(&self, handle: UnitHandle) -> i16 {
        let mut state = self.record(MockCall::Ready);
        if !Self::is_open(&state, handle) {
            return -1;
        }
        match self.ready_behavior {
            ReadyBehavior::AfterPolls(polls) if state.polls_since_run >= polls => 1,
            ReadyBehavior::AfterPolls(_) | ReadyBehavior::Never => {
                state.polls_since_run += 1;
                0
            }
            ReadyBehavior::UnitLost => -1,
        }
    }

    fn get_values(
        &self,
        handle: UnitHandle,
        buffer_a: &mut [i16],
        buffer_b: &mut [i16],
    ) -> (i32, ValuesReport) {
        let requested = buffer_a.len().min(buffer_b.len());
        let mut state = self.record(MockCall::GetValues(requested));
        let count = self
            .values_returned
            .map_or(requested, |count| (count.max(0) as usize).min(requested));
        if !Self::is_open(&state, handle) || count == 0 {
            state.last_error = PicoErrorCode::NotResponding;
            return (0, ValuesReport::default());
        }
        for index in 0..count {
            buffer_a[index] = (self.sample)(Channel::A, index);
            buffer_b[index] = (self.sample)(Channel::B, index);
        }
        let report = ValuesReport {
            overflow: self.overflow,
        };
        (count as i32, report)
    }

    fn stop(&self, handle: UnitHandle) -> i16 {
        let mut state = self.record(MockCall::Stop);
        let ok = Self::is_open(&state, handle) && !self.fail_stop;
        Self::status_or(&mut state, ok, PicoErrorCode::NotResponding)
    }

    fn close_unit(&self, handle: UnitHandle) -> i16 {
        let mut state = self.record(MockCall::Close);
        let was_open = state.open.remove(&handle.raw()).is_some();
        Self::status_or(&mut state, was_open && !self.fail_close, PicoErrorCode::NotResponding)
    }

    fn last_error(&self, _handle: Option<UnitHandle>) -> Option<PicoErrorCode> {
        Some(self.lock().last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_config::VoltageRange;

    #[test]
    fn test_open_and_close() {
        let driver = MockPicoDriver::single("AB123/0001");
        assert_eq!(driver.open_unit("XX000/0000"), 0);
        assert_eq!(driver.last_error(None), Some(PicoErrorCode::NotFound));

        let handle = UnitHandle::from_raw(driver.open_unit("AB123/0001")).unwrap();
        assert_eq!(driver.open_unit("AB123/0001"), -1);
        assert_eq!(driver.open_handles(), 1);
        assert_eq!(driver.close_unit(handle), 1);
        assert_eq!(driver.close_unit(handle), 0);
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn test_failing_channel() {
        let driver = MockPicoDriver::single("AB123/0001").with_failing_channel(Channel::B);
        let handle = UnitHandle::from_raw(driver.open_unit("AB123/0001")).unwrap();
        let a = ChannelSetting::enabled_dc(Channel::A, VoltageRange::V1);
        let b = ChannelSetting::enabled_dc(Channel::B, VoltageRange::V1);
        assert_eq!(driver.set_channel(handle, &a), 1);
        assert_eq!(driver.set_channel(handle, &b), 0);
    }

    #[test]
    fn test_failures_record_last_error() {
        let driver = MockPicoDriver::single("AB123/0001")
            .with_failing_trigger()
            .with_failing_stop();
        let handle = UnitHandle::from_raw(driver.open_unit("AB123/0001")).unwrap();
        assert_eq!(driver.last_error(Some(handle)), Some(PicoErrorCode::Ok));

        assert_eq!(driver.set_trigger(handle, &SimpleTrigger::rising_edge(Channel::A)), 0);
        assert_eq!(driver.last_error(Some(handle)), Some(PicoErrorCode::ConfigFail));

        assert_eq!(driver.stop(handle), 0);
        assert_eq!(driver.last_error(Some(handle)), Some(PicoErrorCode::NotResponding));
    }

    #[test]
    fn test_ready_after_polls() {
        let driver =
            MockPicoDriver::single("AB123/0001").with_ready_behavior(ReadyBehavior::AfterPolls(1));
        let handle = UnitHandle::from_raw(driver.open_unit("AB123/0001")).unwrap();
        assert_eq!(driver.run_block(handle, 100, 3, 1).0, 1);
        assert_eq!(driver.ready(handle), 0);
        assert_eq!(driver.ready(handle), 1);
    }
}
