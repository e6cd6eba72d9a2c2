use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use polars::prelude::*;

use crate::channel_config::{Channel, ChannelSetting, TimeUnit, VoltageRange};
use crate::pico_driver::{PicoDriver, PicoErrorCode, UnitHandle, UnitInfo};
use crate::trigger_config::SimpleTrigger;

pub const PRE_TRIGGER_SAMPLES: u32 = 1000;
pub const POST_TRIGGER_SAMPLES: u32 = 1000;
pub const DEFAULT_TIMEBASE: u16 = 7;
/// Default upper bound for [`PicoScope::find_optimal_timebase`], 1 µs.
pub const DEFAULT_TIMEBASE_THRESHOLD_NS: i32 = 1000;
/// Slowest timebase of the 2000 series.
pub const PS2000_MAX_TIMEBASE: u16 = 19;

const TIME_COLUMN_NAME: &str = "time_ns";
const CHANNEL_A_COLUMN_NAME: &str = "channel_a_mv";
const CHANNEL_B_COLUMN_NAME: &str = "channel_b_mv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Opened,
    Configured,
    Armed,
    Capturing,
    Stopped,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Unopened => "unopened",
            SessionState::Opened => "opened",
            SessionState::Configured => "configured",
            SessionState::Armed => "armed",
            SessionState::Capturing => "capturing",
            SessionState::Stopped => "stopped",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const QUERY_STATES: &[SessionState] = &[
    SessionState::Opened,
    SessionState::Configured,
    SessionState::Armed,
    SessionState::Stopped,
];

#[derive(Debug, thiserror::Error)]
pub enum PicoScopeError {
    #[error("Cannot {operation} while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Failed to open unit {serial} (driver returned {code}): {reason}")]
    OpenFailed {
        serial: String,
        code: i16,
        reason: String,
    },

    #[error("Failed to configure channel {channel} (driver returned {code}): {reason}")]
    ChannelSetupFailed {
        channel: Channel,
        code: i16,
        reason: String,
    },

    #[error("Failed to set trigger (driver returned {code}): {reason}")]
    TriggerSetupFailed { code: i16, reason: String },

    #[error("Timebase {timebase} rejected for {samples} samples: {reason}")]
    TimebaseRejected {
        timebase: u16,
        samples: u32,
        reason: String,
    },

    #[error("No timebase has a sample interval within {threshold_ns} ns (fastest is {fastest_interval_ns} ns)")]
    NoTimebaseWithinThreshold {
        threshold_ns: i32,
        fastest_interval_ns: i32,
    },

    #[error("Capture of {requested} samples exceeds the {max_samples} samples available at this timebase")]
    SampleBudgetExceeded { requested: u32, max_samples: i32 },

    #[error("Failed to start block capture (driver returned {code}): {reason}")]
    RunBlockFailed { code: i16, reason: String },

    #[error("Capture did not complete within {waited:?}")]
    ReadyTimeout { waited: Duration },

    #[error("Capture was cancelled")]
    Cancelled,

    #[error("Unit {serial} stopped responding during capture")]
    UnitLost { serial: String },

    #[error("Failed to read sample values (driver returned {code}): {reason}")]
    GetValuesFailed { code: i32, reason: String },

    #[error("Failed to stop unit (driver returned {code}): {reason}")]
    StopFailed { code: i16, reason: String },

    #[error("Failed to close unit (driver returned {code}): {reason}")]
    CloseFailed { code: i16, reason: String },
}

/// Last raw driver result per call label, kept for inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusLog {
    entries: BTreeMap<&'static str, i32>,
}

impl StatusLog {
    pub fn record(&mut self, label: &'static str, result: impl Into<i32>) {
        let result = result.into();
        log::debug!("{} = {}", label, result);
        self.entries.insert(label, result);
    }

    pub fn get(&self, label: &str) -> Option<i32> {
        self.entries.get(label).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, i32)> + '_ {
        self.entries.iter().map(|(&label, &result)| (label, result))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared flag that aborts a pending [`PicoScope::block_capture_cancellable`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Everything a session is constructed with.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeSettings {
    pub range: VoltageRange,
    pub timebase: u16,
    pub description: String,
    /// Samples per block capture.
    pub sample_count: u32,
    pub oversample: i16,
    /// Longest time a block capture waits for the unit to report ready.
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            range: VoltageRange::default(),
            timebase: DEFAULT_TIMEBASE,
            description: String::new(),
            sample_count: PRE_TRIGGER_SAMPLES + POST_TRIGGER_SAMPLES,
            oversample: 1,
            ready_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl ScopeSettings {
    pub fn with_range(mut self, range: VoltageRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_timebase(mut self, timebase: u16) -> Self {
        self.timebase = timebase;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_oversample(mut self, oversample: i16) -> Self {
        self.oversample = oversample;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Result of one `ps2000_get_timebase` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimebaseDescriptor {
    pub sample_count: u32,
    pub timebase: u16,
    pub time_interval_ns: i32,
    /// `None` when the driver reported a unit code outside the known table.
    pub time_unit: Option<TimeUnit>,
    pub oversample: i16,
    pub max_samples: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStatistics {
    pub min_mv: f64,
    pub max_mv: f64,
    pub mean_mv: f64,
}

/// Calibrated output of one block capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub time_ns: Vec<f64>,
    pub channel_a_mv: Vec<f64>,
    pub channel_b_mv: Vec<f64>,
    pub range: VoltageRange,
    pub timebase: TimebaseDescriptor,
    /// Bit 0 set when channel A over-ranged, bit 1 for channel B.
    pub overflow: i16,
    pub time_indisposed_ms: i32,
}

impl CaptureResult {
    pub fn len(&self) -> usize {
        self.time_ns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ns.is_empty()
    }

    pub fn overflowed(&self, channel: Channel) -> bool {
        self.overflow & (1 << channel.code()) != 0
    }

    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        DataFrame::new(vec![
            Column::new(TIME_COLUMN_NAME.into(), self.time_ns.as_slice()),
            Column::new(CHANNEL_A_COLUMN_NAME.into(), self.channel_a_mv.as_slice()),
            Column::new(CHANNEL_B_COLUMN_NAME.into(), self.channel_b_mv.as_slice()),
        ])
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), PolarsError> {
        let mut df = self.to_dataframe()?;
        let mut file = std::fs::File::create(path)?;
        CsvWriter::new(&mut file).include_header(true).finish(&mut df)
    }

    /// Min, max and mean per channel, A first.
    pub fn channel_statistics(&self) -> Result<[ChannelStatistics; 2], PolarsError> {
        let stats = self
            .to_dataframe()?
            .lazy()
            .select([
                col(CHANNEL_A_COLUMN_NAME).min().alias("a_min"),
                col(CHANNEL_A_COLUMN_NAME).max().alias("a_max"),
                col(CHANNEL_A_COLUMN_NAME).mean().alias("a_mean"),
                col(CHANNEL_B_COLUMN_NAME).min().alias("b_min"),
                col(CHANNEL_B_COLUMN_NAME).max().alias("b_max"),
                col(CHANNEL_B_COLUMN_NAME).mean().alias("b_mean"),
            ])
            .collect()?;

        let value = |name: &str| -> Result<f64, PolarsError> {
            stats
                .column(name)?
                .f64()?
                .get(0)
                .ok_or_else(|| PolarsError::NoData("capture holds no samples".into()))
        };

        Ok([
            ChannelStatistics {
                min_mv: value("a_min")?,
                max_mv: value("a_max")?,
                mean_mv: value("a_mean")?,
            },
            ChannelStatistics {
                min_mv: value("b_min")?,
                max_mv: value("b_max")?,
                mean_mv: value("b_mean")?,
            },
        ])
    }
}

/// A session with one PicoScope 2000-series unit.
///
/// The session walks through [`SessionState`]s; each operation refuses to run
/// (without calling the driver) when the session is in the wrong state.
///
/// ```
/// use std::sync::Arc;
/// use picoscope_rs::{MockPicoDriver, PicoScope, ScopeSettings, UnitInfo, VoltageRange, Channel};
///
/// let driver = Arc::new(MockPicoDriver::single("JY214/1608"));
/// let settings = ScopeSettings::default().with_range(VoltageRange::V2);
/// let mut scope = PicoScope::new(driver, UnitInfo::new("JY214/1608", "2204A"), settings);
///
/// scope.open()?;
/// scope.setup_channels()?;
/// scope.setup_simple_trigger(Channel::A)?;
/// let capture = scope.block_capture()?;
/// scope.stop_capture()?;
/// scope.close()?;
///
/// assert_eq!(capture.len(), 2000);
/// # Ok::<(), picoscope_rs::PicoScopeError>(())
/// ```
pub struct PicoScope<D: PicoDriver> {
    driver: D,
    unit: UnitInfo,
    settings: ScopeSettings,
    handle: Option<UnitHandle>,
    state: SessionState,
    status: StatusLog,
}

impl<D: PicoDriver> PicoScope<D> {
    pub fn new(driver: D, unit: UnitInfo, settings: ScopeSettings) -> Self {
        log::debug!("New session for unit {} ({:?})", unit, settings.description);
        Self {
            driver,
            unit,
            settings,
            handle: None,
            state: SessionState::Unopened,
            status: StatusLog::default(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn unit(&self) -> &UnitInfo {
        &self.unit
    }

    pub fn serial(&self) -> &str {
        &self.unit.serial
    }

    pub fn description(&self) -> &str {
        &self.settings.description
    }

    pub fn settings(&self) -> &ScopeSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> &StatusLog {
        &self.status
    }

    pub fn handle(&self) -> Option<UnitHandle> {
        self.handle
    }

    /// The range both channels are (or will be) configured with.
    pub fn channel_range(&self) -> VoltageRange {
        self.settings.range
    }

    /// Takes effect on the next [`Self::setup_channels`].
    pub fn set_channel_range(&mut self, range: VoltageRange) {
        self.settings.range = range;
    }

    /// Takes effect on the next [`Self::block_capture`].
    pub fn set_timebase(&mut self, timebase: u16) {
        self.settings.timebase = timebase;
    }

    fn check_state(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), PicoScopeError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PicoScopeError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn live_handle(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<UnitHandle, PicoScopeError> {
        self.check_state(operation, allowed)?;
        self.handle.ok_or(PicoScopeError::InvalidState {
            operation,
            state: self.state,
        })
    }

    fn describe_last_error(&self, handle: Option<UnitHandle>) -> String {
        match self.driver.last_error(handle) {
            Some(PicoErrorCode::Ok) | None => "no error information".to_string(),
            Some(code) => code.to_string(),
        }
    }

    pub fn open(&mut self) -> Result<UnitHandle, PicoScopeError> {
        self.check_state("open", &[SessionState::Unopened])?;
        let _span = tracing::debug_span!("open", serial = %self.unit.serial).entered();

        let raw = self.driver.open_unit(&self.unit.serial);
        self.status.record("openUnit", raw);

        match UnitHandle::from_raw(raw) {
            Some(handle) => {
                log::info!("Opened unit {} with handle {}", self.unit, handle.raw());
                self.handle = Some(handle);
                self.state = SessionState::Opened;
                Ok(handle)
            }
            None => Err(PicoScopeError::OpenFailed {
                serial: self.unit.serial.clone(),
                code: raw,
                reason: self.describe_last_error(None),
            }),
        }
    }

    /// Enable channels A and B, DC coupled, at the session's range.
    pub fn setup_channels(&mut self) -> Result<(), PicoScopeError> {
        let handle = self.live_handle(
            "configure channels",
            &[
                SessionState::Opened,
                SessionState::Configured,
                SessionState::Armed,
                SessionState::Stopped,
            ],
        )?;

        for (channel, label) in [(Channel::A, "setChA"), (Channel::B, "setChB")] {
            let setting = ChannelSetting::enabled_dc(channel, self.settings.range);
            let status = self.driver.set_channel(handle, &setting);
            self.status.record(label, status);
            if status <= 0 {
                return Err(PicoScopeError::ChannelSetupFailed {
                    channel,
                    code: status,
                    reason: self.describe_last_error(Some(handle)),
                });
            }
        }

        log::debug!(
            "Channels A and B set to {} on unit {}",
            self.settings.range,
            self.unit.serial
        );
        if self.state == SessionState::Opened {
            self.state = SessionState::Configured;
        }
        Ok(())
    }

    /// Rising edge on `channel` at 1024 ADC counts, auto-triggering after 1 s.
    pub fn setup_simple_trigger(&mut self, channel: Channel) -> Result<(), PicoScopeError> {
        self.setup_trigger(SimpleTrigger::rising_edge(channel))
    }

    pub fn setup_trigger(&mut self, trigger: SimpleTrigger) -> Result<(), PicoScopeError> {
        let handle = self.live_handle(
            "configure the trigger",
            &[
                SessionState::Configured,
                SessionState::Armed,
                SessionState::Stopped,
            ],
        )?;

        let status = self.driver.set_trigger(handle, &trigger);
        self.status.record("trigger", status);
        if status <= 0 {
            return Err(PicoScopeError::TriggerSetupFailed {
                code: status,
                reason: self.describe_last_error(Some(handle)),
            });
        }

        log::debug!("Trigger armed: {:?}", trigger);
        self.state = SessionState::Armed;
        Ok(())
    }

    fn query_timebase(
        &mut self,
        handle: UnitHandle,
        timebase: u16,
    ) -> Result<TimebaseDescriptor, PicoScopeError> {
        let samples = self.settings.sample_count;
        let (status, report) = self.driver.get_timebase(
            handle,
            i16::try_from(timebase).unwrap_or(i16::MAX),
            i32::try_from(samples).unwrap_or(i32::MAX),
            self.settings.oversample,
        );
        self.status.record("getTimebase", status);
        if status <= 0 {
            return Err(PicoScopeError::TimebaseRejected {
                timebase,
                samples,
                reason: self.describe_last_error(Some(handle)),
            });
        }

        Ok(TimebaseDescriptor {
            sample_count: samples,
            timebase,
            time_interval_ns: report.time_interval_ns,
            time_unit: TimeUnit::from_code(report.time_units),
            oversample: self.settings.oversample,
            max_samples: report.max_samples,
        })
    }

    /// Sample interval and memory available at `timebase` for the configured sample count.
    pub fn get_timebase(&mut self, timebase: u16) -> Result<TimebaseDescriptor, PicoScopeError> {
        let handle = self.live_handle("query a timebase", QUERY_STATES)?;
        self.query_timebase(handle, timebase)
    }

    /// Coarsest timebase whose sample interval is at most `threshold_ns`.
    ///
    /// The search walks up from timebase 1 and stops at the first interval above
    /// the threshold, at the first timebase the driver rejects, or at
    /// [`PS2000_MAX_TIMEBASE`]. If timebase 1 is already too coarse or is
    /// rejected, timebase 0 is checked on its own.
    pub fn find_optimal_timebase(&mut self, threshold_ns: i32) -> Result<u16, PicoScopeError> {
        let handle = self.live_handle("search timebases", QUERY_STATES)?;

        let mut best = None;
        for timebase in 1..=PS2000_MAX_TIMEBASE {
            match self.query_timebase(handle, timebase) {
                Ok(descriptor) if descriptor.time_interval_ns > threshold_ns => break,
                Ok(_) => best = Some(timebase),
                Err(e) => {
                    log::debug!("Timebase search ended at {}: {}", timebase, e);
                    break;
                }
            }
        }
        if let Some(timebase) = best {
            log::debug!("Optimal timebase for {} ns is {}", threshold_ns, timebase);
            return Ok(timebase);
        }

        let fastest = self.query_timebase(handle, 0)?;
        if fastest.time_interval_ns <= threshold_ns {
            Ok(0)
        } else {
            Err(PicoScopeError::NoTimebaseWithinThreshold {
                threshold_ns,
                fastest_interval_ns: fastest.time_interval_ns,
            })
        }
    }

    /// Run one block capture and wait (up to [`ScopeSettings::ready_timeout`]) for it.
    pub fn block_capture(&mut self) -> Result<CaptureResult, PicoScopeError> {
        self.capture(None)
    }

    /// Like [`Self::block_capture`], also returning [`PicoScopeError::Cancelled`] as
    /// soon as `cancel` is set.
    pub fn block_capture_cancellable(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<CaptureResult, PicoScopeError> {
        self.capture(Some(cancel))
    }

    fn capture(&mut self, cancel: Option<&CancelToken>) -> Result<CaptureResult, PicoScopeError> {
        let handle = self.live_handle(
            "run a block capture",
            &[SessionState::Armed, SessionState::Stopped],
        )?;
        let _span = tracing::debug_span!(
            "block_capture",
            serial = %self.unit.serial,
            timebase = self.settings.timebase
        )
        .entered();

        let timebase = self.query_timebase(handle, self.settings.timebase)?;
        let requested = timebase.sample_count;
        if i64::from(timebase.max_samples) < i64::from(requested) {
            return Err(PicoScopeError::SampleBudgetExceeded {
                requested,
                max_samples: timebase.max_samples,
            });
        }

        let (status, time_indisposed_ms) = self.driver.run_block(
            handle,
            i32::try_from(requested).unwrap_or(i32::MAX),
            i16::try_from(timebase.timebase).unwrap_or(i16::MAX),
            timebase.oversample,
        );
        self.status.record("runBlock", status);
        if status <= 0 {
            return Err(PicoScopeError::RunBlockFailed {
                code: status,
                reason: self.describe_last_error(Some(handle)),
            });
        }
        self.state = SessionState::Capturing;
        log::debug!(
            "Block of {} samples started, unit busy for {} ms",
            requested,
            time_indisposed_ms
        );

        self.wait_ready(handle, cancel)?;

        let mut buffer_a = vec![0i16; requested as usize];
        let mut buffer_b = vec![0i16; requested as usize];
        let (count, values) = self.driver.get_values(handle, &mut buffer_a, &mut buffer_b);
        self.status.record("getValues", count);
        if count <= 0 {
            return Err(PicoScopeError::GetValuesFailed {
                code: count,
                reason: self.describe_last_error(Some(handle)),
            });
        }
        let count = (count as usize).min(buffer_a.len());
        buffer_a.truncate(count);
        buffer_b.truncate(count);

        let range = self.settings.range;
        let interval_ns = f64::from(timebase.time_interval_ns);
        Ok(CaptureResult {
            time_ns: (0..count).map(|i| i as f64 * interval_ns).collect(),
            channel_a_mv: buffer_a.iter().map(|&raw| range.adc_to_mv(raw)).collect(),
            channel_b_mv: buffer_b.iter().map(|&raw| range.adc_to_mv(raw)).collect(),
            range,
            timebase,
            overflow: values.overflow,
            time_indisposed_ms,
        })
    }

    fn wait_ready(
        &mut self,
        handle: UnitHandle,
        cancel: Option<&CancelToken>,
    ) -> Result<(), PicoScopeError> {
        let start = Instant::now();
        loop {
            let ready = self.driver.ready(handle);
            self.status.record("isReady", ready);
            if ready > 0 {
                return Ok(());
            }
            if ready < 0 {
                return Err(PicoScopeError::UnitLost {
                    serial: self.unit.serial.clone(),
                });
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                log::info!("Capture on {} cancelled", self.unit.serial);
                return Err(PicoScopeError::Cancelled);
            }
            let waited = start.elapsed();
            if waited >= self.settings.ready_timeout {
                return Err(PicoScopeError::ReadyTimeout { waited });
            }
            if !self.settings.poll_interval.is_zero() {
                thread::sleep(self.settings.poll_interval);
            }
        }
    }

    pub fn stop_capture(&mut self) -> Result<(), PicoScopeError> {
        let handle = self.live_handle(
            "stop",
            &[
                SessionState::Armed,
                SessionState::Capturing,
                SessionState::Stopped,
            ],
        )?;

        let status = self.driver.stop(handle);
        self.status.record("stop", status);
        if status <= 0 {
            return Err(PicoScopeError::StopFailed {
                code: status,
                reason: self.describe_last_error(Some(handle)),
            });
        }
        self.state = SessionState::Stopped;
        Ok(())
    }

    /// Release the handle. The session is closed afterwards even if the driver
    /// reported a failure.
    pub fn close(&mut self) -> Result<(), PicoScopeError> {
        let handle = match (self.state, self.handle) {
            (SessionState::Unopened | SessionState::Closed, _) | (_, None) => {
                return Err(PicoScopeError::InvalidState {
                    operation: "close",
                    state: self.state,
                })
            }
            (_, Some(handle)) => handle,
        };

        let status = self.driver.close_unit(handle);
        self.status.record("close", status);
        self.handle = None;
        self.state = SessionState::Closed;
        if status <= 0 {
            return Err(PicoScopeError::CloseFailed {
                code: status,
                reason: self.describe_last_error(None),
            });
        }
        log::info!("Closed unit {}", self.unit);
        Ok(())
    }
}

impl<D: PicoDriver> Drop for PicoScope<D> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if self.driver.close_unit(handle) <= 0 {
                log::warn!("Failed to close unit {} on drop", self.unit.serial);
            } else {
                log::debug!("Closed unit {} on drop", self.unit.serial);
            }
        }
    }
}

impl<D: PicoDriver> fmt::Display for PicoScope<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "scope: {}", self.unit.serial)?;
        writeln!(f, "description: {}", self.settings.description)?;
        write!(f, "channel range: {}", self.channel_range())
    }
}

impl<D: PicoDriver> fmt::Debug for PicoScope<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PicoScope")
            .field("unit", &self.unit)
            .field("settings", &self.settings)
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_driver::{MockCall, MockPicoDriver, ReadyBehavior};

    const SERIAL: &str = "JY214/1608";

    type MockScope = PicoScope<Arc<MockPicoDriver>>;

    fn scope_with(driver: MockPicoDriver, settings: ScopeSettings) -> (Arc<MockPicoDriver>, MockScope) {
        let driver = Arc::new(driver);
        let scope = PicoScope::new(
            Arc::clone(&driver),
            UnitInfo::new(SERIAL, "2204A"),
            settings,
        );
        (driver, scope)
    }

    fn armed_scope(driver: MockPicoDriver, settings: ScopeSettings) -> (Arc<MockPicoDriver>, MockScope) {
        let (driver, mut scope) = scope_with(driver, settings);
        scope.open().unwrap();
        scope.setup_channels().unwrap();
        scope.setup_simple_trigger(Channel::A).unwrap();
        driver.clear_calls();
        (driver, scope)
    }

    #[test]
    fn test_range_round_trip_through_configuration() {
        for range in VoltageRange::ALL {
            let settings = ScopeSettings::default().with_range(range);
            let (driver, mut scope) = scope_with(MockPicoDriver::single(SERIAL), settings);
            scope.open().unwrap();
            scope.setup_channels().unwrap();

            assert_eq!(scope.channel_range(), range);
            assert_eq!(scope.channel_range().to_string(), range.as_str());
            let configured: Vec<VoltageRange> = driver
                .calls()
                .into_iter()
                .filter_map(|call| match call {
                    MockCall::SetChannel(setting) => Some(setting.range),
                    _ => None,
                })
                .collect();
            assert_eq!(configured, vec![range, range]);
        }
    }

    #[test]
    fn test_channels_a_and_b_are_configured() {
        let (driver, mut scope) = scope_with(MockPicoDriver::single(SERIAL), ScopeSettings::default());
        scope.open().unwrap();
        scope.setup_channels().unwrap();

        let channels: Vec<ChannelSetting> = driver
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::SetChannel(setting) => Some(setting),
                _ => None,
            })
            .collect();
        assert_eq!(
            channels,
            vec![
                ChannelSetting::enabled_dc(Channel::A, VoltageRange::Mv50),
                ChannelSetting::enabled_dc(Channel::B, VoltageRange::Mv50),
            ]
        );
        assert_eq!(scope.state(), SessionState::Configured);
        assert_eq!(scope.status().get("setChA"), Some(1));
        assert_eq!(scope.status().get("setChB"), Some(1));
    }

    #[test]
    fn test_find_optimal_timebase_linear_intervals() {
        let driver = MockPicoDriver::single(SERIAL).with_interval_ns(|tb| i32::from(tb) * 500);
        let (_, mut scope) = scope_with(driver, ScopeSettings::default());
        scope.open().unwrap();

        assert_eq!(scope.find_optimal_timebase(DEFAULT_TIMEBASE_THRESHOLD_NS).unwrap(), 2);
        assert_eq!(scope.find_optimal_timebase(2_600).unwrap(), 5);
    }

    #[test]
    fn test_find_optimal_timebase_lower_bound() {
        let driver = MockPicoDriver::single(SERIAL).with_interval_ns(|tb| 800 + i32::from(tb) * 400);
        let (_, mut scope) = scope_with(driver, ScopeSettings::default());
        scope.open().unwrap();
        // timebase 1 is 1200 ns, timebase 0 is 800 ns
        assert_eq!(scope.find_optimal_timebase(1000).unwrap(), 0);

        let err = scope.find_optimal_timebase(500).unwrap_err();
        assert!(matches!(
            err,
            PicoScopeError::NoTimebaseWithinThreshold {
                threshold_ns: 500,
                fastest_interval_ns: 800
            }
        ));
    }

    #[test]
    fn test_find_optimal_timebase_falls_back_when_timebase_1_rejected() {
        let driver = MockPicoDriver::single(SERIAL).with_max_timebase(0);
        let (driver, mut scope) = scope_with(driver, ScopeSettings::default());
        scope.open().unwrap();
        driver.clear_calls();

        assert_eq!(scope.find_optimal_timebase(1000).unwrap(), 0);
        assert_eq!(
            driver.calls(),
            vec![MockCall::GetTimebase(1), MockCall::GetTimebase(0)]
        );
        assert!(matches!(
            scope.find_optimal_timebase(5),
            Err(PicoScopeError::NoTimebaseWithinThreshold {
                threshold_ns: 5,
                fastest_interval_ns: 10
            })
        ));
    }

    #[test]
    fn test_find_optimal_timebase_stops_at_rejected_timebase() {
        let driver = MockPicoDriver::single(SERIAL)
            .with_interval_ns(|tb| i32::from(tb) * 10)
            .with_max_timebase(4);
        let (_, mut scope) = scope_with(driver, ScopeSettings::default());
        scope.open().unwrap();
        assert_eq!(scope.find_optimal_timebase(1_000_000).unwrap(), 4);
    }

    #[test]
    fn test_capture_time_axis_and_lengths() {
        let driver = MockPicoDriver::single(SERIAL).with_interval_ns(|_| 40);
        let settings = ScopeSettings::default()
            .with_range(VoltageRange::V1)
            .with_sample_count(500);
        let (driver, mut scope) = armed_scope(driver, settings);

        let capture = scope.block_capture().unwrap();
        assert_eq!(capture.len(), 500);
        assert_eq!(capture.channel_a_mv.len(), 500);
        assert_eq!(capture.channel_b_mv.len(), 500);
        assert_eq!(capture.time_ns[0], 0.0);
        assert_eq!(*capture.time_ns.last().unwrap(), 499.0 * 40.0);
        assert_eq!(capture.channel_a_mv[1], VoltageRange::V1.adc_to_mv(128));
        assert_eq!(capture.channel_b_mv[1], VoltageRange::V1.adc_to_mv(-128));
        assert_eq!(scope.state(), SessionState::Capturing);

        let calls = driver.calls();
        assert_eq!(calls[0], MockCall::GetTimebase(DEFAULT_TIMEBASE as i16));
        assert!(calls.contains(&MockCall::RunBlock {
            no_of_values: 500,
            timebase: DEFAULT_TIMEBASE as i16
        }));
        assert_eq!(calls.last(), Some(&MockCall::GetValues(500)));
        assert_eq!(scope.status().get("getValues"), Some(500));
        assert_eq!(scope.status().get("isReady"), Some(1));
    }

    #[test]
    fn test_capture_truncates_to_returned_count() {
        let driver = MockPicoDriver::single(SERIAL)
            .with_interval_ns(|_| 100)
            .with_values_returned(120);
        let (_, mut scope) = armed_scope(driver, ScopeSettings::default());

        let capture = scope.block_capture().unwrap();
        assert_eq!(capture.len(), 120);
        assert_eq!(capture.channel_a_mv.len(), 120);
        assert_eq!(*capture.time_ns.last().unwrap(), 119.0 * 100.0);
    }

    #[test]
    fn test_channel_failure_blocks_trigger_and_capture() {
        let driver = MockPicoDriver::single(SERIAL).with_failing_channel(Channel::B);
        let (driver, mut scope) = scope_with(driver, ScopeSettings::default());
        scope.open().unwrap();

        let err = scope.setup_channels().unwrap_err();
        assert!(matches!(
            err,
            PicoScopeError::ChannelSetupFailed {
                channel: Channel::B,
                code: 0,
                ..
            }
        ));
        assert_eq!(scope.state(), SessionState::Opened);
        assert_eq!(scope.status().get("setChB"), Some(0));

        driver.clear_calls();
        assert!(matches!(
            scope.setup_simple_trigger(Channel::A),
            Err(PicoScopeError::InvalidState { .. })
        ));
        assert!(matches!(
            scope.block_capture(),
            Err(PicoScopeError::InvalidState { .. })
        ));
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_trigger_failure_keeps_session_configured() {
        let driver = MockPicoDriver::single(SERIAL).with_failing_trigger();
        let (driver, mut scope) = scope_with(driver, ScopeSettings::default());
        scope.open().unwrap();
        scope.setup_channels().unwrap();

        assert!(matches!(
            scope.setup_simple_trigger(Channel::B),
            Err(PicoScopeError::TriggerSetupFailed { code: 0, ref reason })
                if reason == "the configuration information is corrupt or missing"
        ));
        assert_eq!(scope.state(), SessionState::Configured);
        assert_eq!(scope.status().get("trigger"), Some(0));

        driver.clear_calls();
        assert!(matches!(
            scope.block_capture(),
            Err(PicoScopeError::InvalidState {
                state: SessionState::Configured,
                ..
            })
        ));
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_run_block_failure_keeps_session_armed() {
        let driver = MockPicoDriver::single(SERIAL).with_failing_run_block();
        let (driver, mut scope) = armed_scope(driver, ScopeSettings::default());

        assert!(matches!(
            scope.block_capture(),
            Err(PicoScopeError::RunBlockFailed { code: 0, ref reason })
                if reason == "the oscilloscope is not responding"
        ));
        assert_eq!(scope.state(), SessionState::Armed);
        assert_eq!(scope.status().get("runBlock"), Some(0));
        assert!(!driver.calls().contains(&MockCall::Ready));
    }

    #[test]
    fn test_get_values_failure_leaves_session_capturing() {
        let driver = MockPicoDriver::single(SERIAL).with_values_returned(0);
        let (_, mut scope) = armed_scope(driver, ScopeSettings::default());

        assert!(matches!(
            scope.block_capture(),
            Err(PicoScopeError::GetValuesFailed { code: 0, .. })
        ));
        assert_eq!(scope.state(), SessionState::Capturing);
        assert_eq!(scope.status().get("getValues"), Some(0));

        scope.stop_capture().unwrap();
        assert_eq!(scope.state(), SessionState::Stopped);
    }

    #[test]
    fn test_stop_failure_leaves_state_unchanged() {
        let driver = MockPicoDriver::single(SERIAL).with_failing_stop();
        let (_, mut scope) = armed_scope(driver, ScopeSettings::default());

        assert!(matches!(
            scope.stop_capture(),
            Err(PicoScopeError::StopFailed { code: 0, .. })
        ));
        assert_eq!(scope.state(), SessionState::Armed);

        scope.block_capture().unwrap();
        let err = scope.stop_capture().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to stop unit (driver returned 0): the oscilloscope is not responding"
        );
        assert_eq!(scope.state(), SessionState::Capturing);
        assert_eq!(scope.status().get("stop"), Some(0));
    }

    #[test]
    fn test_capture_before_open_and_after_close() {
        let (driver, mut scope) = scope_with(MockPicoDriver::single(SERIAL), ScopeSettings::default());
        assert!(matches!(
            scope.block_capture(),
            Err(PicoScopeError::InvalidState {
                state: SessionState::Unopened,
                ..
            })
        ));
        assert!(driver.calls().is_empty());

        scope.open().unwrap();
        scope.setup_channels().unwrap();
        scope.setup_simple_trigger(Channel::A).unwrap();
        scope.close().unwrap();
        driver.clear_calls();

        assert!(matches!(
            scope.block_capture(),
            Err(PicoScopeError::InvalidState {
                state: SessionState::Closed,
                ..
            })
        ));
        assert!(matches!(
            scope.get_timebase(3),
            Err(PicoScopeError::InvalidState { .. })
        ));
        assert!(matches!(scope.close(), Err(PicoScopeError::InvalidState { .. })));
        assert!(driver.calls().is_empty());
        assert_eq!(scope.handle(), None);
    }

    #[test]
    fn test_open_failure_reports_driver_error() {
        let (_, mut scope) = scope_with(MockPicoDriver::single("OTHER/0001"), ScopeSettings::default());
        let err = scope.open().unwrap_err();
        assert!(matches!(
            err,
            PicoScopeError::OpenFailed { code: 0, ref reason, .. } if reason == "no PicoScope could be found"
        ));
        assert_eq!(scope.state(), SessionState::Unopened);
        assert_eq!(scope.status().get("openUnit"), Some(0));
    }

    #[test]
    fn test_ready_timeout() {
        let driver = MockPicoDriver::single(SERIAL).with_ready_behavior(ReadyBehavior::Never);
        let settings = ScopeSettings::default().with_ready_timeout(Duration::from_millis(20));
        let (_, mut scope) = armed_scope(driver, settings);

        assert!(matches!(
            scope.block_capture(),
            Err(PicoScopeError::ReadyTimeout { .. })
        ));
        assert_eq!(scope.state(), SessionState::Capturing);
        scope.stop_capture().unwrap();
        assert_eq!(scope.state(), SessionState::Stopped);
    }

    #[test]
    fn test_cancelled_capture() {
        let driver = MockPicoDriver::single(SERIAL).with_ready_behavior(ReadyBehavior::Never);
        let (_, mut scope) = armed_scope(driver, ScopeSettings::default());

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            scope.block_capture_cancellable(&cancel),
            Err(PicoScopeError::Cancelled)
        ));
    }

    #[test]
    fn test_cancel_token_reused_after_reset() {
        let (_, mut scope) = armed_scope(MockPicoDriver::single(SERIAL), ScopeSettings::default());
        let cancel = CancelToken::new();
        let handle_for_other_thread = cancel.clone();

        handle_for_other_thread.cancel();
        assert!(cancel.is_cancelled());
        assert!(matches!(
            scope.block_capture_cancellable(&cancel),
            Err(PicoScopeError::Cancelled)
        ));
        scope.stop_capture().unwrap();

        cancel.reset();
        assert!(!handle_for_other_thread.is_cancelled());
        let capture = scope.block_capture_cancellable(&cancel).unwrap();
        assert_eq!(capture.len(), 2000);
    }

    #[test]
    fn test_unit_lost_during_capture() {
        let driver = MockPicoDriver::single(SERIAL).with_ready_behavior(ReadyBehavior::UnitLost);
        let (_, mut scope) = armed_scope(driver, ScopeSettings::default());
        assert!(matches!(
            scope.block_capture(),
            Err(PicoScopeError::UnitLost { .. })
        ));
        assert_eq!(scope.status().get("isReady"), Some(-1));
    }

    #[test]
    fn test_sample_budget_exceeded() {
        let driver = MockPicoDriver::single(SERIAL).with_max_samples(1000);
        let (driver, mut scope) = armed_scope(driver, ScopeSettings::default());

        assert!(matches!(
            scope.block_capture(),
            Err(PicoScopeError::SampleBudgetExceeded {
                requested: 2000,
                max_samples: 1000
            })
        ));
        assert_eq!(driver.calls(), vec![MockCall::GetTimebase(DEFAULT_TIMEBASE as i16)]);
        assert_eq!(scope.state(), SessionState::Armed);

        scope.settings.sample_count = 1000;
        assert_eq!(scope.block_capture().unwrap().len(), 1000);
    }

    #[test]
    fn test_repeated_captures_after_stop() {
        let (driver, mut scope) = armed_scope(MockPicoDriver::single(SERIAL), ScopeSettings::default());
        for _ in 0..3 {
            let capture = scope.block_capture().unwrap();
            assert_eq!(capture.len(), 2000);
            scope.stop_capture().unwrap();
        }
        let runs = driver
            .calls()
            .into_iter()
            .filter(|call| matches!(call, MockCall::RunBlock { .. }))
            .count();
        assert_eq!(runs, 3);
        scope.setup_channels().unwrap();
        assert_eq!(scope.state(), SessionState::Stopped);
    }

    #[test]
    fn test_capture_requires_stop_between_runs() {
        let (_, mut scope) = armed_scope(MockPicoDriver::single(SERIAL), ScopeSettings::default());
        scope.block_capture().unwrap();
        assert!(matches!(
            scope.block_capture(),
            Err(PicoScopeError::InvalidState {
                state: SessionState::Capturing,
                ..
            })
        ));
    }

    #[test]
    fn test_drop_closes_open_handle() {
        let driver = Arc::new(MockPicoDriver::single(SERIAL));
        {
            let mut scope = PicoScope::new(
                Arc::clone(&driver),
                UnitInfo::new(SERIAL, "2204A"),
                ScopeSettings::default(),
            );
            scope.open().unwrap();
            assert_eq!(driver.open_handles(), 1);
        }
        assert_eq!(driver.open_handles(), 0);
    }

    #[test]
    fn test_close_failure_still_closes_session() {
        let driver = MockPicoDriver::single(SERIAL).with_failing_close();
        let (_, mut scope) = scope_with(driver, ScopeSettings::default());
        scope.open().unwrap();
        assert!(matches!(scope.close(), Err(PicoScopeError::CloseFailed { .. })));
        assert_eq!(scope.state(), SessionState::Closed);
        assert_eq!(scope.status().get("close"), Some(0));
    }

    #[test]
    fn test_display() {
        let settings = ScopeSettings::default()
            .with_range(VoltageRange::V2)
            .with_description("left bottom scope");
        let (_, scope) = scope_with(MockPicoDriver::single(SERIAL), settings);
        assert_eq!(
            scope.to_string(),
            "scope: JY214/1608\ndescription: left bottom scope\nchannel range: 2V"
        );
    }

    #[test]
    fn test_capture_export() {
        let driver = MockPicoDriver::single(SERIAL)
            .with_interval_ns(|_| 10)
            .with_overflow(0b10)
            .with_samples(|channel, index| match channel {
                Channel::A => (index as i16) * 100,
                Channel::B => 32767,
            });
        let settings = ScopeSettings::default()
            .with_range(VoltageRange::V1)
            .with_sample_count(3);
        let (_, mut scope) = armed_scope(driver, settings);
        let capture = scope.block_capture().unwrap();

        assert!(!capture.overflowed(Channel::A));
        assert!(capture.overflowed(Channel::B));

        let df = capture.to_dataframe().unwrap();
        assert_eq!(df.height(), 3);
        assert_eq!(
            df.get_column_names_str(),
            vec![TIME_COLUMN_NAME, CHANNEL_A_COLUMN_NAME, CHANNEL_B_COLUMN_NAME]
        );

        let [a, b] = capture.channel_statistics().unwrap();
        assert_eq!(a.min_mv, 0.0);
        assert_eq!(a.max_mv, VoltageRange::V1.adc_to_mv(200));
        assert_eq!(b.mean_mv, 1000.0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.csv");
        capture.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("time_ns,channel_a_mv,channel_b_mv"));
        assert_eq!(text.lines().count(), 4);
    }
}
