//! # PicoScope RS
//!
//! A Rust library for driving PicoScope 2000-series oscilloscopes through the
//! PicoSDK `ps2000` driver.
//!
//! This library wraps the driver in a session type that tracks the unit's state
//! (open, configured, armed, capturing, stopped, closed), captures calibrated
//! blocks on channels A and B, and matches attached units to bench locations by
//! serial number.
//!
//! ## Features
//!
//! - **Runtime driver loading**: the vendor library is loaded with `libloading`,
//!   so the crate builds without the PicoSDK installed
//! - **Explicit session state**: operations called out of order fail with an error
//!   instead of reaching the driver
//! - **Bounded captures**: waiting for a block has a timeout and can be cancelled
//! - **Unit discovery**: map serial numbers to named locations
//! - **DataFrame output**: captures convert to `polars` DataFrames and CSV
//! - **Mock driver**: develop and test without hardware
//!
//! ## Examples
//!
//! ### Block Capture
//!
//! ```rust,no_run
//! use picoscope_rs::{Channel, PicoConnector, Ps2000Library, ScopeSettings, UnitLocationTable, VoltageRange};
//!
//! let driver = Ps2000Library::load()?;
//! let settings = ScopeSettings::default().with_range(VoltageRange::V2);
//! let mut scope = PicoConnector::connect(&driver, &UnitLocationTable::default(), "left_bottom", settings)?;
//!
//! scope.setup_channels()?;
//! scope.setup_simple_trigger(Channel::A)?;
//! let capture = scope.block_capture()?;
//! scope.stop_capture()?;
//! capture.write_csv("capture.csv")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Choosing a Timebase
//!
//! ```rust
//! use picoscope_rs::{MockPicoDriver, PicoScope, ScopeSettings, UnitInfo};
//!
//! let driver = MockPicoDriver::single("JY214/1608").with_interval_ns(|tb| i32::from(tb) * 500);
//! let mut scope = PicoScope::new(driver, UnitInfo::new("JY214/1608", "2204A"), ScopeSettings::default());
//! scope.open()?;
//!
//! // Coarsest timebase that still samples at least every microsecond
//! let timebase = scope.find_optimal_timebase(1000)?;
//! assert_eq!(timebase, 2);
//! scope.set_timebase(timebase);
//! # Ok::<(), picoscope_rs::PicoScopeError>(())
//! ```
//!
//! ### Trigger Configuration
//!
//! ```rust
//! use picoscope_rs::{Channel, SimpleTrigger, VoltageRange};
//!
//! let trigger = SimpleTrigger::start_capturing_when(Channel::B)
//!     .falls_below_mv(-200.0, VoltageRange::V1)
//!     .delay_percent(-50)
//!     .build();
//! assert_eq!(trigger.delay_percent, -50);
//! ```
//!
//! ### Unit Discovery
//!
//! ```rust
//! use picoscope_rs::{MockPicoDriver, PicoConnector, UnitInfo, UnitLocationTable};
//!
//! let driver = MockPicoDriver::new(vec![
//!     UnitInfo::new("JY214/1781", "2204A"),
//!     UnitInfo::new("XY000/0042", "2205A"),
//! ]);
//! let report = PicoConnector::discover(&driver, &UnitLocationTable::default())?;
//!
//! assert!(report.unit_for("left_bottom").is_none());
//! assert_eq!(report.unit_for("right_bottom").unwrap().serial, "JY214/1781");
//! assert_eq!(report.unrecognized().len(), 1);
//! # Ok::<(), picoscope_rs::ConnectorError>(())
//! ```

pub mod channel_config;
pub mod mock_driver;
pub mod pico_connector;
pub mod pico_driver;
pub mod pico_scope;
pub mod ps2000_library;
pub mod trigger_config;

// Re-export the main types for convenience
pub use channel_config::{
    Channel, ChannelSetting, Coupling, RangeParseError, TimeUnit, VoltageRange, MAX_ADC_VALUE,
};

pub use trigger_config::{SimpleTrigger, SimpleTriggerBuilder, ThresholdDirection, TriggerSource};

pub use pico_driver::{DriverError, PicoDriver, PicoErrorCode, UnitHandle, UnitInfo};

pub use ps2000_library::Ps2000Library;

pub use mock_driver::{MockCall, MockPicoDriver, ReadyBehavior};

pub use pico_scope::{
    CancelToken, CaptureResult, ChannelStatistics, PicoScope, PicoScopeError, ScopeSettings,
    SessionState, StatusLog, TimebaseDescriptor,
};

pub use pico_connector::{
    match_units, ConnectorError, DiscoveryReport, PicoConnector, SlotAssignment, UnitLocationTable,
};
