use std::fmt;

use crate::pico_driver::{DriverError, PicoDriver, UnitInfo};
use crate::pico_scope::{PicoScope, PicoScopeError, ScopeSettings};

/// Locations and serials of the units on the bench.
pub const DEFAULT_UNIT_LOCATIONS: [(&str, &str); 2] = [
    ("left_bottom", "JY214/1608"),
    ("right_bottom", "JY214/1781"),
];

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Location {location} is not in the unit table")]
    LocationUnknown { location: String },

    #[error("No unit found for location {location} (expected serial {expected_serial})")]
    LocationUnmatched {
        location: String,
        expected_serial: String,
    },

    #[error("Scope error: {0}")]
    Scope(#[from] PicoScopeError),
}

/// Ordered mapping from location label to the serial expected there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLocationTable {
    entries: Vec<(String, String)>,
}

impl Default for UnitLocationTable {
    fn default() -> Self {
        DEFAULT_UNIT_LOCATIONS.into_iter().collect()
    }
}

impl<L: Into<String>, S: Into<String>> FromIterator<(L, S)> for UnitLocationTable {
    fn from_iter<I: IntoIterator<Item = (L, S)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (location, serial) in iter {
            table.insert(location, serial);
        }
        table
    }
}

impl UnitLocationTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a location, replacing the serial if the location already exists.
    pub fn insert(&mut self, location: impl Into<String>, serial: impl Into<String>) {
        let location = location.into();
        let serial = serial.into();
        match self.entries.iter_mut().find(|(known, _)| *known == location) {
            Some(entry) => entry.1 = serial,
            None => self.entries.push((location, serial)),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>, serial: impl Into<String>) -> Self {
        self.insert(location, serial);
        self
    }

    pub fn expected_serial(&self, location: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(known, _)| known == location)
            .map(|(_, serial)| serial.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(location, serial)| (location.as_str(), serial.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotAssignment {
    Matched(UnitInfo),
    Unmatched { expected_serial: String },
}

impl SlotAssignment {
    pub fn unit(&self) -> Option<&UnitInfo> {
        match self {
            SlotAssignment::Matched(unit) => Some(unit),
            SlotAssignment::Unmatched { .. } => None,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, SlotAssignment::Matched(_))
    }
}

/// Outcome of matching enumerated units against a [`UnitLocationTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    slots: Vec<(String, SlotAssignment)>,
    unrecognized: Vec<UnitInfo>,
}

impl DiscoveryReport {
    /// Assignments in table order.
    pub fn slots(&self) -> impl Iterator<Item = (&str, &SlotAssignment)> {
        self.slots
            .iter()
            .map(|(location, assignment)| (location.as_str(), assignment))
    }

    pub fn assignment(&self, location: &str) -> Option<&SlotAssignment> {
        self.slots
            .iter()
            .find(|(known, _)| known == location)
            .map(|(_, assignment)| assignment)
    }

    pub fn unit_for(&self, location: &str) -> Option<&UnitInfo> {
        self.assignment(location).and_then(SlotAssignment::unit)
    }

    /// Units whose serial matched no free location.
    pub fn unrecognized(&self) -> &[UnitInfo] {
        &self.unrecognized
    }

    pub fn units_found(&self) -> usize {
        self.slots.iter().filter(|(_, slot)| slot.is_matched()).count() + self.unrecognized.len()
    }
}

impl fmt::Display for DiscoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} unit(s) found", self.units_found())?;
        for (location, assignment) in self.slots() {
            match assignment {
                SlotAssignment::Matched(unit) => writeln!(f, "  {}: {}", location, unit)?,
                SlotAssignment::Unmatched { expected_serial } => {
                    writeln!(f, "  {}: missing (expected {})", location, expected_serial)?
                }
            }
        }
        for unit in &self.unrecognized {
            writeln!(f, "  unrecognized: {}", unit)?;
        }
        Ok(())
    }
}

/// Assign each unit to the location whose expected serial equals its serial.
///
/// The first unit with a given serial takes the location; any later unit with
/// the same serial ends up in [`DiscoveryReport::unrecognized`].
pub fn match_units(units: &[UnitInfo], table: &UnitLocationTable) -> DiscoveryReport {
    let mut slots: Vec<(String, SlotAssignment)> = table
        .iter()
        .map(|(location, serial)| {
            (
                location.to_string(),
                SlotAssignment::Unmatched {
                    expected_serial: serial.to_string(),
                },
            )
        })
        .collect();
    let mut unrecognized = Vec::new();

    for unit in units {
        let free_slot = slots.iter_mut().find(|(_, slot)| {
            matches!(slot, SlotAssignment::Unmatched { expected_serial } if *expected_serial == unit.serial)
        });
        match free_slot {
            Some((_, slot)) => *slot = SlotAssignment::Matched(unit.clone()),
            None => unrecognized.push(unit.clone()),
        }
    }

    DiscoveryReport {
        slots,
        unrecognized,
    }
}

pub struct PicoConnector;

impl PicoConnector {
    /// All units the driver can currently see.
    pub fn get_available_units<D: PicoDriver>(driver: &D) -> Result<Vec<UnitInfo>, ConnectorError> {
        let units = driver.enumerate_units()?;
        log::debug!("Driver enumerated {} unit(s)", units.len());
        Ok(units)
    }

    pub fn discover<D: PicoDriver>(
        driver: &D,
        table: &UnitLocationTable,
    ) -> Result<DiscoveryReport, ConnectorError> {
        let units = Self::get_available_units(driver)?;
        log::info!("Found {} PicoScope unit(s)", units.len());

        let report = match_units(&units, table);
        for (location, assignment) in report.slots() {
            match assignment {
                SlotAssignment::Matched(unit) => log::info!("{}: {}", location, unit),
                SlotAssignment::Unmatched { expected_serial } => {
                    log::debug!("{}: no unit with serial {}", location, expected_serial)
                }
            }
        }
        for unit in report.unrecognized() {
            log::warn!("Unrecognized PicoScope {}", unit);
        }
        Ok(report)
    }

    /// Discover units and open a session with the one at `location`.
    ///
    /// An empty description in `settings` is replaced by the location label.
    pub fn connect<D: PicoDriver>(
        driver: D,
        table: &UnitLocationTable,
        location: &str,
        mut settings: ScopeSettings,
    ) -> Result<PicoScope<D>, ConnectorError> {
        let report = Self::discover(&driver, table)?;
        let unit = match report.assignment(location) {
            None => {
                return Err(ConnectorError::LocationUnknown {
                    location: location.to_string(),
                })
            }
            Some(SlotAssignment::Unmatched { expected_serial }) => {
                return Err(ConnectorError::LocationUnmatched {
                    location: location.to_string(),
                    expected_serial: expected_serial.clone(),
                })
            }
            Some(SlotAssignment::Matched(unit)) => unit.clone(),
        };

        if settings.description.is_empty() {
            settings.description = location.to_string();
        }
        let mut scope = PicoScope::new(driver, unit, settings);
        scope.open()?;
        Ok(scope)
    }
}
