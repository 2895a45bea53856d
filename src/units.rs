//! Conversion between the normalized units statistics are stored in and the
//! units the user wants to see.
//!
//! Statistics are always persisted in the normalized unit (`Pa`, `°C`, `m³`).
//! Conversion happens at the query boundary, and in reverse when a caller
//! supplies an adjustment expressed in their display unit. Unknown units pass
//! through unchanged.

pub const UNIT_PASCAL: &str = "Pa";
pub const UNIT_CELSIUS: &str = "°C";
pub const UNIT_CUBIC_METERS: &str = "m³";

pub const UNIT_HECTOPASCAL: &str = "hPa";
pub const UNIT_PSI: &str = "psi";
pub const UNIT_FAHRENHEIT: &str = "°F";
pub const UNIT_CUBIC_FEET: &str = "ft³";

const PA_PER_HPA: f64 = 100.0;
const PA_PER_PSI: f64 = 6894.757293168361;
const CUBIC_FEET_PER_CUBIC_METER: f64 = 35.31466672148859;

/// The user's configured unit system, snapshotted into each unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSystem {
    Metric,
    Imperial,
}

impl UnitSystem {
    fn pressure_unit(self) -> &'static str {
        match self {
            Self::Metric => UNIT_HECTOPASCAL,
            Self::Imperial => UNIT_PSI,
        }
    }

    fn temperature_unit(self) -> &'static str {
        match self {
            Self::Metric => UNIT_CELSIUS,
            Self::Imperial => UNIT_FAHRENHEIT,
        }
    }

    fn volume_unit(self) -> &'static str {
        match self {
            Self::Metric => UNIT_CUBIC_METERS,
            Self::Imperial => UNIT_CUBIC_FEET,
        }
    }
}

/// The unit a stored series is presented in for the given unit system.
/// Units without a configured conversion are displayed as stored.
pub fn display_unit(normalized_unit: Option<&str>, system: UnitSystem) -> Option<String> {
    let unit = normalized_unit?;
    let display = match unit {
        UNIT_PASCAL => system.pressure_unit(),
        UNIT_CELSIUS => system.temperature_unit(),
        UNIT_CUBIC_METERS => system.volume_unit(),
        other => other,
    };
    Some(display.to_string())
}

/// Convert a stored value to the display unit for `system`.
pub fn to_display(value: Option<f64>, normalized_unit: Option<&str>, system: UnitSystem) -> Option<f64> {
    let value = value?;
    let converted = match normalized_unit {
        Some(UNIT_PASCAL) => match system.pressure_unit() {
            UNIT_HECTOPASCAL => value / PA_PER_HPA,
            UNIT_PSI => value / PA_PER_PSI,
            _ => value,
        },
        Some(UNIT_CELSIUS) => match system.temperature_unit() {
            UNIT_FAHRENHEIT => value * 9.0 / 5.0 + 32.0,
            _ => value,
        },
        Some(UNIT_CUBIC_METERS) => match system.volume_unit() {
            UNIT_CUBIC_FEET => value * CUBIC_FEET_PER_CUBIC_METER,
            _ => value,
        },
        _ => value,
    };
    Some(converted)
}

/// Convert a value expressed in the display unit for `system` back to the
/// normalized storage unit. Inverse of [`to_display`].
pub fn to_normalized(value: Option<f64>, normalized_unit: Option<&str>, system: UnitSystem) -> Option<f64> {
    let value = value?;
    let converted = match normalized_unit {
        Some(UNIT_PASCAL) => match system.pressure_unit() {
            UNIT_HECTOPASCAL => value * PA_PER_HPA,
            UNIT_PSI => value * PA_PER_PSI,
            _ => value,
        },
        Some(UNIT_CELSIUS) => match system.temperature_unit() {
            UNIT_FAHRENHEIT => (value - 32.0) * 5.0 / 9.0,
            _ => value,
        },
        Some(UNIT_CUBIC_METERS) => match system.volume_unit() {
            UNIT_CUBIC_FEET => value / CUBIC_FEET_PER_CUBIC_METER,
            _ => value,
        },
        _ => value,
    };
    Some(converted)
}
