use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Upper bound (exclusive) for any emission quantity or limit.
pub fn max_magnitude() -> Decimal {
    Decimal::from(1_000_000_000_000_i64)
}

/// Parse a decimal quantity from its external string representation.
///
/// `rust_decimal` has no NaN/Infinity values, so non-finite inputs fail to
/// parse and are rejected here rather than silently coerced.
pub fn parse_decimal(raw: &str) -> DomainResult<Decimal> {
    Decimal::from_str(raw.trim())
        .map_err(|e| DomainError::InvalidQuantity(format!("{raw:?} is not a decimal: {e}")))
}

/// Convert a float from an external representation into an exact decimal.
/// NaN and infinities are rejected, never clamped.
pub fn decimal_from_f64(value: f64) -> DomainResult<Decimal> {
    if !value.is_finite() {
        return Err(DomainError::InvalidQuantity(format!(
            "{value} is not a finite number"
        )));
    }
    Decimal::from_f64(value)
        .ok_or_else(|| DomainError::InvalidQuantity(format!("{value} is not representable")))
}

/// A measurement value must be strictly positive and below the magnitude
/// ceiling. A zero reading is rejected upstream by request validation; this
/// guard exists so malformed data can never reach an aggregate.
pub fn ensure_measurement_value(value: Decimal) -> DomainResult<()> {
    if value <= Decimal::ZERO {
        return Err(DomainError::InvalidQuantity(format!(
            "emission value must be strictly positive, got {value}"
        )));
    }
    if value >= max_magnitude() {
        return Err(DomainError::InvalidQuantity(format!(
            "emission value {value} exceeds the supported magnitude"
        )));
    }
    Ok(())
}

/// An emission limit may be any non-negative decimal below the ceiling.
pub fn ensure_emission_limit(value: Decimal) -> DomainResult<()> {
    if value < Decimal::ZERO {
        return Err(DomainError::InvalidQuantity(format!(
            "emission limit must be non-negative, got {value}"
        )));
    }
    if value >= max_magnitude() {
        return Err(DomainError::InvalidQuantity(format!(
            "emission limit {value} exceeds the supported magnitude"
        )));
    }
    Ok(())
}

/// Unit of an emission reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmissionUnit {
    Kg,
    Tonne,
    Scf,
    Ppm,
}

impl EmissionUnit {
    /// Conversion factor to the kilogram basis used by site aggregates.
    pub fn kg_factor(&self) -> Decimal {
        match self {
            EmissionUnit::Kg => Decimal::ONE,
            EmissionUnit::Tonne => Decimal::from(1000),
            // 0.0192 kg per standard cubic foot of methane
            EmissionUnit::Scf => Decimal::new(192, 4),
            EmissionUnit::Ppm => Decimal::new(1, 6),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmissionUnit::Kg => "kg",
            EmissionUnit::Tonne => "tonne",
            EmissionUnit::Scf => "scf",
            EmissionUnit::Ppm => "ppm",
        }
    }
}

impl fmt::Display for EmissionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmissionUnit {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kg" => Ok(EmissionUnit::Kg),
            "tonne" => Ok(EmissionUnit::Tonne),
            "scf" => Ok(EmissionUnit::Scf),
            "ppm" => Ok(EmissionUnit::Ppm),
            other => Err(DomainError::ValidationError(format!(
                "unknown emission unit: {other}"
            ))),
        }
    }
}

/// Normalize a reading to the kilogram basis.
pub fn normalized_kg(value: Decimal, unit: EmissionUnit) -> Decimal {
    value * unit.kg_factor()
}
