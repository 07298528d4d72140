//! Unit registry: every physical unit the engine understands, grouped into
//! categories of mutually convertible units.
//!
//! All conversions inside a category go through the category's base unit
//! with a linear factor, except temperature which needs affine conversion.
//! Generic units (pH, raw counts, percentages) only convert to themselves.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitCategory {
    Time,
    Volume,
    Temperature,
    Distance,
    Conductivity,
    Pressure,
    Flow,
    Light,
    Generic,
}

/// Linear factor to the category base unit. Temperature is handled
/// separately and has no entry here.
fn base_factor(unit: &str) -> Option<(UnitCategory, f64)> {
    use UnitCategory::*;
    let entry = match unit {
        // time, base: s
        "ms" => (Time, 0.001),
        "s" => (Time, 1.0),
        "min" => (Time, 60.0),
        "h" => (Time, 3600.0),
        // volume, base: ml
        "ml" => (Volume, 1.0),
        "l" => (Volume, 1000.0),
        // distance, base: mm
        "mm" => (Distance, 1.0),
        "cm" => (Distance, 10.0),
        "m" => (Distance, 1000.0),
        "inch" => (Distance, 25.4),
        "ft" => (Distance, 304.8),
        // conductivity, base: uS/cm
        "uS_cm" => (Conductivity, 1.0),
        "mS_cm" => (Conductivity, 1000.0),
        // pressure, base: Pa
        "pa" => (Pressure, 1.0),
        "kpa" => (Pressure, 1000.0),
        "bar" => (Pressure, 100_000.0),
        "psi" => (Pressure, 6894.757),
        // flow, base: ml/min
        "ml_min" => (Flow, 1.0),
        "l_min" => (Flow, 1000.0),
        "l_h" => (Flow, 1000.0 / 60.0),
        // light
        "umol_m2_s" => (Light, 1.0),
        // generic identity units
        "ph" | "pH" => (Generic, 1.0),
        "pct" => (Generic, 1.0),
        "raw" => (Generic, 1.0),
        "pwm" => (Generic, 1.0),
        _ => return None,
    };
    Some(entry)
}

pub fn category_of(unit: &str) -> Option<UnitCategory> {
    if matches!(unit, "C" | "F" | "K") {
        return Some(UnitCategory::Temperature);
    }
    base_factor(unit).map(|(cat, _)| cat)
}

/// Whether two units may appear on opposite sides of a comparison or
/// assignment. Generic units are only compatible with themselves.
pub fn compatible(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (category_of(a), category_of(b)) {
        (Some(UnitCategory::Generic), _) | (_, Some(UnitCategory::Generic)) => false,
        (Some(ca), Some(cb)) => ca == cb,
        _ => false,
    }
}

fn to_celsius(value: f64, from: &str) -> Option<f64> {
    match from {
        "C" => Some(value),
        "F" => Some((value - 32.0) * 5.0 / 9.0),
        "K" => Some(value - 273.15),
        _ => None,
    }
}

fn from_celsius(value: f64, to: &str) -> Option<f64> {
    match to {
        "C" => Some(value),
        "F" => Some(value * 9.0 / 5.0 + 32.0),
        "K" => Some(value + 273.15),
        _ => None,
    }
}

/// Convert a value between two units of the same category.
pub fn convert(value: f64, from: &str, to: &str) -> Result<f64, EngineError> {
    if from == to {
        return Ok(value);
    }

    if let Some(c) = to_celsius(value, from) {
        return from_celsius(c, to).ok_or_else(|| EngineError::UnitIncompatibility {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let (cat_from, f_from) =
        base_factor(from).ok_or_else(|| EngineError::UnknownUnit(from.to_string()))?;
    let (cat_to, f_to) = base_factor(to).ok_or_else(|| EngineError::UnknownUnit(to.to_string()))?;

    if cat_from != cat_to || cat_from == UnitCategory::Generic {
        return Err(EngineError::UnitIncompatibility {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    Ok(value * f_from / f_to)
}
