//! Calibration strategies: named conversions from a raw device reading to a
//! unit-tagged value, optionally backed by stored calibration points.
//!
//! A strategy declares the unit it outputs. `None` means "whatever the
//! device natively reports" and is resolved against the reading's unit at
//! execution time. The validator uses the same declaration to reject
//! configurations whose output unit cannot land in the target variable.

use serde::{Deserialize, Serialize};

/// One calibration point: raw input on the x axis, reference value on y.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalPoint {
    pub raw: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationStrategy {
    /// Pass the raw reading through unchanged.
    Raw,

    /// Shift the raw reading by a fixed offset.
    OffsetOnly { offset: f64 },

    /// Multi-point lookup with piecewise linear interpolation, e.g. tank
    /// volume from an ultrasonic distance reading. Readings outside the
    /// table clamp to the nearest end point.
    LinearLookup {
        points: Vec<CalPoint>,
        output_unit: String,
    },

    /// Two known reference points define slope and offset.
    TwoPointLinear {
        low: CalPoint,
        high: CalPoint,
        output_unit: String,
    },

    /// Segmented linear pH conversion with Nernst temperature compensation.
    /// One point calibrates offset around pH 7, two or more points calibrate
    /// slope segments.
    PhProbe {
        points: Vec<CalPoint>,
        reference_temp_c: f64,
    },

    /// Segmented linear EC conversion with linear temperature compensation
    /// (readings normalized to the reference temperature).
    EcProbe {
        points: Vec<CalPoint>,
        temp_coefficient: f64,
        reference_temp_c: f64,
    },
}

impl Default for CalibrationStrategy {
    fn default() -> Self {
        CalibrationStrategy::Raw
    }
}

impl CalibrationStrategy {
    /// The unit this strategy outputs, or `None` when it follows the
    /// device's native unit.
    pub fn output_unit(&self) -> Option<&str> {
        match self {
            CalibrationStrategy::Raw | CalibrationStrategy::OffsetOnly { .. } => None,
            CalibrationStrategy::LinearLookup { output_unit, .. }
            | CalibrationStrategy::TwoPointLinear { output_unit, .. } => Some(output_unit),
            CalibrationStrategy::PhProbe { .. } => Some("ph"),
            CalibrationStrategy::EcProbe { .. } => Some("mS_cm"),
        }
    }

    /// Resolve the effective output unit against the device's native unit.
    pub fn resolve_output_unit(&self, native_unit: &str) -> String {
        self.output_unit().unwrap_or(native_unit).to_string()
    }

    /// Apply the calibration to a raw reading. `water_temp_c` feeds the
    /// temperature-compensated strategies; when absent they assume the
    /// reference temperature.
    pub fn apply(&self, raw: f64, water_temp_c: Option<f64>) -> f64 {
        match self {
            CalibrationStrategy::Raw => raw,
            CalibrationStrategy::OffsetOnly { offset } => raw + offset,
            CalibrationStrategy::LinearLookup { points, .. } => interpolate(points, raw),
            CalibrationStrategy::TwoPointLinear { low, high, .. } => {
                interpolate(&[*low, *high], raw)
            }
            CalibrationStrategy::PhProbe {
                points,
                reference_temp_c,
            } => {
                let ph = match points.len() {
                    0 => raw,
                    // Single point calibrates the offset around neutral.
                    1 => raw + (points[0].value - points[0].raw),
                    _ => interpolate(points, raw),
                };
                // Nernst slope scales with absolute temperature; deviations
                // from neutral shrink or grow accordingly.
                let temp = water_temp_c.unwrap_or(*reference_temp_c);
                let factor = (temp + 273.15) / (reference_temp_c + 273.15);
                7.0 + (ph - 7.0) / factor
            }
            CalibrationStrategy::EcProbe {
                points,
                temp_coefficient,
                reference_temp_c,
            } => {
                let ec = match points.len() {
                    0 => raw,
                    1 => raw * (points[0].value / points[0].raw.max(f64::MIN_POSITIVE)),
                    _ => interpolate(points, raw),
                };
                let temp = water_temp_c.unwrap_or(*reference_temp_c);
                ec / (1.0 + temp_coefficient * (temp - reference_temp_c))
            }
        }
    }
}

/// Piecewise linear interpolation over calibration points, clamped to the
/// table ends. Points need not arrive sorted.
fn interpolate(points: &[CalPoint], x: f64) -> f64 {
    if points.is_empty() {
        return x;
    }
    let mut sorted: Vec<CalPoint> = points.to_vec();
    sorted.sort_by(|a, b| a.raw.total_cmp(&b.raw));

    if x <= sorted[0].raw {
        return sorted[0].value;
    }
    if x >= sorted[sorted.len() - 1].raw {
        return sorted[sorted.len() - 1].value;
    }
    for pair in sorted.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if x >= lo.raw && x <= hi.raw {
            let span = hi.raw - lo.raw;
            if span.abs() < f64::EPSILON {
                return lo.value;
            }
            let t = (x - lo.raw) / span;
            return lo.value + t * (hi.value - lo.value);
        }
    }
    sorted[sorted.len() - 1].value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(raw: f64, value: f64) -> CalPoint {
        CalPoint { raw, value }
    }

    #[test]
    fn raw_passes_through() {
        assert_eq!(CalibrationStrategy::Raw.apply(123.4, None), 123.4);
        assert_eq!(CalibrationStrategy::Raw.output_unit(), None);
    }

    #[test]
    fn offset_shifts_reading() {
        let s = CalibrationStrategy::OffsetOnly { offset: -3.0 };
        assert_eq!(s.apply(10.0, None), 7.0);
    }

    #[test]
    fn tank_volume_interpolates_between_points() {
        // Tank fills as distance to the water surface shrinks.
        let s = CalibrationStrategy::LinearLookup {
            points: vec![pt(100.0, 200.0), pt(500.0, 40.0)],
            output_unit: "l".into(),
        };
        assert_eq!(s.apply(300.0, None), 120.0);
        assert_eq!(s.output_unit(), Some("l"));
    }

    #[test]
    fn lookup_clamps_outside_table() {
        let s = CalibrationStrategy::LinearLookup {
            points: vec![pt(100.0, 200.0), pt(500.0, 40.0)],
            output_unit: "l".into(),
        };
        assert_eq!(s.apply(50.0, None), 200.0);
        assert_eq!(s.apply(900.0, None), 40.0);
    }

    #[test]
    fn lookup_handles_unsorted_points() {
        let s = CalibrationStrategy::LinearLookup {
            points: vec![pt(500.0, 40.0), pt(100.0, 200.0), pt(300.0, 120.0)],
            output_unit: "l".into(),
        };
        assert_eq!(s.apply(200.0, None), 160.0);
    }

    #[test]
    fn two_point_linear_maps_endpoints() {
        let s = CalibrationStrategy::TwoPointLinear {
            low: pt(0.0, 4.0),
            high: pt(1000.0, 7.0),
            output_unit: "ph".into(),
        };
        assert_eq!(s.apply(0.0, None), 4.0);
        assert_eq!(s.apply(1000.0, None), 7.0);
        assert_eq!(s.apply(500.0, None), 5.5);
    }

    #[test]
    fn ph_probe_at_reference_temp_is_uncompensated() {
        let s = CalibrationStrategy::PhProbe {
            points: vec![pt(1500.0, 4.0), pt(2000.0, 7.0)],
            reference_temp_c: 25.0,
        };
        assert!((s.apply(1750.0, Some(25.0)) - 5.5).abs() < 1e-9);
    }

    #[test]
    fn ph_probe_compensates_away_from_reference() {
        let s = CalibrationStrategy::PhProbe {
            points: vec![pt(1500.0, 4.0), pt(2000.0, 7.0)],
            reference_temp_c: 25.0,
        };
        let warm = s.apply(1750.0, Some(45.0));
        // Warmer water: the same deviation from neutral reads smaller.
        assert!(warm > 5.5 && warm < 7.0);
        assert_eq!(s.output_unit(), Some("ph"));
    }

    #[test]
    fn single_point_ph_is_offset_only() {
        let s = CalibrationStrategy::PhProbe {
            points: vec![pt(6.8, 7.0)],
            reference_temp_c: 25.0,
        };
        assert!((s.apply(6.8, None) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn ec_probe_normalizes_to_reference_temperature() {
        let s = CalibrationStrategy::EcProbe {
            points: vec![],
            temp_coefficient: 0.02,
            reference_temp_c: 25.0,
        };
        // 10 degrees above reference: reading shrinks by the 2%/degree drift.
        let compensated = s.apply(1.2, Some(35.0));
        assert!((compensated - 1.2 / 1.2_f64).abs() < 1e-9);
        assert_eq!(s.output_unit(), Some("mS_cm"));
    }

    #[test]
    fn resolve_output_unit_falls_back_to_native() {
        assert_eq!(CalibrationStrategy::Raw.resolve_output_unit("mm"), "mm");
        let s = CalibrationStrategy::LinearLookup {
            points: vec![],
            output_unit: "l".into(),
        };
        assert_eq!(s.resolve_output_unit("mm"), "l");
    }
}
