//! Reading validation
//!
//! Turns the raw text of a frame into an accepted [`Reading`] or a typed
//! [`Rejection`]. Pure: the same spec and text always give the same result.
//!
//! Rounding is half away from zero on the decimal-scaled value
//! (`(v * 10^p).round() / 10^p`), then clamped back into the accepted range
//! so rounding never yields a value the `SensorSpec` refuses.

use std::fmt;

use ms_error::MedisenseError;

use crate::sensor::{Acceptance, Reading, SensorKind, SensorSpec};

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Not parseable as the number type the sensor expects
    Malformed { raw: String },
    OutOfRange { value: f64, min: f64, max: f64 },
    CodeMismatch { got: i64, expected: i64 },
}

impl Rejection {
    pub fn into_error(self, kind: SensorKind) -> MedisenseError {
        MedisenseError::ValidationRejection {
            kind: kind.to_string(),
            reason: self.to_string(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Malformed { raw } => write!(f, "malformed value {:?}", raw),
            Rejection::OutOfRange { value, min, max } => {
                write!(f, "{} outside [{}, {}]", value, min, max)
            }
            Rejection::CodeMismatch { got, expected } => {
                write!(f, "code {} does not match expected {}", got, expected)
            }
        }
    }
}

/// Validate `raw` against `spec`
pub fn validate(spec: &SensorSpec, raw: &str) -> Result<Reading, Rejection> {
    let text = raw.trim();
    match spec.acceptance {
        Acceptance::Range { min, max } => {
            let value: f64 = text
                .parse()
                .ok()
                .filter(|v: &f64| v.is_finite())
                .ok_or_else(|| Rejection::Malformed { raw: text.to_string() })?;
            if value < min || value > max {
                return Err(Rejection::OutOfRange { value, min, max });
            }
            let rounded = round_to_precision(value, spec.precision).clamp(min, max);
            Ok(Reading::Decimal(rounded))
        }
        Acceptance::Exact { expected } => {
            let got: i64 = text
                .parse()
                .map_err(|_| Rejection::Malformed { raw: text.to_string() })?;
            if got != expected {
                return Err(Rejection::CodeMismatch { got, expected });
            }
            Ok(Reading::Code(got))
        }
    }
}

/// Round half away from zero to `precision` decimal places
pub fn round_to_precision(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    let rounded = (value * factor).round() / factor;
    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}
