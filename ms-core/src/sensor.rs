//! Sensor kinds, per-kind specifications and the validated catalog
//!
//! The set of kinds is closed. Aliases are alternative names for a kind and
//! never get storage of their own: the catalog maps every alias to its
//! canonical kind, and the registry keeps one slot per canonical kind.

use std::collections::HashMap;
use std::fmt;

use ms_error::{MedisenseError, Result};
use ms_protocol::format_decimal;
use serde::{Deserialize, Serialize};

use crate::constants::sensors;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Weight,
    Temperature,
    Height,
    ValidationCode,
}

impl SensorKind {
    pub const COUNT: usize = 4;

    pub const ALL: [SensorKind; Self::COUNT] = [
        SensorKind::Weight,
        SensorKind::Temperature,
        SensorKind::Height,
        SensorKind::ValidationCode,
    ];

    /// Slot index in the registry
    pub fn index(self) -> usize {
        match self {
            SensorKind::Weight => 0,
            SensorKind::Temperature => 1,
            SensorKind::Height => 2,
            SensorKind::ValidationCode => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorKind::Weight => "weight",
            SensorKind::Temperature => "temperature",
            SensorKind::Height => "height",
            SensorKind::ValidationCode => "validation_code",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Plausibility rule applied before a reading is stored
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Acceptance {
    /// Floating-point reading within `[min, max]`
    Range { min: f64, max: f64 },
    /// Integer reading equal to `expected`
    Exact { expected: i64 },
}

/// An accepted reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Decimal(f64),
    Code(i64),
}

impl Reading {
    pub fn as_decimal(self) -> Option<f64> {
        match self {
            Reading::Decimal(v) => Some(v),
            Reading::Code(_) => None,
        }
    }

    pub fn as_code(self) -> Option<i64> {
        match self {
            Reading::Code(c) => Some(c),
            Reading::Decimal(_) => None,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Decimal(v) => f.write_str(&format_decimal(*v)),
            Reading::Code(c) => write!(f, "{}", c),
        }
    }
}

/// Static configuration of one sensor kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub kind: SensorKind,

    /// Alternative names; the canonical kind name is always an alias too
    #[serde(default)]
    pub aliases: Vec<String>,

    pub acceptance: Acceptance,

    /// Decimal places kept for range readings; must be 0 for exact kinds
    #[serde(default)]
    pub precision: u32,

    #[serde(default)]
    pub unit: String,
}

impl SensorSpec {
    /// True when a stored value satisfies this spec
    pub fn admits(&self, value: Reading) -> bool {
        match (self.acceptance, value) {
            (Acceptance::Range { min, max }, Reading::Decimal(v)) => v >= min && v <= max,
            (Acceptance::Exact { expected }, Reading::Code(c)) => c == expected,
            _ => false,
        }
    }

    /// Serving-layer presence rule.
    ///
    /// Range kinds treat a stored zero as "no reading yet" (zero-sentinel), so
    /// a genuine zero is indistinguishable from an empty slot. Exact kinds are
    /// present only when they hold the expected code.
    pub fn is_reportable(&self, value: Reading) -> bool {
        match (self.acceptance, value) {
            (Acceptance::Range { .. }, Reading::Decimal(v)) => v > 0.0,
            (Acceptance::Exact { expected }, Reading::Code(c)) => c == expected,
            _ => false,
        }
    }

    /// Exact-match kinds are cleared by the read that reports them
    pub fn consumes_on_read(&self) -> bool {
        matches!(self.acceptance, Acceptance::Exact { .. })
    }

    fn check(&self) -> Result<()> {
        let field = format!("sensors.{}", self.kind);
        match self.acceptance {
            Acceptance::Range { min, max } => {
                if !min.is_finite() || !max.is_finite() {
                    return Err(MedisenseError::invalid_config(field, "range bounds must be finite"));
                }
                if min > max {
                    return Err(MedisenseError::invalid_config(
                        field,
                        format!("range min {} exceeds max {}", min, max),
                    ));
                }
                if self.precision > sensors::MAX_PRECISION {
                    return Err(MedisenseError::invalid_config(
                        field,
                        format!("precision {} exceeds {}", self.precision, sensors::MAX_PRECISION),
                    ));
                }
            }
            Acceptance::Exact { .. } => {
                if self.precision != 0 {
                    return Err(MedisenseError::invalid_config(
                        field,
                        "exact-match sensors must have precision 0",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Default specs of the kiosk deployment
pub fn default_sensor_specs() -> Vec<SensorSpec> {
    let aliases = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
    vec![
        SensorSpec {
            kind: SensorKind::Weight,
            aliases: aliases(&["poids", "poid", "weight"]),
            acceptance: Acceptance::Range {
                min: sensors::WEIGHT_MIN_KG,
                max: sensors::WEIGHT_MAX_KG,
            },
            precision: sensors::WEIGHT_PRECISION,
            unit: "kg".into(),
        },
        SensorSpec {
            kind: SensorKind::Temperature,
            aliases: aliases(&["temp", "temperature", "température"]),
            acceptance: Acceptance::Range {
                min: sensors::TEMPERATURE_MIN_C,
                max: sensors::TEMPERATURE_MAX_C,
            },
            precision: sensors::TEMPERATURE_PRECISION,
            unit: "°C".into(),
        },
        SensorSpec {
            kind: SensorKind::Height,
            aliases: aliases(&["taille", "height"]),
            acceptance: Acceptance::Range {
                min: sensors::HEIGHT_MIN_M,
                max: sensors::HEIGHT_MAX_M,
            },
            precision: sensors::HEIGHT_PRECISION,
            unit: "m".into(),
        },
        SensorSpec {
            kind: SensorKind::ValidationCode,
            aliases: aliases(&["validation", "code", "card"]),
            acceptance: Acceptance::Exact {
                expected: sensors::VALIDATION_CODE,
            },
            precision: 0,
            unit: String::new(),
        },
    ]
}

/// Validated specs for every kind plus the alias table
#[derive(Debug, Clone)]
pub struct SensorCatalog {
    specs: Vec<SensorSpec>,
    aliases: HashMap<String, SensorKind>,
}

impl SensorCatalog {
    /// Build the catalog, failing on a missing or duplicated kind, an invalid
    /// acceptance rule, an empty alias, or an alias claimed by two kinds.
    pub fn new(specs: Vec<SensorSpec>) -> Result<Self> {
        let mut ordered: Vec<Option<SensorSpec>> = vec![None; SensorKind::COUNT];
        for spec in specs {
            spec.check()?;
            let idx = spec.kind.index();
            if ordered[idx].is_some() {
                return Err(MedisenseError::invalid_config(
                    format!("sensors.{}", spec.kind),
                    "sensor declared more than once",
                ));
            }
            ordered[idx] = Some(spec);
        }

        let mut resolved = Vec::with_capacity(SensorKind::COUNT);
        for (kind, spec) in SensorKind::ALL.iter().zip(ordered) {
            resolved.push(spec.ok_or_else(|| MedisenseError::MissingSensorSpec(kind.to_string()))?);
        }

        let mut aliases: HashMap<String, SensorKind> = HashMap::new();
        for spec in &resolved {
            let names = std::iter::once(spec.kind.name().to_string()).chain(spec.aliases.iter().cloned());
            for name in names {
                let key = normalize_alias(&name);
                if key.is_empty() {
                    return Err(MedisenseError::invalid_config(
                        format!("sensors.{}.aliases", spec.kind),
                        "alias cannot be empty",
                    ));
                }
                match aliases.get(&key) {
                    Some(existing) if *existing != spec.kind => {
                        return Err(MedisenseError::AliasConflict {
                            alias: key,
                            first: existing.to_string(),
                            second: spec.kind.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        aliases.insert(key, spec.kind);
                    }
                }
            }
        }

        Ok(Self { specs: resolved, aliases })
    }

    /// Catalog of the built-in sensor specs
    pub fn builtin() -> Result<Self> {
        Self::new(default_sensor_specs())
    }

    pub fn spec(&self, kind: SensorKind) -> &SensorSpec {
        &self.specs[kind.index()]
    }

    /// Canonical kind for an alias (case-insensitive)
    pub fn resolve(&self, alias: &str) -> Option<SensorKind> {
        self.aliases.get(&normalize_alias(alias)).copied()
    }
}

fn normalize_alias(alias: &str) -> String {
    alias.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_resolves_aliases() {
        let catalog = SensorCatalog::builtin().unwrap();
        assert_eq!(catalog.resolve("poids"), Some(SensorKind::Weight));
        assert_eq!(catalog.resolve("TEMP"), Some(SensorKind::Temperature));
        assert_eq!(catalog.resolve("temperature"), Some(SensorKind::Temperature));
        assert_eq!(catalog.resolve(" taille "), Some(SensorKind::Height));
        assert_eq!(catalog.resolve("validation_code"), Some(SensorKind::ValidationCode));
        assert_eq!(catalog.resolve("pressure"), None);
    }

    #[test]
    fn test_alias_conflict_fails_fast() {
        let mut specs = default_sensor_specs();
        specs[2].aliases.push("temp".into());
        match SensorCatalog::new(specs) {
            Err(MedisenseError::AliasConflict { alias, .. }) => assert_eq!(alias, "temp"),
            other => panic!("expected alias conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_and_duplicate_kinds() {
        let mut specs = default_sensor_specs();
        specs.pop();
        assert!(matches!(
            SensorCatalog::new(specs),
            Err(MedisenseError::MissingSensorSpec(_))
        ));

        let mut specs = default_sensor_specs();
        specs.push(specs[0].clone());
        assert!(SensorCatalog::new(specs).is_err());
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let mut specs = default_sensor_specs();
        specs[0].acceptance = Acceptance::Range { min: 10.0, max: 1.0 };
        assert!(SensorCatalog::new(specs).is_err());

        let mut specs = default_sensor_specs();
        specs[3].precision = 2;
        assert!(SensorCatalog::new(specs).is_err());

        let mut specs = default_sensor_specs();
        specs[1].aliases.push("   ".into());
        assert!(SensorCatalog::new(specs).is_err());
    }

    #[test]
    fn test_reportable_rules() {
        let catalog = SensorCatalog::builtin().unwrap();
        let weight = catalog.spec(SensorKind::Weight);
        assert!(weight.is_reportable(Reading::Decimal(70.4)));
        assert!(!weight.is_reportable(Reading::Decimal(0.0)));

        let code = catalog.spec(SensorKind::ValidationCode);
        assert!(code.is_reportable(Reading::Code(310502)));
        assert!(!code.is_reportable(Reading::Code(42)));
        assert!(code.consumes_on_read());
        assert!(!weight.consumes_on_read());
    }

    #[test]
    fn test_spec_serde_shape() {
        let json = r#"{"kind":"weight","aliases":["poids"],"acceptance":{"rule":"range","min":0.0,"max":500.0},"precision":1,"unit":"kg"}"#;
        let spec: SensorSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.kind, SensorKind::Weight);
        assert_eq!(spec.acceptance, Acceptance::Range { min: 0.0, max: 500.0 });

        let json = r#"{"kind":"validation_code","acceptance":{"rule":"exact","expected":310502}}"#;
        let spec: SensorSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.acceptance, Acceptance::Exact { expected: 310502 });
        assert_eq!(spec.precision, 0);
    }
}
