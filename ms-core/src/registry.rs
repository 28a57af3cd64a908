//! Sensor Registry
//!
//! The single shared store of latest readings, one slot per canonical
//! [`SensorKind`]. Every operation runs under one `parking_lot::Mutex` and
//! does no I/O while holding it, so operations never interleave and a reader
//! sees either the whole old slot or the whole new one.
//!
//! There is no expiry: a value stays until it is overwritten or cleared.

use std::sync::Arc;
use std::time::Instant;

use ms_protocol::MeasureSnapshot;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::sensor::{Acceptance, Reading, SensorCatalog, SensorKind};
use crate::validation::{validate, Rejection};

/// Runtime state of one sensor kind
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorSlot {
    pub value: Option<Reading>,
    pub last_updated_at: Option<Instant>,
}

impl SensorSlot {
    fn set(&mut self, value: Reading, at: Instant) {
        self.value = Some(value);
        self.last_updated_at = Some(at);
    }

    fn clear(&mut self) -> Option<Reading> {
        self.last_updated_at = None;
        self.value.take()
    }
}

pub struct SensorRegistry {
    catalog: Arc<SensorCatalog>,
    slots: Mutex<[SensorSlot; SensorKind::COUNT]>,
}

impl SensorRegistry {
    /// Create a registry with every slot empty
    pub fn new(catalog: Arc<SensorCatalog>) -> Self {
        Self {
            catalog,
            slots: Mutex::new([SensorSlot::default(); SensorKind::COUNT]),
        }
    }

    pub fn catalog(&self) -> &SensorCatalog {
        &self.catalog
    }

    /// Canonical kind behind an alias
    pub fn resolve(&self, alias: &str) -> Option<SensorKind> {
        self.catalog.resolve(alias)
    }

    /// Store `value` for `kind`, replacing whatever was there (last write wins).
    /// Values the kind's `SensorSpec` does not admit are refused and never stored.
    pub fn write(&self, kind: SensorKind, value: Reading, at: Instant) -> Result<(), Rejection> {
        self.admit(kind, value)?;
        self.slots.lock()[kind.index()].set(value, at);
        trace!("REGISTRY: {} <- {}", kind, value);
        Ok(())
    }

    /// Write through an alias. Returns `None` when the alias is unknown.
    pub fn write_alias(
        &self,
        alias: &str,
        value: Reading,
        at: Instant,
    ) -> Option<Result<(), Rejection>> {
        let kind = self.resolve(alias)?;
        Some(self.write(kind, value, at))
    }

    /// Store `value` only when the slot is empty. Returns true when written.
    pub fn write_if_absent(
        &self,
        kind: SensorKind,
        value: Reading,
        at: Instant,
    ) -> Result<bool, Rejection> {
        self.admit(kind, value)?;
        let mut slots = self.slots.lock();
        let slot = &mut slots[kind.index()];
        if slot.value.is_some() {
            return Ok(false);
        }
        slot.set(value, at);
        Ok(true)
    }

    /// Validate raw frame text for `kind` and store it when accepted
    pub fn accept(&self, kind: SensorKind, raw: &str, at: Instant) -> Result<Reading, Rejection> {
        let reading = validate(self.catalog.spec(kind), raw)?;
        self.write(kind, reading, at)?;
        Ok(reading)
    }

    /// Non-destructive peek
    pub fn read(&self, kind: SensorKind) -> Option<Reading> {
        self.slots.lock()[kind.index()].value
    }

    /// Read then empty the slot in one critical section
    pub fn read_and_clear(&self, kind: SensorKind) -> Option<Reading> {
        self.slots.lock()[kind.index()].clear()
    }

    pub fn slot(&self, kind: SensorKind) -> SensorSlot {
        self.slots.lock()[kind.index()]
    }

    /// Empty every slot
    pub fn reset_all(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            slot.clear();
        }
        debug!("REGISTRY: all slots reset");
    }

    /// Value as reported to clients: zero-sentinel for range kinds, expected
    /// code only for exact kinds. Never clears.
    pub fn reported(&self, kind: SensorKind) -> Option<Reading> {
        let spec = self.catalog.spec(kind);
        self.read(kind).filter(|v| spec.is_reportable(*v))
    }

    /// Like [`reported`](Self::reported) but clears the slot when the value is
    /// reported, in the same critical section.
    pub fn take_reported(&self, kind: SensorKind) -> Option<Reading> {
        let spec = self.catalog.spec(kind);
        let mut slots = self.slots.lock();
        let slot = &mut slots[kind.index()];
        match slot.value {
            Some(v) if spec.is_reportable(v) => slot.clear(),
            _ => None,
        }
    }

    /// Report every kind at once, consuming consume-on-read kinds, under a
    /// single lock acquisition.
    pub fn measure_all(&self) -> MeasureSnapshot {
        let mut slots = self.slots.lock();
        let mut reported = [None; SensorKind::COUNT];
        for kind in SensorKind::ALL {
            let spec = self.catalog.spec(kind);
            let slot = &mut slots[kind.index()];
            if let Some(v) = slot.value.filter(|v| spec.is_reportable(*v)) {
                if spec.consumes_on_read() {
                    slot.clear();
                }
                reported[kind.index()] = Some(v);
            }
        }
        drop(slots);
        to_measure_snapshot(&reported)
    }

    /// Every slot with its last update time, in [`SensorKind::ALL`] order
    pub fn snapshot(&self) -> Vec<(SensorKind, Option<Reading>, Option<Instant>)> {
        let slots = *self.slots.lock();
        SensorKind::ALL
            .iter()
            .map(|&kind| {
                let slot = slots[kind.index()];
                (kind, slot.value, slot.last_updated_at)
            })
            .collect()
    }

    /// Raw slot values without presence rules, for diagnostics
    pub fn raw_snapshot(&self) -> MeasureSnapshot {
        let slots = self.slots.lock();
        let values: Vec<Option<Reading>> = slots.iter().map(|s| s.value).collect();
        drop(slots);
        to_measure_snapshot(&values)
    }

    fn admit(&self, kind: SensorKind, value: Reading) -> Result<(), Rejection> {
        let spec = self.catalog.spec(kind);
        if spec.admits(value) {
            return Ok(());
        }
        Err(match (spec.acceptance, value) {
            (Acceptance::Range { min, max }, Reading::Decimal(v)) => {
                Rejection::OutOfRange { value: v, min, max }
            }
            (Acceptance::Exact { expected }, Reading::Code(c)) => {
                Rejection::CodeMismatch { got: c, expected }
            }
            _ => Rejection::Malformed { raw: value.to_string() },
        })
    }
}

fn to_measure_snapshot(values: &[Option<Reading>]) -> MeasureSnapshot {
    let get = |kind: SensorKind| values.get(kind.index()).copied().flatten();
    MeasureSnapshot {
        weight: get(SensorKind::Weight).and_then(Reading::as_decimal),
        temperature: get(SensorKind::Temperature).and_then(Reading::as_decimal),
        height: get(SensorKind::Height).and_then(Reading::as_decimal),
        validation: get(SensorKind::ValidationCode).and_then(Reading::as_code),
    }
}
