//! Measurements and per-signal ancillary metadata.

use std::collections::HashMap;
use std::time::SystemTime;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ticks::Ticks;

/// One timestamped scalar sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Signal this sample belongs to.
    pub signal_id: Uuid,
    /// Raw sample value as received.
    pub value: f64,
    /// Sample time, leap-second bits included.
    pub timestamp: Ticks,
    /// 32-bit state flags; see [`crate::protocol::StateFlags`].
    pub flags: u32,
}

impl Measurement {
    /// Sample time as wall time (UTC).
    pub fn time(&self) -> SystemTime {
        self.timestamp.to_system_time()
    }
}

/// Ancillary data for one signal, typically populated from parsed
/// publisher metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementMetadata {
    /// Signal this metadata describes.
    pub signal_id: Uuid,
    /// Additive linear-adjustment term.
    pub adder: f64,
    /// Multiplicative linear-adjustment term.
    pub multiplier: f64,
    /// Publisher-side numeric identifier.
    pub id: u64,
    /// Publisher-side source name.
    pub source: String,
    /// Signal type acronym, e.g. `FREQ` or `VPHM`.
    pub signal_type: String,
    /// Signal reference string.
    pub signal_reference: String,
    /// Free-form description.
    pub description: String,
    /// Last metadata update time, when the publisher supplied one.
    pub updated_on: Option<SystemTime>,
    /// Point tag.
    pub tag: String,
}

impl MeasurementMetadata {
    /// Metadata with identity adjustment for the given signal.
    pub fn new(signal_id: Uuid) -> Self {
        Self {
            signal_id,
            adder: 0.0,
            multiplier: 1.0,
            id: 0,
            source: String::new(),
            signal_type: String::new(),
            signal_reference: String::new(),
            description: String::new(),
            updated_on: None,
            tag: String::new(),
        }
    }
}

/// Per-subscriber registry of measurement metadata.
///
/// Ownership is deliberately per subscriber instance; nothing here is
/// process-global.
#[derive(Debug, Default)]
pub struct MeasurementRegistry {
    entries: HashMap<Uuid, MeasurementMetadata>,
}

impl MeasurementRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the metadata for a signal.
    pub fn register(&mut self, metadata: MeasurementMetadata) {
        self.entries.insert(metadata.signal_id, metadata);
    }

    /// Look up metadata for a signal.
    pub fn lookup(&self, signal_id: Uuid) -> Option<&MeasurementMetadata> {
        self.entries.get(&signal_id)
    }

    /// Number of registered signals.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Apply the linear adjustment for a measurement's signal.
    ///
    /// Returns `value * multiplier + adder` when metadata is registered,
    /// the raw value otherwise.
    pub fn adjusted_value(&self, measurement: &Measurement) -> f64 {
        match self.entries.get(&measurement.signal_id) {
            Some(meta) => measurement.value * meta.multiplier + meta.adder,
            None => measurement.value,
        }
    }

    /// Evaluate a filter expression against a metadata row.
    ///
    /// Expression evaluation is a seam for a future engine; this
    /// implementation reports it as unsupported.
    pub fn evaluate_filter(&self, expression: &str, _signal_id: Uuid) -> Result<bool> {
        Err(Error::NotSupported(format!(
            "filter expression evaluation: {expression:?}"
        )))
    }
}
