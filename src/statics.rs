//! Per-machine static-field storage and the initialized-type set.
//!
//! During interpretation this manager is the single source of truth for
//! static fields: every read and write performed by interpreted code
//! goes through it, never through the real backing storage. The backing
//! store is reconciled once, at resume, via [`StaticBacking`], so that
//! natively executed code observes the values the interpreter believes
//! are current.
use std::collections::HashSet;

use crate::types::{ClassId, FieldRef};
use crate::value::Value;

/// Static state scoped to one machine instance. Two machines never
/// share this, which is what lets independent runs execute in parallel
/// without observing each other's statics.
#[derive(Debug, Clone, Default)]
pub struct StaticState {
    // Insertion-ordered; an overwrite removes the old entry and appends,
    // keeping serialization order stable.
    values: Vec<(FieldRef, Value)>,
    clinited: HashSet<ClassId>,
}

impl StaticState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &FieldRef) -> Option<&Value> {
        self.values
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v)
    }

    pub fn set(&mut self, field: FieldRef, value: Value) {
        self.values.retain(|(f, _)| *f != field);
        self.values.push((field, value));
    }

    pub fn values(&self) -> &[(FieldRef, Value)] {
        &self.values
    }

    pub fn is_clinited(&self, class: &ClassId) -> bool {
        self.clinited.contains(class)
    }

    pub fn mark_clinited(&mut self, class: ClassId) {
        self.clinited.insert(class);
    }

    pub fn clinited(&self) -> impl Iterator<Item = &ClassId> {
        self.clinited.iter()
    }

    pub(crate) fn from_parts(
        values: Vec<(FieldRef, Value)>,
        clinited: HashSet<ClassId>,
    ) -> Self {
        Self { values, clinited }
    }
}

/// The embedder's real static storage, written back to at resume. The
/// implementation is expected to bypass normal write protections (the
/// original runtime strips `final` before the write); a refused write
/// surfaces as a fatal static-restore failure.
pub trait StaticBacking {
    fn restore(
        &mut self,
        field: &FieldRef,
        value: &Value,
    ) -> std::result::Result<(), String>;
}

/// Backing for embedders whose native code never reads statics.
pub struct DiscardBacking;

impl StaticBacking for DiscardBacking {
    fn restore(
        &mut self,
        _field: &FieldRef,
        _value: &Value,
    ) -> std::result::Result<(), String> {
        Ok(())
    }
}
