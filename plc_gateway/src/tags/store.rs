use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::drivers::traits::RawValue;
use crate::error::{GatewayError, Result};
use crate::tags::structures::{PlcName, Quality, TagRecord, Value};

/// The authoritative in-memory model of every tag.
///
/// Uses DashMap for thread-safe access: many concurrent readers and writers,
/// per-record consistency (a reader never observes a torn record). Cloning
/// the store is cheap and shares the underlying map.
#[derive(Debug, Clone)]
pub struct TagStore {
    tags: Arc<DashMap<String, TagRecord>>,
    registered_plcs: Arc<HashSet<PlcName>>,
}

impl TagStore {
    /// `plcs` is the set of controllers with a registered driver; inserts
    /// naming anything else are rejected.
    pub fn new(plcs: HashSet<PlcName>) -> Self {
        TagStore {
            tags: Arc::new(DashMap::new()),
            registered_plcs: Arc::new(plcs),
        }
    }

    /// Atomic insert. Fails with AlreadyExists if the id is taken.
    pub fn insert(&self, record: TagRecord) -> Result<TagRecord> {
        if !record.value.matches(record.datatype) {
            return Err(GatewayError::TypeMismatch(format!(
                "value {:?} does not fit datatype {:?}",
                record.value, record.datatype
            )));
        }
        if !self.registered_plcs.contains(&record.plc) {
            return Err(GatewayError::InvalidArgument(format!(
                "no registered driver for plc '{}'",
                record.plc
            )));
        }
        match self.tags.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(GatewayError::AlreadyExists(record.id)),
            Entry::Vacant(slot) => Ok(slot.insert(record).clone()),
        }
    }

    /// Snapshot of a single record.
    pub fn get(&self, id: &str) -> Result<TagRecord> {
        self.tags
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    /// Poller path: replace the value with a shape-checked one.
    pub fn update_value(&self, id: &str, value: Value, quality: Quality, ts: u64) -> Result<()> {
        let mut rec = self
            .tags
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        if !value.matches(rec.datatype) {
            return Err(GatewayError::TypeMismatch(format!(
                "value {:?} does not fit datatype {:?}",
                value, rec.datatype
            )));
        }
        rec.value = value;
        rec.quality = quality;
        rec.last_update_ns = ts;
        Ok(())
    }

    /// Poller convenience: coerce a raw driver reading to the record's
    /// datatype under the record's lock and mark it Good. Coercion failure
    /// marks the record Bad and reports TypeMismatch.
    pub fn apply_reading(&self, id: &str, raw: &RawValue, ts: u64) -> Result<()> {
        let mut rec = self
            .tags
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        match Value::coerce(raw, rec.datatype, rec.scale) {
            Ok(value) => {
                rec.value = value;
                rec.quality = Quality::Good;
                rec.last_update_ns = ts;
                Ok(())
            }
            Err(e) => {
                rec.quality = Quality::Bad;
                Err(e)
            }
        }
    }

    /// Partial update from REST or OPC UA. Only `value` and `writable` may
    /// change; `datatype` and `plc` are immutable after creation. The
    /// patch's own `writable` field applies first, so a single call may
    /// unlock a tag and write it.
    pub fn patch(&self, id: &str, value: Option<Value>, writable: Option<bool>) -> Result<TagRecord> {
        let mut rec = self
            .tags
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        let effective_writable = writable.unwrap_or(rec.writable);
        if let Some(value) = value {
            if !effective_writable {
                return Err(GatewayError::InvalidArgument(format!(
                    "tag '{id}' is not writable"
                )));
            }
            if !value.matches(rec.datatype) {
                return Err(GatewayError::TypeMismatch(format!(
                    "value {:?} does not fit datatype {:?}",
                    value, rec.datatype
                )));
            }
            rec.value = value;
        }
        rec.writable = effective_writable;
        Ok(rec.clone())
    }

    /// Per-address read failures mark the tag Bad without touching the value.
    pub fn set_quality(&self, id: &str, quality: Quality) -> Result<()> {
        let mut rec = self
            .tags
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        rec.quality = quality;
        Ok(())
    }

    /// Connection-fault path: every Good tag of the controller degrades to
    /// Stale. Bad and Uninitialized tags are left as they are.
    pub fn mark_plc_stale(&self, plc: PlcName) {
        for mut rec in self.tags.iter_mut() {
            if rec.plc == plc && rec.quality == Quality::Good {
                rec.quality = Quality::Stale;
            }
        }
    }

    pub fn delete(&self, id: &str) -> Result<String> {
        self.tags
            .remove(id)
            .map(|(id, _)| id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    /// Consistent view of all records, ordered by id. Each record is
    /// observed in a single committed state; cross-record atomicity is not
    /// guaranteed and not required.
    pub fn snapshot(&self) -> Vec<TagRecord> {
        let mut all: Vec<TagRecord> = self.tags.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn snapshot_by_plc(&self, plc: PlcName) -> Vec<TagRecord> {
        let mut all: Vec<TagRecord> = self
            .tags
            .iter()
            .filter(|r| r.plc == plc)
            .map(|r| r.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// The (id, address) pairs a poll cycle should read for one controller.
    pub fn subscriptions(&self, plc: PlcName) -> Vec<(String, String)> {
        self.tags
            .iter()
            .filter(|r| r.plc == plc)
            .map(|r| (r.id.clone(), r.address.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
