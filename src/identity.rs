//! Per-manager identity map: one canonical record handle per
//! `(type, primary key)`. Entries are weak; the cache never keeps a record
//! alive on its own.

use crate::record::{Record, RecordData};
use crate::value::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Weak;

/// Canonical form of a primary key for map keying. Floating point and other
/// exotic key values are keyed by their display form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdKey {
    Int(i64),
    Str(String),
}

impl IdKey {
    /// `None` for null keys; null-keyed records are never cached.
    pub fn from_value(value: &Value) -> Option<IdKey> {
        match value {
            Value::Null => None,
            Value::Int(v) => Some(IdKey::Int(*v)),
            Value::String(v) => Some(IdKey::Str(v.clone())),
            Value::Bool(v) => Some(IdKey::Int(*v as i64)),
            Value::Float(v) => Some(IdKey::Str(v.to_string())),
            Value::DateTime(v) => Some(IdKey::Str(v.to_rfc3339())),
            Value::Json(v) => Some(IdKey::Str(v.to_string())),
        }
    }
}

#[derive(Default)]
pub struct IdentityCache {
    entries: RefCell<HashMap<(String, IdKey), Weak<RefCell<RecordData>>>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, type_id: &str, pk: &Value) -> Option<Record> {
        let key = (type_id.to_owned(), IdKey::from_value(pk)?);
        let mut entries = self.entries.borrow_mut();
        match entries.get(&key) {
            Some(weak) => match weak.upgrade() {
                Some(rc) => Some(Record::from_rc(rc)),
                None => {
                    entries.remove(&key);
                    None
                }
            },
            None => None,
        }
    }

    /// Stores a record under its key; overwrites any previous entry. Records
    /// with a null primary key are not stored.
    pub fn set(&self, type_id: &str, pk: &Value, record: &Record) {
        if let Some(id) = IdKey::from_value(pk) {
            self.entries
                .borrow_mut()
                .insert((type_id.to_owned(), id), record.downgrade());
        }
    }

    pub fn has(&self, type_id: &str, pk: &Value) -> bool {
        self.get(type_id, pk).is_some()
    }

    pub fn clear(&self, type_id: &str, pk: &Value) {
        if let Some(id) = IdKey::from_value(pk) {
            self.entries
                .borrow_mut()
                .remove(&(type_id.to_owned(), id));
        }
    }

    pub fn clear_all(&self) {
        self.entries.borrow_mut().clear();
    }
}
