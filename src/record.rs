//! Shared record handles and their relation slots.
//!
//! A [`Record`] is a reference-counted, cell-guarded map of column values
//! plus persistence state. All holders of a handle observe the same data;
//! the identity cache guarantees one handle per `(type, primary key)` within
//! an entity manager.

use crate::value::Value;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

#[derive(Debug)]
pub struct RecordData {
    pub(crate) type_id: String,
    pub(crate) fields: HashMap<String, Value>,
    pub(crate) relations: HashMap<String, Relation>,
    pub(crate) persisted: bool,
    /// Last-known-committed column extract; `None` until persisted.
    pub(crate) snapshot: Option<IndexMap<String, Value>>,
}

/// State of one relation field.
#[derive(Debug, Clone)]
pub enum Relation {
    /// Never populated (fresh record, field untouched).
    Unset,
    /// Known to reference nothing.
    Null,
    /// Not yet materialised; the loader can re-issue the query.
    Unloaded(Loader),
    /// Loaded single target.
    One(Record),
    /// Loaded collection of targets.
    Many(Vec<Record>),
}

impl Relation {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Relation::One(_) | Relation::Many(_) | Relation::Null)
    }
}

/// Everything a lazy relation needs to run its query on first access.
#[derive(Debug, Clone)]
pub struct Loader {
    pub target_type: String,
    pub key: LoaderKey,
}

#[derive(Debug, Clone)]
pub enum LoaderKey {
    /// Owning side: the foreign-key value is the target's primary key.
    Pk(Value),
    /// Inverse side: match `column` on the target against our primary key.
    Field { column: String, value: Value },
    /// Many-to-many: resolve through the link table.
    JoinTable {
        table: String,
        owner_fk: String,
        inverse_fk: String,
        owner_pk: Value,
    },
}

pub struct Record(Rc<RefCell<RecordData>>);

impl Clone for Record {
    fn clone(&self) -> Self {
        Record(Rc::clone(&self.0))
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.borrow();
        f.debug_struct("Record")
            .field("type_id", &data.type_id)
            .field("persisted", &data.persisted)
            .field("fields", &data.fields)
            .finish()
    }
}

impl Record {
    pub fn new(type_id: impl Into<String>) -> Self {
        Record(Rc::new(RefCell::new(RecordData {
            type_id: type_id.into(),
            fields: HashMap::new(),
            relations: HashMap::new(),
            persisted: false,
            snapshot: None,
        })))
    }

    pub(crate) fn from_rc(rc: Rc<RefCell<RecordData>>) -> Self {
        Record(rc)
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<RecordData>> {
        Rc::downgrade(&self.0)
    }

    pub fn type_id(&self) -> String {
        self.0.borrow().type_id.clone()
    }

    /// Two handles to the same underlying record.
    pub fn same_as(&self, other: &Record) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn get(&self, field: &str) -> Value {
        self.0
            .borrow()
            .fields
            .get(field)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.0.borrow().fields.contains_key(field)
    }

    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) -> &Self {
        self.0.borrow_mut().fields.insert(field.into(), value.into());
        self
    }

    pub fn get_int(&self, field: &str) -> Option<i64> {
        self.get(field).as_int()
    }

    pub fn get_str(&self, field: &str) -> Option<String> {
        match self.get(field) {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn relation(&self, field: &str) -> Relation {
        self.0
            .borrow()
            .relations
            .get(field)
            .cloned()
            .unwrap_or(Relation::Unset)
    }

    pub(crate) fn set_relation(&self, field: impl Into<String>, relation: Relation) {
        self.0.borrow_mut().relations.insert(field.into(), relation);
    }

    /// Attaches a single related record (or clears the slot with `None`).
    pub fn set_related(&self, field: impl Into<String>, target: Option<Record>) -> &Self {
        let relation = match target {
            Some(r) => Relation::One(r),
            None => Relation::Null,
        };
        self.set_relation(field, relation);
        self
    }

    /// Attaches a collection of related records.
    pub fn set_related_many(&self, field: impl Into<String>, targets: Vec<Record>) -> &Self {
        self.set_relation(field, Relation::Many(targets));
        self
    }

    /// The loaded single target of a relation, if materialised.
    pub fn related(&self, field: &str) -> Option<Record> {
        match self.relation(field) {
            Relation::One(r) => Some(r),
            _ => None,
        }
    }

    /// The loaded targets of a to-many relation; empty when unloaded.
    pub fn related_many(&self, field: &str) -> Vec<Record> {
        match self.relation(field) {
            Relation::Many(rs) => rs,
            _ => vec![],
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.0.borrow().persisted
    }

    pub fn snapshot(&self) -> Option<IndexMap<String, Value>> {
        self.0.borrow().snapshot.clone()
    }

    /// Flags the record as stored and remembers `extract` as its snapshot.
    pub fn mark_persisted(&self, extract: IndexMap<String, Value>) {
        let mut data = self.0.borrow_mut();
        data.persisted = true;
        data.snapshot = Some(extract);
    }

    pub(crate) fn mark_removed(&self) {
        let mut data = self.0.borrow_mut();
        data.persisted = false;
        data.snapshot = None;
    }
}
