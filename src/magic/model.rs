//! Declarative modification model and its JSON document form.
//!
//! A [`Modification`] describes a single change to a spell's data in the
//! three-level hierarchy the engine executes (operation group, operation,
//! property). Modifications are produced by [`MagicBuilder`] mutation calls
//! or by importing a JSON document, and are read-only once queued for
//! execution.
//!
//! [`MagicBuilder`]: crate::magic::MagicBuilder

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Spell id as found in the engine's spell repository.
pub type MagicId = i32;
/// Operation group id within a spell.
pub type GroupId = i32;
/// Operation type id. Repeats of the same type within a group are told apart
/// by their occurrence index at execution time.
pub type OpTypeId = i32;
/// Property type id within an operation.
pub type PropertyId = i32;

/// Sentinel for "any" in match filters, and for "at end of group" in
/// injection triggers.
pub const ANY: i32 = -1;

/// The kind of change a [`Modification`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModKind {
    SetProperty,
    AddProperty,
    RemoveProperty,
    AddOperation,
    RemoveOperation,
    AddOperationGroup,
    RemoveOperationGroup,
}

impl ModKind {
    /// Whether this kind carries a value.
    pub fn has_value(self) -> bool {
        matches!(self, ModKind::SetProperty | ModKind::AddProperty)
    }

    /// Whether this kind targets a single property.
    pub fn is_property_level(self) -> bool {
        matches!(
            self,
            ModKind::SetProperty | ModKind::AddProperty | ModKind::RemoveProperty
        )
    }
}

/// The typed value carried by property-affecting modifications.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    Vec3([f32; 3]),
}

/// Discriminant of [`ModValue`], also used by the property type table and
/// the spell file codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Float,
    Bool,
    Byte,
    Vec3,
}

/// Widest value payload the engine passes by pointer. Three floats.
pub const VALUE_SLOT_LEN: usize = 12;

impl ModValue {
    pub fn kind(self) -> ValueKind {
        match self {
            ModValue::Int(_) => ValueKind::Int,
            ModValue::Float(_) => ValueKind::Float,
            ModValue::Bool(_) => ValueKind::Bool,
            ModValue::Vec3(_) => ValueKind::Vec3,
        }
    }

    /// Encode into a value slot as the engine lays it out. Returns the byte
    /// buffer and the number of meaningful bytes.
    pub fn to_slot(self) -> ([u8; VALUE_SLOT_LEN], usize) {
        let mut buf = [0u8; VALUE_SLOT_LEN];
        let len = match self {
            ModValue::Int(v) => {
                buf[..4].copy_from_slice(&v.to_le_bytes());
                4
            },
            ModValue::Float(v) => {
                buf[..4].copy_from_slice(&v.to_le_bytes());
                4
            },
            // The engine stores booleans as 32-bit integers.
            ModValue::Bool(v) => {
                buf[..4].copy_from_slice(&(v as i32).to_le_bytes());
                4
            },
            ModValue::Vec3(v) => {
                for (i, f) in v.iter().enumerate() {
                    buf[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
                }
                12
            },
        };
        (buf, len)
    }

    /// Reinterpret this value as `kind`, when a sensible conversion exists.
    /// Returns the value unchanged when it already has that kind, and falls
    /// back to the original value when no conversion applies.
    pub fn coerce(self, kind: ValueKind) -> ModValue {
        match (self, kind) {
            (v, k) if v.kind() == k => v,
            (ModValue::Int(v), ValueKind::Float) => ModValue::Float(v as f32),
            (ModValue::Int(v), ValueKind::Bool) => ModValue::Bool(v != 0),
            (ModValue::Int(v), ValueKind::Byte) => ModValue::Int(v & 0xff),
            (ModValue::Float(v), ValueKind::Int) => ModValue::Int(v as i32),
            (ModValue::Float(v), ValueKind::Bool) => ModValue::Bool(v != 0.0),
            (ModValue::Bool(v), ValueKind::Int) => ModValue::Int(v as i32),
            (ModValue::Bool(v), ValueKind::Float) => ModValue::Float(v as i32 as f32),
            (v, _) => v,
        }
    }

    /// JSON rendition: numbers for scalars, a bare bool, a 3-element array
    /// for vectors.
    pub fn to_json(self) -> serde_json::Value {
        match self {
            ModValue::Int(v) => serde_json::Value::from(v),
            ModValue::Float(v) => serde_json::Value::from(v),
            ModValue::Bool(v) => serde_json::Value::from(v),
            ModValue::Vec3(v) => serde_json::Value::from(v.to_vec()),
        }
    }

    /// Decode a JSON value, preferring `kind` when known. Integral numbers
    /// without a known kind decode as [`ModValue::Int`], fractional ones as
    /// [`ModValue::Float`].
    pub fn from_json(value: &serde_json::Value, kind: Option<ValueKind>) -> Option<ModValue> {
        let raw = match value {
            serde_json::Value::Bool(b) => ModValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ModValue::Int(i as i32)
                } else {
                    ModValue::Float(n.as_f64()? as f32)
                }
            },
            serde_json::Value::Array(a) if a.len() == 3 => {
                let mut v = [0f32; 3];
                for (i, e) in a.iter().enumerate() {
                    v[i] = e.as_f64()? as f32;
                }
                ModValue::Vec3(v)
            },
            _ => return None,
        };

        Some(match kind {
            Some(kind) => raw.coerce(kind),
            None => raw,
        })
    }
}

/// Statically-known property value kinds, fed by the consumer from whatever
/// game data source it has. Used to coerce values on JSON import.
#[derive(Default)]
pub struct PropertyTypeTable {
    kinds: RwLock<HashMap<PropertyId, ValueKind>>,
}

impl PropertyTypeTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, prop: PropertyId, kind: ValueKind) {
        self.kinds.write().insert(prop, kind);
    }

    pub fn kind_of(&self, prop: PropertyId) -> Option<ValueKind> {
        self.kinds.read().get(&prop).copied()
    }
}

/// A single declarative change to a spell's data.
///
/// `op_id` and `prop_id` are [`ANY`] when the kind does not reach that depth
/// of the hierarchy. `insert_after_op` only matters for injected entries:
/// the execution stream must observe the injection after the named operation
/// type, or at the end of the containing group when it is [`ANY`].
#[derive(Debug, Clone, PartialEq)]
pub struct Modification {
    pub kind: ModKind,
    pub group_id: GroupId,
    pub op_id: OpTypeId,
    pub prop_id: PropertyId,
    pub value: Option<ModValue>,
    pub insert_after_op: OpTypeId,
}

impl Modification {
    pub fn new(kind: ModKind, group_id: GroupId, op_id: OpTypeId, prop_id: PropertyId) -> Self {
        Modification { kind, group_id, op_id, prop_id, value: None, insert_after_op: ANY }
    }

    pub fn with_value(mut self, value: ModValue) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_insert_after(mut self, op: OpTypeId) -> Self {
        self.insert_after_op = op;
        self
    }

    /// Deduplication key. At most one live modification exists per key
    /// within a builder.
    pub fn key(&self) -> ModKey {
        let class = match self.kind {
            ModKind::SetProperty | ModKind::AddProperty | ModKind::RemoveProperty => {
                KeyClass::Property
            },
            ModKind::AddOperation | ModKind::RemoveOperation => KeyClass::Operation,
            ModKind::AddOperationGroup | ModKind::RemoveOperationGroup => KeyClass::Group,
        };
        ModKey { class, group_id: self.group_id, op_id: self.op_id, prop_id: self.prop_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyClass {
    Property,
    Operation,
    Group,
}

/// Composite uniqueness key for modifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModKey {
    pub class: KeyClass,
    pub group_id: GroupId,
    pub op_id: OpTypeId,
    pub prop_id: PropertyId,
}

/// Errors surfaced by JSON import.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("malformed modification document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("couldn't read modification document: {0}")]
    Io(#[from] std::io::Error),
    #[error("modification #{index} has no usable value")]
    BadValue { index: usize },
}

/// Wire shape of one modification in the public JSON document.
///
/// Optional fields are omitted when they do not apply to the kind.
/// `AddOperation` entries carry their injected properties inline as a
/// `Properties` map keyed by stringified property id.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModificationJson {
    #[serde(rename = "Type")]
    pub kind: ModKind,
    pub operation_group_id: GroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OpTypeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_id: Option<PropertyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_after_operation_type_id: Option<OpTypeId>,
}

/// The public JSON modification document.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModificationDoc {
    pub magic_id: MagicId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub modifications: Vec<ModificationJson>,
}

impl ModificationDoc {
    pub fn from_json(text: &str) -> Result<Self, ImportError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> String {
        // Serialization of this shape cannot fail.
        serde_json::to_string_pretty(self).expect("modification document serialization")
    }

    /// Check the document's spell id against the id it is being imported
    /// into. A mismatch is worth a warning but import proceeds, so shared
    /// documents can be retargeted.
    pub fn check_magic_id(&self, expected: MagicId) {
        if self.magic_id != expected {
            warn!(
                "modification document targets spell {} but is applied to spell {}",
                self.magic_id, expected
            );
        }
    }
}
