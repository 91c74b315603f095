//! In-memory document and codec for the binary spell-definition format.
//!
//! A spell file is a three-level hierarchy: spell entries, each holding
//! operation groups, each holding typed operations with typed properties.
//! The writer parses a loaded resource buffer into this document, applies
//! modification sets to it, and serializes it back over the buffer.
//!
//! Layout (little-endian throughout):
//!
//! ```text
//! "MAGF" u16:version u16:reserved u32:entry_count
//!   entry:      i32:magic_id  u32:group_count
//!   group:      i32:group_id  u32:op_count
//!   operation:  i32:op_type   u32:prop_count
//!   property:   i32:prop_id   u8:kind  payload
//! ```
//!
//! Property payloads are 4 bytes for int/float/bool, 1 for byte, 12 for a
//! 3-float vector.

use thiserror::Error;
use tracing::{debug, warn};

use crate::magic::model::{
    GroupId, MagicId, ModKind, ModValue, Modification, OpTypeId, PropertyId, ANY,
};

const FILE_TAG: [u8; 4] = *b"MAGF";
const FILE_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum MagicFileError {
    #[error("not a spell definition file")]
    BadTag,
    #[error("unsupported spell file version {0}")]
    BadVersion(u16),
    #[error("spell file truncated at offset {0}")]
    Truncated(usize),
    #[error("unknown property value kind {kind} at offset {offset}")]
    UnknownKind { kind: u8, offset: usize },
}

/// Typed value of a property as stored in the file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    Byte(u8),
    Vec3([f32; 3]),
}

impl PropertyValue {
    /// Convert a modification value, keeping the narrow kinds the file has
    /// and the model does not.
    fn from_mod(value: ModValue, like: Option<PropertyValue>) -> PropertyValue {
        match (value, like) {
            (ModValue::Int(v), Some(PropertyValue::Byte(_))) => PropertyValue::Byte(v as u8),
            (ModValue::Int(v), Some(PropertyValue::Bool(_))) => PropertyValue::Bool(v != 0),
            (ModValue::Int(v), Some(PropertyValue::Float(_))) => PropertyValue::Float(v as f32),
            (ModValue::Int(v), _) => PropertyValue::Int(v),
            (ModValue::Float(v), Some(PropertyValue::Int(_))) => PropertyValue::Int(v as i32),
            (ModValue::Float(v), _) => PropertyValue::Float(v),
            (ModValue::Bool(v), _) => PropertyValue::Bool(v),
            (ModValue::Vec3(v), _) => PropertyValue::Vec3(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub prop_id: PropertyId,
    pub value: PropertyValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub op_type: OpTypeId,
    pub properties: Vec<Property>,
}

impl Operation {
    pub fn new(op_type: OpTypeId) -> Self {
        Operation { op_type, properties: Vec::new() }
    }

    fn property_mut(&mut self, prop_id: PropertyId) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.prop_id == prop_id)
    }

    fn set_property(&mut self, prop_id: PropertyId, value: ModValue) {
        match self.property_mut(prop_id) {
            Some(p) => p.value = PropertyValue::from_mod(value, Some(p.value)),
            None => self
                .properties
                .push(Property { prop_id, value: PropertyValue::from_mod(value, None) }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationGroup {
    pub group_id: GroupId,
    pub operations: Vec<Operation>,
}

impl OperationGroup {
    pub fn new(group_id: GroupId) -> Self {
        OperationGroup { group_id, operations: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MagicEntry {
    pub magic_id: MagicId,
    pub groups: Vec<OperationGroup>,
}

impl MagicEntry {
    pub fn group_mut(&mut self, group_id: GroupId) -> Option<&mut OperationGroup> {
        self.groups.iter_mut().find(|g| g.group_id == group_id)
    }
}

/// A parsed spell definition file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MagicFile {
    pub entries: Vec<MagicEntry>,
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MagicFileError> {
        let end = self.offset.checked_add(n).filter(|&e| e <= self.data.len());
        let end = end.ok_or(MagicFileError::Truncated(self.offset))?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MagicFileError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MagicFileError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, MagicFileError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, MagicFileError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32, MagicFileError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
}

impl MagicFile {
    pub fn parse(data: &[u8]) -> Result<Self, MagicFileError> {
        let mut r = Reader { data, offset: 0 };

        if r.take(4)? != &FILE_TAG[..] {
            return Err(MagicFileError::BadTag);
        }
        let version = r.u16()?;
        if version != FILE_VERSION {
            return Err(MagicFileError::BadVersion(version));
        }
        r.u16()?;

        let entry_count = r.u32()? as usize;
        let mut entries = Vec::with_capacity(entry_count.min(256));
        for _ in 0..entry_count {
            let magic_id = r.i32()?;
            let group_count = r.u32()? as usize;

            let mut groups = Vec::with_capacity(group_count.min(256));
            for _ in 0..group_count {
                let group_id = r.i32()?;
                let op_count = r.u32()? as usize;

                let mut operations = Vec::with_capacity(op_count.min(256));
                for _ in 0..op_count {
                    let op_type = r.i32()?;
                    let prop_count = r.u32()? as usize;

                    let mut properties = Vec::with_capacity(prop_count.min(256));
                    for _ in 0..prop_count {
                        let prop_id = r.i32()?;
                        let kind = r.u8()?;
                        let value = match kind {
                            0 => PropertyValue::Int(r.i32()?),
                            1 => PropertyValue::Float(r.f32()?),
                            2 => PropertyValue::Bool(r.i32()? != 0),
                            3 => PropertyValue::Byte(r.u8()?),
                            4 => PropertyValue::Vec3([r.f32()?, r.f32()?, r.f32()?]),
                            kind => {
                                return Err(MagicFileError::UnknownKind {
                                    kind,
                                    offset: r.offset - 1,
                                })
                            },
                        };
                        properties.push(Property { prop_id, value });
                    }
                    operations.push(Operation { op_type, properties });
                }
                groups.push(OperationGroup { group_id, operations });
            }
            entries.push(MagicEntry { magic_id, groups });
        }

        Ok(MagicFile { entries })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&FILE_TAG);
        out.extend_from_slice(&FILE_VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());

        for entry in &self.entries {
            out.extend_from_slice(&entry.magic_id.to_le_bytes());
            out.extend_from_slice(&(entry.groups.len() as u32).to_le_bytes());
            for group in &entry.groups {
                out.extend_from_slice(&group.group_id.to_le_bytes());
                out.extend_from_slice(&(group.operations.len() as u32).to_le_bytes());
                for op in &group.operations {
                    out.extend_from_slice(&op.op_type.to_le_bytes());
                    out.extend_from_slice(&(op.properties.len() as u32).to_le_bytes());
                    for p in &op.properties {
                        out.extend_from_slice(&p.prop_id.to_le_bytes());
                        match p.value {
                            PropertyValue::Int(v) => {
                                out.push(0);
                                out.extend_from_slice(&v.to_le_bytes());
                            },
                            PropertyValue::Float(v) => {
                                out.push(1);
                                out.extend_from_slice(&v.to_le_bytes());
                            },
                            PropertyValue::Bool(v) => {
                                out.push(2);
                                out.extend_from_slice(&(v as i32).to_le_bytes());
                            },
                            PropertyValue::Byte(v) => {
                                out.push(3);
                                out.push(v);
                            },
                            PropertyValue::Vec3(v) => {
                                out.push(4);
                                for f in v {
                                    out.extend_from_slice(&f.to_le_bytes());
                                }
                            },
                        }
                    }
                }
            }
        }

        out
    }

    pub fn entry_mut(&mut self, magic_id: MagicId) -> Option<&mut MagicEntry> {
        self.entries.iter_mut().find(|e| e.magic_id == magic_id)
    }

    /// Apply a modification set to one spell entry.
    ///
    /// Returns `false` when the file has no entry for `magic_id`; the
    /// caller skips that registration and carries on, a missing mapping
    /// must never take the other registrants down.
    pub fn apply(&mut self, magic_id: MagicId, mods: &[Modification]) -> bool {
        let Some(entry) = self.entry_mut(magic_id) else {
            warn!("spell {magic_id} not present in file, skipping its modifications");
            return false;
        };

        // Structure first, then values, then removals: injected operations
        // must exist before their property entries land, and removals must
        // not eat an operation a property entry still targets.
        for m in mods.iter().filter(|m| m.kind == ModKind::AddOperationGroup) {
            if entry.group_mut(m.group_id).is_none() {
                entry.groups.push(OperationGroup::new(m.group_id));
            }
        }

        for m in mods.iter().filter(|m| m.kind == ModKind::AddOperation) {
            let insert_after = m.insert_after_op;
            let Some(group) = entry.group_mut(m.group_id) else {
                warn!("group {} not present in spell {magic_id}, skipping op add", m.group_id);
                continue;
            };
            if group.operations.iter().any(|o| o.op_type == m.op_id) {
                continue;
            }
            let at = if insert_after == ANY {
                group.operations.len()
            } else {
                group
                    .operations
                    .iter()
                    .rposition(|o| o.op_type == insert_after)
                    .map(|i| i + 1)
                    .unwrap_or(group.operations.len())
            };
            group.operations.insert(at, Operation::new(m.op_id));
        }

        for m in mods {
            match m.kind {
                ModKind::SetProperty | ModKind::AddProperty => {
                    let Some(value) = m.value else { continue };
                    let Some(op) = entry
                        .group_mut(m.group_id)
                        .and_then(|g| g.operations.iter_mut().find(|o| o.op_type == m.op_id))
                    else {
                        warn!(
                            "op {} not present in spell {magic_id} group {}, skipping property",
                            m.op_id, m.group_id
                        );
                        continue;
                    };
                    op.set_property(m.prop_id, value);
                },
                ModKind::RemoveProperty => {
                    if let Some(group) = entry.group_mut(m.group_id) {
                        for op in group.operations.iter_mut().filter(|o| o.op_type == m.op_id) {
                            op.properties.retain(|p| p.prop_id != m.prop_id);
                        }
                    }
                },
                _ => {},
            }
        }

        for m in mods.iter().filter(|m| m.kind == ModKind::RemoveOperation) {
            if let Some(group) = entry.group_mut(m.group_id) {
                group.operations.retain(|o| o.op_type != m.op_id);
            }
        }

        for m in mods.iter().filter(|m| m.kind == ModKind::RemoveOperationGroup) {
            entry.groups.retain(|g| g.group_id != m.group_id);
        }

        debug!("applied {} modifications to spell {magic_id}", mods.len());
        true
    }
}
