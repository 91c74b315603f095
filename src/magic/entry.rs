//! Processor-facing translation of the modification model.
//!
//! One [`Modification`] maps to zero or more [`MagicModEntry`]. The entry
//! carries everything the live interception path needs to match a call in
//! the execution stream: wildcardable target filters, an occurrence index,
//! and the injection trigger.

use crate::magic::model::{
    GroupId, MagicId, ModKind, ModValue, Modification, OpTypeId, PropertyId, ANY,
};

/// A single live-execution instruction derived from a [`Modification`].
#[derive(Debug, Clone, PartialEq)]
pub struct MagicModEntry {
    pub enabled: bool,
    /// Synthesize a call that does not exist in the source spell data.
    pub is_injection: bool,
    /// Matches at operation granularity rather than a single property.
    pub is_operation_only: bool,
    /// Suppress the matched call instead of executing it.
    pub disable_op: bool,
    /// Spell id filter. [`ANY`] matches every spell.
    pub target_magic_id: MagicId,
    /// Operation group filter. [`ANY`] matches every group.
    pub target_group_id: GroupId,
    /// Operation type this entry matches, or [`ANY`].
    pub op_id: OpTypeId,
    /// Property this entry matches or injects, or [`ANY`].
    pub prop_id: PropertyId,
    /// Which repeat of the target to match, starting at 1. [`ANY`] matches
    /// all of them.
    pub occurrence: i32,
    pub value: Option<ModValue>,
    /// Operation type after which an injection must surface in the stream.
    /// [`ANY`] queues it for the end-of-group flush.
    pub inject_after_op: OpTypeId,
}

impl MagicModEntry {
    fn matcher(magic_id: MagicId, group_id: GroupId, op_id: OpTypeId, prop_id: PropertyId) -> Self {
        MagicModEntry {
            enabled: true,
            is_injection: false,
            is_operation_only: false,
            disable_op: false,
            target_magic_id: magic_id,
            target_group_id: group_id,
            op_id,
            prop_id,
            occurrence: ANY,
            value: None,
            inject_after_op: ANY,
        }
    }

    /// Whether this entry applies to the given spell context.
    pub fn matches_context(&self, magic_id: MagicId, group_id: GroupId) -> bool {
        (self.target_magic_id == ANY || self.target_magic_id == magic_id)
            && (self.target_group_id == ANY || self.target_group_id == group_id)
    }

    /// Whether this entry's occurrence filter accepts the given occurrence.
    pub fn matches_occurrence(&self, occurrence: i32) -> bool {
        self.occurrence == ANY || self.occurrence == occurrence
    }
}

/// Translate a modification set into live-execution entries for one spell.
///
/// `AddOperation` produces no entry of its own: the engine has no notion of
/// an empty injected operation, only of property calls, so each attached
/// `AddProperty` becomes an injection entry carrying the parent operation's
/// placement trigger. Group-level additions only make sense against the
/// file document and translate to nothing here. A group removal becomes a
/// wildcard suppression over the whole group.
pub fn translate(mods: &[Modification], magic_id: MagicId) -> Vec<MagicModEntry> {
    let mut entries = Vec::new();

    for m in mods {
        match m.kind {
            ModKind::SetProperty => {
                let mut e = MagicModEntry::matcher(magic_id, m.group_id, m.op_id, m.prop_id);
                e.value = m.value;
                entries.push(e);
            },
            ModKind::AddProperty => {
                let mut e = MagicModEntry::matcher(magic_id, m.group_id, m.op_id, m.prop_id);
                e.is_injection = true;
                e.value = m.value;
                e.inject_after_op = m.insert_after_op;
                entries.push(e);
            },
            ModKind::RemoveProperty => {
                let mut e = MagicModEntry::matcher(magic_id, m.group_id, m.op_id, m.prop_id);
                e.disable_op = true;
                entries.push(e);
            },
            ModKind::RemoveOperation => {
                let mut e = MagicModEntry::matcher(magic_id, m.group_id, m.op_id, ANY);
                e.disable_op = true;
                e.is_operation_only = true;
                entries.push(e);
            },
            ModKind::RemoveOperationGroup => {
                let mut e = MagicModEntry::matcher(magic_id, m.group_id, ANY, ANY);
                e.disable_op = true;
                e.is_operation_only = true;
                entries.push(e);
            },
            // Realized through their attached properties or the file codec.
            ModKind::AddOperation | ModKind::AddOperationGroup => {},
        }
    }

    entries
}
