//! Narrow port over the game engine's spell execution machinery.
//!
//! Everything the crate knows about the engine goes through the traits and
//! value types in this module. Offset and layout knowledge lives in
//! [`ffi`] and, for the live process, in [`raw`]; the interception state
//! machine itself never touches a raw pointer.

use crate::magic::model::{GroupId, MagicId, ModValue, OpTypeId, PropertyId, VALUE_SLOT_LEN};

pub mod ffi;
#[cfg(windows)]
pub mod hooks;
#[cfg(windows)]
pub mod raw;

/// A resolved spell execution context. The engine identifies an execution
/// pass by the spell being processed and the operation group within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpellContext {
    pub magic_id: MagicId,
    pub group_id: GroupId,
}

impl SpellContext {
    pub fn new(magic_id: MagicId, group_id: GroupId) -> Self {
        SpellContext { magic_id, group_id }
    }
}

/// Result code of an engine entry point. The engine's values are opaque to
/// this crate beyond the two constants below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EngineStatus(pub i64);

impl EngineStatus {
    /// The sentinel a suppressed call reports without running the original.
    pub const NOOP: EngineStatus = EngineStatus(0);
    /// Generic success, used for synthesized results in pass-through paths.
    pub const OK: EngineStatus = EngineStatus(1);
}

/// View over the typed value cell behind the engine's two-word property
/// call record. The live implementation reads and writes the pointee; tests
/// and synthetic calls use [`OwnedSlot`].
pub trait ValueSlot {
    /// Snapshot the full value cell.
    fn load(&self) -> [u8; VALUE_SLOT_LEN];

    /// Overwrite the leading `bytes.len()` bytes of the cell in place.
    fn store(&mut self, bytes: &[u8]);
}

/// A detached value cell, used for synthesizing calls that have no backing
/// record in the engine's data and as the test stand-in for live cells.
#[derive(Debug, Clone, Default)]
pub struct OwnedSlot {
    bytes: [u8; VALUE_SLOT_LEN],
}

impl OwnedSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: ModValue) -> Self {
        let (bytes, _) = value.to_slot();
        OwnedSlot { bytes }
    }
}

impl ValueSlot for OwnedSlot {
    fn load(&self) -> [u8; VALUE_SLOT_LEN] {
        self.bytes
    }

    fn store(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(VALUE_SLOT_LEN);
        self.bytes[..len].copy_from_slice(&bytes[..len]);
    }
}

/// Callback into the engine's original property execution, handed to the
/// processor by whoever intercepted the call.
///
/// `forward` re-runs the original call with the live record, preserving
/// whatever the slot currently holds. `synthesize` runs the original with a
/// fabricated record around a detached value cell, for calls that do not
/// exist in the source spell data.
pub trait PropertyOriginal {
    fn forward(&mut self, op: OpTypeId, prop: PropertyId) -> EngineStatus;

    fn synthesize(&mut self, op: OpTypeId, prop: PropertyId, slot: &mut OwnedSlot) -> EngineStatus;
}

/// What the intercept should do with a sub-entry call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubEntryAction {
    /// Run the engine's default handling.
    Continue,
    /// Skip the engine's default handling and report [`EngineStatus::NOOP`].
    Suppress,
}
