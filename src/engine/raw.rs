//! Unsafe accessors over the live engine.
//!
//! Everything that dereferences game memory or transmutes an address into a
//! callable lives here. Addresses arrive already resolved (signature
//! scanning happens outside this crate) as an [`EngineAddresses`] set.

use std::ffi::c_void;
use std::mem;

use crate::engine::ffi::{PropertyCallRecord, SpellInvocation, TargetDescriptor};
use crate::engine::{SpellContext, ValueSlot};
use crate::magic::casting::{ActorRef, CastPort};
use crate::magic::model::{MagicId, VALUE_SLOT_LEN};

/// Per-property execution callback. The record's second word points at the
/// typed value the property reads.
pub type PropertyExecuteFn =
    unsafe extern "system" fn(*mut c_void, i32, i32, *mut PropertyCallRecord) -> i64;

/// One full processing pass of an operation group.
pub type OperationGroupProcessFn = unsafe extern "system" fn(*mut c_void, *mut c_void) -> i64;

/// Fired once per operation, before its properties.
pub type SubEntryHandleFn = unsafe extern "system" fn(*mut c_void, i32, *mut c_void) -> i64;

/// Populates a spell invocation buffer.
pub type SetupInvocationFn = unsafe extern "system" fn(
    *mut u8,
    i32,
    usize,
    *const TargetDescriptor,
    u32,
    u32,
    u32,
) -> i64;

/// Submits a populated invocation buffer to the spell executor.
pub type InsertInvocationFn = unsafe extern "system" fn(usize, *mut u8) -> i64;

/// Constructs a target descriptor. Hooked only to observe the vtable.
pub type TargetDescriptorCreateFn =
    unsafe extern "system" fn(*mut c_void) -> *mut TargetDescriptor;

/// Resource subsystem load notification, with a UTF-16 path.
pub type ResourceLoadedFn =
    unsafe extern "system" fn(*mut c_void, *const u16, *mut c_void) -> i64;

/// Resolved addresses of every engine entry point this crate touches.
/// `spell_executor` is the address of the engine's global executor pointer,
/// not the executor itself.
#[derive(Debug, Clone, Copy)]
pub struct EngineAddresses {
    pub property_execute: usize,
    pub operation_group_process: usize,
    pub sub_entry_handle: usize,
    pub setup_invocation: usize,
    pub insert_invocation: usize,
    pub target_descriptor_create: usize,
    pub resource_loaded: usize,
    pub spell_executor: usize,
}

// Fixed offsets into the opaque execution context. The context embeds the
// ids of the spell and operation group it is processing.
const CONTEXT_MAGIC_ID: usize = 0x18;
const CONTEXT_GROUP_ID: usize = 0x20;

/// Resolve the spell context from the engine's opaque context pointer.
///
/// # Safety
///
/// `ctx` must be a context pointer the engine passed to one of the hooked
/// entry points, or null.
pub unsafe fn resolve_context(ctx: *mut c_void) -> Option<SpellContext> {
    if ctx.is_null() {
        return None;
    }

    let base = ctx as *const u8;
    let magic_id = (base.add(CONTEXT_MAGIC_ID) as *const i32).read_unaligned();
    let group_id = (base.add(CONTEXT_GROUP_ID) as *const i32).read_unaligned();

    (magic_id >= 0 && group_id >= 0).then(|| SpellContext::new(magic_id, group_id))
}

/// View over the value cell behind a live property call record.
///
/// The cell is the engine's fixed-size value union, so the full
/// [`VALUE_SLOT_LEN`] window is always in bounds regardless of the typed
/// payload's width.
pub struct RawSlot {
    value: *mut u8,
}

impl RawSlot {
    /// # Safety
    ///
    /// `record` must be the live record of an in-flight property call.
    pub unsafe fn new(record: *mut PropertyCallRecord) -> Option<Self> {
        let value = (*record).value;
        (!value.is_null()).then_some(RawSlot { value })
    }
}

impl ValueSlot for RawSlot {
    fn load(&self) -> [u8; VALUE_SLOT_LEN] {
        let mut out = [0u8; VALUE_SLOT_LEN];
        unsafe { std::ptr::copy_nonoverlapping(self.value, out.as_mut_ptr(), VALUE_SLOT_LEN) };
        out
    }

    fn store(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(VALUE_SLOT_LEN);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.value, len) };
    }
}

/// [`CastPort`] over the live engine entry points.
pub struct RawCastPort {
    setup: SetupInvocationFn,
    insert: InsertInvocationFn,
    executor: usize,
}

impl RawCastPort {
    /// # Safety
    ///
    /// The addresses must point at the engine functions the typedefs
    /// describe, in the current process.
    pub unsafe fn new(addresses: &EngineAddresses) -> Self {
        RawCastPort {
            setup: mem::transmute::<usize, SetupInvocationFn>(addresses.setup_invocation),
            insert: mem::transmute::<usize, InsertInvocationFn>(addresses.insert_invocation),
            executor: addresses.spell_executor,
        }
    }
}

unsafe impl Send for RawCastPort {}
unsafe impl Sync for RawCastPort {}

impl CastPort for RawCastPort {
    fn setup_invocation(
        &self,
        invocation: &mut SpellInvocation,
        magic_id: MagicId,
        caster: ActorRef,
        target: &TargetDescriptor,
        command_id: u32,
        action_id: u32,
        replayable: bool,
    ) -> bool {
        unsafe {
            (self.setup)(
                invocation.as_mut_ptr(),
                magic_id,
                caster.0,
                target,
                command_id,
                action_id,
                replayable as u32,
            ) >= 0
        }
    }

    fn spell_executor(&self) -> Option<usize> {
        let executor = unsafe { (self.executor as *const usize).read() };
        (executor != 0).then_some(executor)
    }

    fn insert_invocation(&self, executor: usize, invocation: &mut SpellInvocation) -> bool {
        unsafe { (self.insert)(executor, invocation.as_mut_ptr()) >= 0 }
    }
}

/// Read a NUL-terminated UTF-16 string from engine memory, bounded.
///
/// # Safety
///
/// `ptr` must be null or point at a readable NUL-terminated UTF-16 buffer.
pub unsafe fn read_wide_string(ptr: *const u16) -> Option<String> {
    if ptr.is_null() {
        return None;
    }

    let mut len = 0usize;
    while len < 0x1000 && *ptr.add(len) != 0 {
        len += 1;
    }
    Some(String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len)))
}
