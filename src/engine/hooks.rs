//! Detours over the engine's spell machinery.
//!
//! Six entry points are hooked. Three drive the processor's state machine
//! (property execution, the group lifecycle call, the per-operation
//! sub-entry), two feed the casting engine's observation caches (invocation
//! setup, target descriptor construction), and one feeds the writer
//! (resource load notifications).
//!
//! Every detour follows the same transparency rule: if anything about the
//! call cannot be resolved, or the shared state is busy on this thread, the
//! call goes straight to the trampoline untouched.

use std::ffi::c_void;
use std::mem;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::trace;

use crate::engine::ffi::PropertyCallRecord;
use crate::engine::raw::{
    self, EngineAddresses, OperationGroupProcessFn, PropertyExecuteFn, RawCastPort, RawSlot,
    ResourceLoadedFn, SetupInvocationFn, SubEntryHandleFn, TargetDescriptorCreateFn,
};
use crate::engine::{EngineStatus, OwnedSlot, PropertyOriginal, SubEntryAction, ValueSlot};
use crate::magic::casting::{ActorPort, ActorRef, CastingEngine};
use crate::magic::model::{OpTypeId, PropertyId};
use crate::magic::processor::MagicProcessor;
use crate::magic::writer::{MagicWriter, ResourceHandle, ResourcePort};
use crate::mh::{MhHook, MhHooks, MH_STATUS};

////////////////////////////////////////////////////////////////////////////////////////////////////
// Global singletons
////////////////////////////////////////////////////////////////////////////////////////////////////

static TRAMPOLINES: OnceCell<Trampolines> = OnceCell::new();
static PROCESSOR: OnceCell<Arc<Mutex<MagicProcessor>>> = OnceCell::new();
static CASTING: OnceCell<Arc<CastingEngine>> = OnceCell::new();
static WRITER: OnceCell<MagicWriter> = OnceCell::new();

struct Trampolines {
    property_execute: PropertyExecuteFn,
    operation_group_process: OperationGroupProcessFn,
    sub_entry_handle: SubEntryHandleFn,
    setup_invocation: SetupInvocationFn,
    target_descriptor_create: TargetDescriptorCreateFn,
    resource_loaded: ResourceLoadedFn,
}

unsafe impl Send for Trampolines {}
unsafe impl Sync for Trampolines {}

/// The shared processor, once hooks are installed.
pub fn processor() -> Option<Arc<Mutex<MagicProcessor>>> {
    PROCESSOR.get().cloned()
}

/// The shared casting engine, once hooks are installed.
pub fn casting_engine() -> Option<Arc<CastingEngine>> {
    CASTING.get().cloned()
}

/// The shared writer, once hooks are installed.
pub fn magic_writer() -> Option<MagicWriter> {
    WRITER.get().cloned()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Hook entry points
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Calls the original through the trampoline, fabricating records for
/// synthesized properties.
struct RawInvoker {
    ctx: *mut c_void,
    trampoline: PropertyExecuteFn,
    record: *mut PropertyCallRecord,
}

impl PropertyOriginal for RawInvoker {
    fn forward(&mut self, op: OpTypeId, prop: PropertyId) -> EngineStatus {
        if self.record.is_null() {
            return EngineStatus::NOOP;
        }
        EngineStatus(unsafe { (self.trampoline)(self.ctx, op, prop, self.record) })
    }

    fn synthesize(&mut self, op: OpTypeId, prop: PropertyId, slot: &mut OwnedSlot) -> EngineStatus {
        let mut bytes = slot.load();
        let mut record = PropertyCallRecord::synthetic(bytes.as_mut_ptr());
        let status = EngineStatus(unsafe { (self.trampoline)(self.ctx, op, prop, &mut record) });
        slot.store(&bytes);
        status
    }
}

unsafe extern "system" fn property_execute_impl(
    ctx: *mut c_void,
    op: i32,
    prop: i32,
    record: *mut PropertyCallRecord,
) -> i64 {
    let trampolines = TRAMPOLINES.get().expect("property execute trampoline uninitialized");
    let trampoline = trampolines.property_execute;

    let (Some(spell_ctx), Some(processor)) = (raw::resolve_context(ctx), PROCESSOR.get()) else {
        return trampoline(ctx, op, prop, record);
    };

    // A failed lock means this thread is already inside the processor
    // (engine recursion) or another spell is mid-callback. Stay transparent.
    let Some(mut processor) = processor.try_lock() else {
        trace!("property execute re-entered, passing through");
        return trampoline(ctx, op, prop, record);
    };

    let slot = if record.is_null() { None } else { RawSlot::new(record) };
    let Some(mut slot) = slot else {
        return trampoline(ctx, op, prop, record);
    };

    let mut invoker = RawInvoker { ctx, trampoline, record };
    processor.on_property(spell_ctx, op, prop, &mut slot, &mut invoker).0
}

unsafe extern "system" fn operation_group_process_impl(
    ctx: *mut c_void,
    args: *mut c_void,
) -> i64 {
    let trampolines = TRAMPOLINES.get().expect("group process trampoline uninitialized");
    let trampoline = trampolines.operation_group_process;

    let (Some(spell_ctx), Some(processor)) = (raw::resolve_context(ctx), PROCESSOR.get()) else {
        return trampoline(ctx, args);
    };

    if let Some(mut guard) = processor.try_lock() {
        guard.begin_group(spell_ctx);
    }

    let result = trampoline(ctx, args);

    if let Some(mut guard) = processor.try_lock() {
        let mut invoker = RawInvoker {
            ctx,
            trampoline: trampolines.property_execute,
            record: std::ptr::null_mut(),
        };
        guard.end_group(spell_ctx, &mut invoker);
    }

    result
}

unsafe extern "system" fn sub_entry_handle_impl(
    ctx: *mut c_void,
    op: i32,
    args: *mut c_void,
) -> i64 {
    let trampolines = TRAMPOLINES.get().expect("sub entry trampoline uninitialized");
    let trampoline = trampolines.sub_entry_handle;

    let (Some(spell_ctx), Some(processor)) = (raw::resolve_context(ctx), PROCESSOR.get()) else {
        return trampoline(ctx, op, args);
    };

    let action = match processor.try_lock() {
        Some(mut guard) => guard.on_sub_entry(spell_ctx, op),
        None => SubEntryAction::Continue,
    };

    match action {
        // Skipping the original keeps the engine from default-initializing
        // an operation that later writes expect to be absent.
        SubEntryAction::Suppress => EngineStatus::NOOP.0,
        SubEntryAction::Continue => trampoline(ctx, op, args),
    }
}

unsafe extern "system" fn setup_invocation_impl(
    invocation: *mut u8,
    magic_id: i32,
    caster: usize,
    target: *const crate::engine::ffi::TargetDescriptor,
    command_id: u32,
    action_id: u32,
    replayable: u32,
) -> i64 {
    let trampolines = TRAMPOLINES.get().expect("setup invocation trampoline uninitialized");

    if let (Some(casting), false) = (CASTING.get(), target.is_null()) {
        casting.observe_organic(ActorRef(caster), &*target);
    }

    (trampolines.setup_invocation)(
        invocation, magic_id, caster, target, command_id, action_id, replayable,
    )
}

unsafe extern "system" fn target_descriptor_create_impl(
    manager: *mut c_void,
) -> *mut crate::engine::ffi::TargetDescriptor {
    let trampolines = TRAMPOLINES.get().expect("descriptor create trampoline uninitialized");

    let descriptor = (trampolines.target_descriptor_create)(manager);

    if let (Some(casting), false) = (CASTING.get(), descriptor.is_null()) {
        casting.capture_descriptor_vtable(&*descriptor);
    }

    descriptor
}

unsafe extern "system" fn resource_loaded_impl(
    manager: *mut c_void,
    path: *const u16,
    resource: *mut c_void,
) -> i64 {
    let trampolines = TRAMPOLINES.get().expect("resource loaded trampoline uninitialized");

    let result = (trampolines.resource_loaded)(manager, path, resource);

    if let (Some(writer), Some(path)) = (WRITER.get(), raw::read_wide_string(path)) {
        writer.on_resource_loaded(&path, ResourceHandle(resource as usize));
    }

    result
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Hook installation
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Owns the detours over the engine's spell machinery.
pub struct SpellHooks(MhHooks);

impl SpellHooks {
    /// Create the hook set and wire the shared engines behind it.
    ///
    /// The actor and resource collaborators stay game-specific and come
    /// from the embedding project.
    ///
    /// # Safety
    ///
    /// `addresses` must be correctly resolved for the running process.
    pub unsafe fn new(
        addresses: EngineAddresses,
        actors: Arc<dyn ActorPort>,
        resources: Arc<dyn ResourcePort>,
    ) -> Result<Self, MH_STATUS> {
        let hook_property = MhHook::new(
            addresses.property_execute as *mut _,
            property_execute_impl as *mut _,
        )?;
        let hook_group = MhHook::new(
            addresses.operation_group_process as *mut _,
            operation_group_process_impl as *mut _,
        )?;
        let hook_sub_entry =
            MhHook::new(addresses.sub_entry_handle as *mut _, sub_entry_handle_impl as *mut _)?;
        let hook_setup =
            MhHook::new(addresses.setup_invocation as *mut _, setup_invocation_impl as *mut _)?;
        let hook_descriptor = MhHook::new(
            addresses.target_descriptor_create as *mut _,
            target_descriptor_create_impl as *mut _,
        )?;
        let hook_resource =
            MhHook::new(addresses.resource_loaded as *mut _, resource_loaded_impl as *mut _)?;

        TRAMPOLINES.get_or_init(|| Trampolines {
            property_execute: mem::transmute(hook_property.trampoline()),
            operation_group_process: mem::transmute(hook_group.trampoline()),
            sub_entry_handle: mem::transmute(hook_sub_entry.trampoline()),
            setup_invocation: mem::transmute(hook_setup.trampoline()),
            target_descriptor_create: mem::transmute(hook_descriptor.trampoline()),
            resource_loaded: mem::transmute(hook_resource.trampoline()),
        });

        let processor = PROCESSOR.get_or_init(|| Arc::new(Mutex::new(MagicProcessor::new())));
        CASTING.get_or_init(|| {
            Arc::new(CastingEngine::new(
                Arc::clone(processor),
                Arc::new(RawCastPort::new(&addresses)),
                actors,
            ))
        });
        WRITER.get_or_init(|| MagicWriter::new(resources));

        MhHooks::new([
            hook_property,
            hook_group,
            hook_sub_entry,
            hook_setup,
            hook_descriptor,
            hook_resource,
        ])
        .map(SpellHooks)
    }

    /// # Safety
    ///
    /// Enables the detours.
    pub unsafe fn apply(&self) -> Result<(), MH_STATUS> {
        self.0.apply()
    }

    /// # Safety
    ///
    /// Disables the detours. In-flight callbacks drain through the
    /// trampolines.
    pub unsafe fn unapply(&self) -> Result<(), MH_STATUS> {
        self.0.unapply()
    }
}
