#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Mutex;

use spellhook::engine::ffi::TargetDescriptor;
use spellhook::engine::{
    EngineStatus, OwnedSlot, PropertyOriginal, SpellContext, SubEntryAction, ValueSlot,
};
use spellhook::magic::model::VALUE_SLOT_LEN;
use spellhook::magic::{
    ActorHandle, ActorPort, ActorRef, CastPort, MagicId, MagicProcessor, ModValue, ResourceHandle,
    ResourcePort,
};

pub fn setup_tracing() {
    spellhook::util::setup_tracing(None);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Simulated spell execution
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One call the simulated engine observed.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    /// An original property execution, with the value visible at call time.
    Forward { op: i32, prop: i32, value: [u8; VALUE_SLOT_LEN] },
    /// A synthesized property execution.
    Synthetic { op: i32, prop: i32, value: [u8; VALUE_SLOT_LEN] },
}

impl EngineCall {
    pub fn op_prop(&self) -> (i32, i32) {
        match self {
            EngineCall::Forward { op, prop, .. } | EngineCall::Synthetic { op, prop, .. } => {
                (*op, *prop)
            },
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, EngineCall::Synthetic { .. })
    }
}

/// Stands in for the engine's original property execution and records what
/// reaches it.
#[derive(Default)]
pub struct RecordingInvoker {
    pub calls: Vec<EngineCall>,
    current: Option<Rc<RefCell<[u8; VALUE_SLOT_LEN]>>>,
}

impl PropertyOriginal for RecordingInvoker {
    fn forward(&mut self, op: i32, prop: i32) -> EngineStatus {
        let value = self.current.as_ref().map(|cell| *cell.borrow()).unwrap_or_default();
        self.calls.push(EngineCall::Forward { op, prop, value });
        EngineStatus::OK
    }

    fn synthesize(&mut self, op: i32, prop: i32, slot: &mut OwnedSlot) -> EngineStatus {
        self.calls.push(EngineCall::Synthetic { op, prop, value: slot.load() });
        EngineStatus::OK
    }
}

/// A value cell shared between the stream driver and the invoker, so the
/// invoker can see overridden values the way the live record pointer would.
#[derive(Clone)]
pub struct SharedSlot(pub Rc<RefCell<[u8; VALUE_SLOT_LEN]>>);

impl ValueSlot for SharedSlot {
    fn load(&self) -> [u8; VALUE_SLOT_LEN] {
        *self.0.borrow()
    }

    fn store(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(VALUE_SLOT_LEN);
        self.0.borrow_mut()[..len].copy_from_slice(&bytes[..len]);
    }
}

/// What one full group pass produced.
pub struct PassResult {
    /// Everything the simulated engine executed, in order.
    pub calls: Vec<EngineCall>,
    /// Sub-entry outcome per operation, in stream order.
    pub sub_entries: Vec<(i32, SubEntryAction)>,
    /// Value cell contents after each original call returned, in stream
    /// order, keyed by (op, prop).
    pub after: Vec<(i32, i32, [u8; VALUE_SLOT_LEN])>,
}

impl PassResult {
    pub fn forwarded(&self) -> Vec<(i32, i32)> {
        self.calls.iter().filter(|c| !c.is_synthetic()).map(EngineCall::op_prop).collect()
    }

    pub fn synthesized(&self) -> Vec<(i32, i32)> {
        self.calls.iter().filter(|c| c.is_synthetic()).map(EngineCall::op_prop).collect()
    }
}

/// Drive one operation group processing pass through the processor, the
/// way the hooked engine would: lifecycle bracket, sub-entry per operation,
/// property execution per property.
pub fn run_group_pass(
    processor: &mut MagicProcessor,
    ctx: SpellContext,
    stream: &[(i32, Vec<(i32, ModValue)>)],
) -> PassResult {
    let mut invoker = RecordingInvoker::default();
    let mut sub_entries = Vec::new();
    let mut after = Vec::new();

    processor.begin_group(ctx);

    for (op, props) in stream {
        sub_entries.push((*op, processor.on_sub_entry(ctx, *op)));

        for (prop, initial) in props {
            let cell = Rc::new(RefCell::new(initial.to_slot().0));
            let mut slot = SharedSlot(Rc::clone(&cell));
            invoker.current = Some(Rc::clone(&cell));
            processor.on_property(ctx, *op, *prop, &mut slot, &mut invoker);
            after.push((*op, *prop, *cell.borrow()));
        }
    }

    invoker.current = None;
    processor.end_group(ctx, &mut invoker);

    PassResult { calls: invoker.calls, sub_entries, after }
}

pub fn slot_of(value: ModValue) -> [u8; VALUE_SLOT_LEN] {
    value.to_slot().0
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Actor and cast mocks
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
pub struct MockActors {
    pub actors: HashMap<ActorHandle, ActorRef>,
    pub player: Option<ActorRef>,
    pub locked_target: Option<ActorRef>,
    pub locked_descriptor: Option<TargetDescriptor>,
}

impl ActorPort for MockActors {
    fn resolve(&self, handle: ActorHandle) -> Option<ActorRef> {
        self.actors.get(&handle).copied()
    }

    fn player(&self) -> Option<ActorRef> {
        self.player
    }

    fn locked_target(&self) -> Option<ActorRef> {
        self.locked_target
    }

    fn locked_target_descriptor(&self) -> Option<TargetDescriptor> {
        self.locked_descriptor
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedCast {
    pub magic_id: MagicId,
    pub caster: ActorRef,
    pub target_actor: usize,
    pub target_vftable: usize,
}

/// Records invocation setups and inserts instead of reaching an engine.
#[derive(Default)]
pub struct MockCaster {
    pub submitted: Mutex<Vec<SubmittedCast>>,
    pub executor: Option<usize>,
    pub fail_setup: bool,
}

impl CastPort for MockCaster {
    fn setup_invocation(
        &self,
        _invocation: &mut spellhook::engine::ffi::SpellInvocation,
        magic_id: MagicId,
        caster: ActorRef,
        target: &TargetDescriptor,
        _command_id: u32,
        _action_id: u32,
        _replayable: bool,
    ) -> bool {
        if self.fail_setup {
            return false;
        }
        self.submitted.lock().unwrap().push(SubmittedCast {
            magic_id,
            caster,
            target_actor: target.target_actor,
            target_vftable: target.vftable,
        });
        true
    }

    fn spell_executor(&self) -> Option<usize> {
        self.executor
    }

    fn insert_invocation(
        &self,
        _executor: usize,
        _invocation: &mut spellhook::engine::ffi::SpellInvocation,
    ) -> bool {
        true
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Resource mocks
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct MockResource {
    data: Vec<u8>,
    ready: bool,
}

/// In-memory resource subsystem for writer tests.
#[derive(Default)]
pub struct MockResources {
    resources: Mutex<HashMap<usize, MockResource>>,
    resident: Mutex<HashMap<String, ResourceHandle>>,
    pub replaced: Mutex<Vec<usize>>,
}

impl MockResources {
    /// Seed a resource buffer, optionally marking its path resident.
    pub fn seed(&self, id: usize, data: Vec<u8>, ready: bool, resident_path: Option<&str>) {
        self.resources.lock().unwrap().insert(id, MockResource { data, ready });
        if let Some(path) = resident_path {
            self.resident.lock().unwrap().insert(path.to_owned(), ResourceHandle(id));
        }
    }

    pub fn set_ready(&self, id: usize) {
        if let Some(r) = self.resources.lock().unwrap().get_mut(&id) {
            r.ready = true;
        }
    }

    pub fn data(&self, id: usize) -> Option<Vec<u8>> {
        self.resources.lock().unwrap().get(&id).map(|r| r.data.clone())
    }
}

impl ResourcePort for MockResources {
    fn resident(&self, path: &str) -> Option<ResourceHandle> {
        self.resident.lock().unwrap().get(path).copied()
    }

    fn buffer_ready(&self, resource: ResourceHandle) -> bool {
        self.resources.lock().unwrap().get(&resource.0).is_some_and(|r| r.ready)
    }

    fn read(&self, resource: ResourceHandle) -> Option<Vec<u8>> {
        self.resources.lock().unwrap().get(&resource.0).map(|r| r.data.clone())
    }

    fn replace(&self, resource: ResourceHandle, data: Vec<u8>) -> bool {
        let mut resources = self.resources.lock().unwrap();
        let Some(r) = resources.get_mut(&resource.0) else {
            return false;
        };
        r.data = data;
        self.replaced.lock().unwrap().push(resource.0);
        true
    }
}
