//! Synthesized spell casts against the engine's invocation entry points.
//!
//! Casting a spell the engine never asked for needs three things the
//! modification model alone cannot supply: a caster, a target descriptor,
//! and correctly-populated invocation buffers with a lifetime the engine is
//! happy with. This module resolves the first two through a policy fallback
//! chain and manages the third with a capped pool of deliberately
//! long-lived allocations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::engine::ffi::{SpellInvocation, TargetDescriptor};
use crate::engine::SpellContext;
use crate::magic::entry::{translate, MagicModEntry};
use crate::magic::model::{GroupId, MagicId, Modification};
use crate::magic::processor::MagicProcessor;

/// Caller-facing actor identity, as game object ids are exposed to mod code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorHandle(pub u32);

/// Engine-internal actor reference, opaque to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorRef(pub usize);

/// Actor collaborator: resolves handles and exposes the engine's own
/// player/target state. Game-specific; implemented by the consumer.
pub trait ActorPort: Send + Sync {
    fn resolve(&self, handle: ActorHandle) -> Option<ActorRef>;

    /// The currently player-controlled actor.
    fn player(&self) -> Option<ActorRef>;

    /// The player's currently locked enemy target.
    fn locked_target(&self) -> Option<ActorRef>;

    /// A copy of the engine's own currently-locked target descriptor.
    /// Replicates body-relative targeting offsets a bare position readout
    /// gets wrong.
    fn locked_target_descriptor(&self) -> Option<TargetDescriptor>;
}

/// The engine's invocation entry points.
pub trait CastPort: Send + Sync {
    /// Populate an invocation buffer for `magic_id`.
    fn setup_invocation(
        &self,
        invocation: &mut SpellInvocation,
        magic_id: MagicId,
        caster: ActorRef,
        target: &TargetDescriptor,
        command_id: u32,
        action_id: u32,
        replayable: bool,
    ) -> bool;

    /// The global spell executor singleton, when the engine has created it.
    fn spell_executor(&self) -> Option<usize>;

    /// Submit a populated invocation buffer for execution.
    fn insert_invocation(&self, executor: usize, invocation: &mut SpellInvocation) -> bool;
}

/// How to pick the casting actor.
#[derive(Debug, Clone, Copy)]
pub enum SourceSelector {
    Actor(ActorHandle),
    /// Player-controlled actor, then the last organic caster.
    Auto,
}

/// How to pick the cast target.
#[derive(Debug, Clone, Copy)]
pub enum TargetSelector {
    Actor(ActorHandle),
    /// Copy the engine's currently-locked target descriptor.
    LockedDescriptor,
    /// Explicit world-space target.
    Position { position: [f32; 3], direction: [f32; 3] },
    /// Locked enemy target, then the last organic target.
    Auto,
}

/// Secondary invocation arguments, defaulted for a plain cast.
#[derive(Debug, Clone, Copy)]
pub struct CastOptions {
    pub command_id: u32,
    pub action_id: u32,
    pub replayable: bool,
}

impl Default for CastOptions {
    fn default() -> Self {
        CastOptions { command_id: 0, action_id: 0, replayable: false }
    }
}

#[derive(Debug, Error)]
pub enum CastError {
    #[error("no source actor available")]
    NoSourceActor,
    #[error("no target available")]
    NoTarget,
    #[error("target descriptor vtable has not been observed yet")]
    NoDescriptorVtable,
    #[error("engine rejected invocation setup")]
    SetupFailed,
    #[error("spell executor is not available")]
    NoExecutor,
    #[error("engine rejected invocation insert")]
    InsertFailed,
}

/// Values remembered from the most recent organic, player-initiated cast.
/// Last-resort fallback context for synthesized casts.
#[derive(Default)]
struct OrganicCache {
    caster: Option<ActorRef>,
    descriptor: Option<TargetDescriptor>,
}

/// How many invocation/descriptor pairs are kept alive before the oldest
/// half is reclaimed.
const INVOCATION_POOL_CAP: usize = 32;

/// Keeps cast buffers alive past the calls that created them. The engine
/// is known to retain pointers into both structs after `insert_invocation`
/// returns, with no observable signal for when it is done; delayed
/// reclamation of the oldest half is a best-effort mitigation, not a
/// correctness guarantee.
#[derive(Default)]
struct InvocationPool {
    live: Vec<(Box<SpellInvocation>, Box<TargetDescriptor>)>,
}

impl InvocationPool {
    fn retain(&mut self, invocation: Box<SpellInvocation>, descriptor: Box<TargetDescriptor>) {
        self.live.push((invocation, descriptor));
        if self.live.len() > INVOCATION_POOL_CAP {
            warn!("invocation pool over capacity, reclaiming oldest {}", INVOCATION_POOL_CAP / 2);
            self.live.drain(..INVOCATION_POOL_CAP / 2);
        }
    }

    fn len(&self) -> usize {
        self.live.len()
    }
}

/// Orchestrates "cast spell X" against the engine.
pub struct CastingEngine {
    processor: Arc<Mutex<MagicProcessor>>,
    cast_port: Arc<dyn CastPort>,
    actors: Arc<dyn ActorPort>,
    pool: Mutex<InvocationPool>,
    organic: Mutex<OrganicCache>,
    descriptor_vftable: OnceCell<usize>,
    /// Set around our own setup call so organic observation skips it.
    casting: AtomicBool,
}

impl CastingEngine {
    pub fn new(
        processor: Arc<Mutex<MagicProcessor>>,
        cast_port: Arc<dyn CastPort>,
        actors: Arc<dyn ActorPort>,
    ) -> Self {
        CastingEngine {
            processor,
            cast_port,
            actors,
            pool: Mutex::new(InvocationPool::default()),
            organic: Mutex::new(OrganicCache::default()),
            descriptor_vftable: OnceCell::new(),
            casting: AtomicBool::new(false),
        }
    }

    /// Cast with default [`CastOptions`].
    pub fn cast(
        &self,
        magic_id: MagicId,
        mods: &[Modification],
        source: SourceSelector,
        target: TargetSelector,
    ) -> Result<(), CastError> {
        self.cast_with_options(magic_id, mods, source, target, CastOptions::default())
    }

    pub fn cast_with_options(
        &self,
        magic_id: MagicId,
        mods: &[Modification],
        source: SourceSelector,
        target: TargetSelector,
        options: CastOptions,
    ) -> Result<(), CastError> {
        let caster = self.resolve_source(source)?;
        let mut descriptor = self.resolve_target(target)?;

        if descriptor.vftable == 0 {
            descriptor.vftable =
                *self.descriptor_vftable.get().ok_or(CastError::NoDescriptorVtable)?;
        }

        // Make the live execution of this cast observe the modification
        // set. Entries are keyed per operation group so multi-group sets
        // activate independently.
        let entries = translate(mods, magic_id);
        if !entries.is_empty() {
            let mut by_group: HashMap<GroupId, Vec<MagicModEntry>> = HashMap::new();
            for e in entries {
                by_group.entry(e.target_group_id).or_default().push(e);
            }

            let mut processor = self.processor.lock();
            for (group_id, batch) in by_group {
                processor.enqueue(SpellContext::new(magic_id, group_id), batch);
            }
        }

        let mut invocation = SpellInvocation::zeroed();
        let descriptor = Box::new(descriptor);

        self.casting.store(true, Ordering::SeqCst);
        let ok = self.cast_port.setup_invocation(
            &mut invocation,
            magic_id,
            caster,
            &descriptor,
            options.command_id,
            options.action_id,
            options.replayable,
        );
        self.casting.store(false, Ordering::SeqCst);

        if !ok {
            return Err(CastError::SetupFailed);
        }

        let executor = self.cast_port.spell_executor().ok_or(CastError::NoExecutor)?;
        if !self.cast_port.insert_invocation(executor, &mut invocation) {
            return Err(CastError::InsertFailed);
        }

        debug!("cast of spell {magic_id} submitted");
        self.pool.lock().retain(invocation, descriptor);
        Ok(())
    }

    fn resolve_source(&self, source: SourceSelector) -> Result<ActorRef, CastError> {
        if let SourceSelector::Actor(handle) = source {
            if let Some(actor) = self.actors.resolve(handle) {
                return Ok(actor);
            }
            trace!("source handle {handle:?} did not resolve, falling back");
        }

        if let Some(player) = self.actors.player() {
            return Ok(player);
        }

        self.organic.lock().caster.ok_or(CastError::NoSourceActor)
    }

    fn resolve_target(&self, target: TargetSelector) -> Result<TargetDescriptor, CastError> {
        match target {
            TargetSelector::Actor(handle) => {
                if let Some(actor) = self.actors.resolve(handle) {
                    return Ok(TargetDescriptor::for_actor(actor.0));
                }
                trace!("target handle {handle:?} did not resolve, falling back");
            },
            TargetSelector::LockedDescriptor => {
                if let Some(descriptor) = self.actors.locked_target_descriptor() {
                    return Ok(descriptor);
                }
                trace!("no locked target descriptor to copy, falling back");
            },
            TargetSelector::Position { position, direction } => {
                return Ok(TargetDescriptor::for_position(position, direction));
            },
            TargetSelector::Auto => {},
        }

        if let Some(actor) = self.actors.locked_target() {
            return Ok(TargetDescriptor::for_actor(actor.0));
        }

        self.organic.lock().descriptor.ok_or(CastError::NoTarget)
    }

    /// Feed from the setup-invocation intercept on every organic cast.
    /// Remembers fallback context and captures the descriptor vtable the
    /// first time it is seen.
    pub fn observe_organic(&self, caster: ActorRef, descriptor: &TargetDescriptor) {
        if self.casting.load(Ordering::SeqCst) {
            return;
        }

        self.capture_descriptor_vtable(descriptor);

        let mut organic = self.organic.lock();
        organic.caster = Some(caster);
        organic.descriptor = Some(*descriptor);
        trace!("organic cast observed, caster {caster:?}");
    }

    /// Feed from the descriptor-constructor intercept. Only the vtable
    /// pointer is of interest.
    pub fn capture_descriptor_vtable(&self, descriptor: &TargetDescriptor) {
        if descriptor.vftable != 0 {
            self.descriptor_vftable.get_or_init(|| {
                debug!("captured target descriptor vftable {:#x}", descriptor.vftable);
                descriptor.vftable
            });
        }
    }

    /// Whether a synthetic target descriptor can currently be built.
    pub fn has_descriptor_vtable(&self) -> bool {
        self.descriptor_vftable.get().is_some()
    }

    /// Buffers currently kept alive for the engine.
    pub fn pooled_buffers(&self) -> usize {
        self.pool.lock().len()
    }
}
