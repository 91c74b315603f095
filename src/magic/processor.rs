//! The live-injection state machine.
//!
//! The processor sits between the engine's spell-data execution and a queued
//! modification set, and makes the execution stream look as if the spell
//! file had contained the requested changes: property calls can be
//! suppressed, overridden in place, or synthesized out of thin air at a
//! chosen point of the stream.
//!
//! It is driven entirely by whoever intercepted the engine:
//!
//! - [`begin_group`] and [`end_group`] bracket one processing pass of an
//!   operation group (the engine's group lifecycle call).
//! - [`on_sub_entry`] observes the per-operation call that precedes an
//!   operation's properties.
//! - [`on_property`] observes (and decides the fate of) every property
//!   execution.
//!
//! Any lookup failure degrades to passing the call through unchanged. The
//! processor must never be the reason an engine call fails.
//!
//! [`begin_group`]: MagicProcessor::begin_group
//! [`end_group`]: MagicProcessor::end_group
//! [`on_sub_entry`]: MagicProcessor::on_sub_entry
//! [`on_property`]: MagicProcessor::on_property

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::engine::{
    EngineStatus, OwnedSlot, PropertyOriginal, SpellContext, SubEntryAction, ValueSlot,
};
use crate::magic::entry::MagicModEntry;
use crate::magic::model::{OpTypeId, PropertyId, ANY};

/// Per-pass interception state for one spell context.
#[derive(Default)]
struct PassState {
    /// The modification batch bound to this pass, once activated.
    active: Option<Vec<MagicModEntry>>,
    /// Occurrence counter per operation type, bumped on operation change.
    op_occurrence: HashMap<OpTypeId, i32>,
    /// Occurrence counter per (operation type, property) pair.
    prop_occurrence: HashMap<(OpTypeId, PropertyId), i32>,
    last_op: Option<OpTypeId>,
    /// Injections whose trigger operation was observed, waiting for the
    /// next operation change to surface in the stream.
    pending: Vec<MagicModEntry>,
    /// Indices of active entries already queued, so an entry fires at most
    /// once per activation even when its trigger operation recurs.
    queued: HashSet<usize>,
    /// Re-entrancy guard. While a synthetic call is in flight, nested
    /// property calls must not advance the state machine.
    injecting: bool,
}

/// The interception engine. One instance serves every spell context; the
/// hook layer owns it behind a mutex and feeds it resolved contexts.
#[derive(Default)]
pub struct MagicProcessor {
    /// Batches queued per context, oldest first. Queuing two batches for
    /// the same context services two consecutive casts of the same spell.
    queues: HashMap<SpellContext, VecDeque<Vec<MagicModEntry>>>,
    passes: HashMap<SpellContext, PassState>,
}

impl MagicProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a modification batch for the next activation of `ctx`.
    pub fn enqueue(&mut self, ctx: SpellContext, batch: Vec<MagicModEntry>) {
        if batch.is_empty() {
            return;
        }
        debug!(
            "queued {} entries for spell {} group {}",
            batch.len(),
            ctx.magic_id,
            ctx.group_id
        );
        self.queues.entry(ctx).or_default().push_back(batch);
    }

    /// Number of batches still waiting for `ctx` to activate.
    pub fn queued_batches(&self, ctx: SpellContext) -> usize {
        self.queues.get(&ctx).map_or(0, VecDeque::len)
    }

    /// Start of an operation group processing pass. Clears every tracker
    /// for the context so the pass starts from a clean slate.
    pub fn begin_group(&mut self, ctx: SpellContext) {
        trace!("group pass begins for spell {} group {}", ctx.magic_id, ctx.group_id);
        self.passes.insert(ctx, PassState::default());
    }

    /// End of an operation group processing pass, after the engine's own
    /// call returned. Flushes whatever is still owed to the stream, then
    /// drops the pass state so the next activation starts clean.
    pub fn end_group(&mut self, ctx: SpellContext, original: &mut dyn PropertyOriginal) {
        let Some(mut pass) = self.passes.remove(&ctx) else {
            return;
        };

        // Injections whose trigger operation never recurred are still
        // pending. They surface now, before the end-of-group batch.
        Self::flush_pending(&mut pass, original);

        if let Some(active) = pass.active.take() {
            for (i, e) in active.iter().enumerate() {
                if e.enabled
                    && e.is_injection
                    && e.inject_after_op == ANY
                    && !pass.queued.contains(&i)
                {
                    Self::inject(e, original);
                }
            }
            debug!("group pass done for spell {} group {}", ctx.magic_id, ctx.group_id);
        }
    }

    /// Per-operation sub-entry call, observed before the operation's
    /// properties. Used to activate queued batches as early as possible and
    /// to keep the engine from default-initializing removed operations.
    pub fn on_sub_entry(&mut self, ctx: SpellContext, op: OpTypeId) -> SubEntryAction {
        let pass = self.passes.entry(ctx).or_default();
        if pass.injecting {
            return SubEntryAction::Continue;
        }

        Self::activate(&mut self.queues, pass, ctx);

        let Some(active) = &pass.active else {
            return SubEntryAction::Continue;
        };

        // The occurrence this operation instance is about to get. The
        // counter itself only advances on operation change in the property
        // stream.
        let next_occurrence = if pass.last_op == Some(op) {
            pass.op_occurrence.get(&op).copied().unwrap_or(0)
        } else {
            pass.op_occurrence.get(&op).copied().unwrap_or(0) + 1
        };

        let suppressed = active.iter().any(|e| {
            e.enabled
                && e.disable_op
                && e.is_operation_only
                && e.matches_context(ctx.magic_id, ctx.group_id)
                && (e.op_id == ANY || e.op_id == op)
                && e.matches_occurrence(next_occurrence)
        });

        if suppressed {
            trace!(
                "suppressing sub-entry of op {op} (occurrence {next_occurrence}) in spell {}",
                ctx.magic_id
            );
            SubEntryAction::Suppress
        } else {
            SubEntryAction::Continue
        }
    }

    /// Property execution intercept. Decides whether the call is passed
    /// through, suppressed, or overridden, and drives operation-change
    /// detection and injection flushing as a side effect.
    pub fn on_property(
        &mut self,
        ctx: SpellContext,
        op: OpTypeId,
        prop: PropertyId,
        slot: &mut dyn ValueSlot,
        original: &mut dyn PropertyOriginal,
    ) -> EngineStatus {
        let pass = self.passes.entry(ctx).or_default();

        if pass.injecting {
            return original.forward(op, prop);
        }

        Self::activate(&mut self.queues, pass, ctx);

        if pass.last_op != Some(op) {
            // The previous operation is done: surface everything that was
            // waiting for it before the new operation's properties run.
            Self::flush_pending(pass, original);

            *pass.op_occurrence.entry(op).or_insert(0) += 1;
            pass.last_op = Some(op);

            if let Some(active) = &pass.active {
                for (i, e) in active.iter().enumerate() {
                    if e.enabled
                        && e.is_injection
                        && e.inject_after_op == op
                        && !pass.queued.contains(&i)
                    {
                        trace!(
                            "op {op} observed, queuing injection of prop {} for next transition",
                            e.prop_id
                        );
                        pass.queued.insert(i);
                        pass.pending.push(e.clone());
                    }
                }
            }
        }

        let op_occurrence = pass.op_occurrence.get(&op).copied().unwrap_or(0);
        let pair = pass.prop_occurrence.entry((op, prop)).or_insert(0);
        *pair += 1;
        let prop_occurrence = *pair;

        let Some(active) = &pass.active else {
            return original.forward(op, prop);
        };

        // Whole-operation suppression wins over everything else.
        let op_suppressed = active.iter().any(|e| {
            e.enabled
                && e.disable_op
                && e.is_operation_only
                && e.matches_context(ctx.magic_id, ctx.group_id)
                && (e.op_id == ANY || e.op_id == op)
                && e.matches_occurrence(op_occurrence)
        });
        if op_suppressed {
            trace!("suppressing prop {prop} of removed op {op} in spell {}", ctx.magic_id);
            return EngineStatus::NOOP;
        }

        let prop_suppressed = active.iter().any(|e| {
            e.enabled
                && e.disable_op
                && !e.is_operation_only
                && e.matches_context(ctx.magic_id, ctx.group_id)
                && (e.op_id == ANY || e.op_id == op)
                && e.prop_id == prop
                && e.matches_occurrence(prop_occurrence)
        });
        if prop_suppressed {
            trace!("suppressing prop {prop} of op {op} in spell {}", ctx.magic_id);
            return EngineStatus::NOOP;
        }

        let override_entry = active.iter().find(|e| {
            e.enabled
                && !e.disable_op
                && !e.is_injection
                && e.matches_context(ctx.magic_id, ctx.group_id)
                && (e.op_id == ANY || e.op_id == op)
                && e.prop_id == prop
                && e.matches_occurrence(prop_occurrence)
        });

        if let Some(value) = override_entry.and_then(|e| e.value) {
            // Overwrite in place for the duration of the original call,
            // then put the source bytes back. The engine may hold onward
            // references into the record that expect the untouched value.
            let saved = slot.load();
            let (bytes, len) = value.to_slot();
            slot.store(&bytes[..len]);

            trace!("overriding prop {prop} of op {op} with {value:?}");
            let status = original.forward(op, prop);

            slot.store(&saved);
            return status;
        }

        trace!("prop {prop} of op {op} (occurrence {prop_occurrence}) passed through");
        original.forward(op, prop)
    }

    fn activate(
        queues: &mut HashMap<SpellContext, VecDeque<Vec<MagicModEntry>>>,
        pass: &mut PassState,
        ctx: SpellContext,
    ) {
        if pass.active.is_some() {
            return;
        }
        if let Some(batch) = queues.get_mut(&ctx).and_then(VecDeque::pop_front) {
            debug!(
                "activated batch of {} entries for spell {} group {}",
                batch.len(),
                ctx.magic_id,
                ctx.group_id
            );
            pass.active = Some(batch);
        }
    }

    fn flush_pending(pass: &mut PassState, original: &mut dyn PropertyOriginal) {
        if pass.pending.is_empty() {
            return;
        }

        let pending = std::mem::take(&mut pass.pending);
        pass.injecting = true;
        for e in &pending {
            Self::inject(e, original);
        }
        pass.injecting = false;
    }

    fn inject(e: &MagicModEntry, original: &mut dyn PropertyOriginal) {
        let Some(value) = e.value else {
            return;
        };

        let mut slot = OwnedSlot::from_value(value);
        let status = original.synthesize(e.op_id, e.prop_id, &mut slot);
        trace!(
            "injected prop {} of op {} with {value:?}, engine reported {status:?}",
            e.prop_id,
            e.op_id
        );
    }
}
