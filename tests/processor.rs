mod harness;

use harness::{run_group_pass, slot_of};
use spellhook::engine::{SpellContext, SubEntryAction};
use spellhook::magic::{translate, MagicBuilder, MagicProcessor, ModValue};

const CTX: SpellContext = SpellContext { magic_id: 214, group_id: 4338 };

/// A plausible stream: three operations, a couple of properties each.
fn stream() -> Vec<(i32, Vec<(i32, ModValue)>)> {
    vec![
        (51, vec![(7, ModValue::Int(1)), (8, ModValue::Float(10.0))]),
        (25, vec![(8, ModValue::Float(20.0)), (9, ModValue::Bool(false))]),
        (35, vec![(12, ModValue::Int(5))]),
    ]
}

fn enqueue(processor: &mut MagicProcessor, builder: &MagicBuilder) {
    processor.enqueue(CTX, translate(builder.modifications(), builder.magic_id()));
}

#[test]
fn no_active_set_passes_everything_through() {
    harness::setup_tracing();

    let mut processor = MagicProcessor::new();
    let result = run_group_pass(&mut processor, CTX, &stream());

    assert_eq!(result.forwarded().len(), 5);
    assert!(result.synthesized().is_empty());
    assert!(result.sub_entries.iter().all(|(_, a)| *a == SubEntryAction::Continue));
}

#[test]
fn injection_surfaces_after_its_trigger_operation() {
    let mut builder = MagicBuilder::new(214);
    builder.add_operation(4338, 2493, [(187, ModValue::Int(2))], 25);

    let mut processor = MagicProcessor::new();
    enqueue(&mut processor, &builder);

    let result = run_group_pass(&mut processor, CTX, &stream());

    let synthetic: Vec<_> = result.synthesized();
    assert_eq!(synthetic, vec![(2493, 187)]);

    // Positioned between the last property of operation 25 and the first
    // property of operation 35.
    let position = result.calls.iter().position(|c| c.is_synthetic()).unwrap();
    assert_eq!(result.calls[position - 1].op_prop(), (25, 9));
    assert_eq!(result.calls[position + 1].op_prop(), (35, 12));
}

#[test]
fn injection_fires_once_even_when_trigger_recurs() {
    let mut builder = MagicBuilder::new(214);
    builder.add_operation(4338, 2493, [(187, ModValue::Int(2))], 25);

    let mut processor = MagicProcessor::new();
    enqueue(&mut processor, &builder);

    // Operation 25 appears twice, separated by another operation.
    let stream = vec![
        (25, vec![(8, ModValue::Float(1.0))]),
        (51, vec![(7, ModValue::Int(1))]),
        (25, vec![(8, ModValue::Float(2.0))]),
        (35, vec![(12, ModValue::Int(5))]),
    ];
    let result = run_group_pass(&mut processor, CTX, &stream);

    assert_eq!(result.synthesized().len(), 1);
}

#[test]
fn end_of_group_injection_fires_after_the_last_operation() {
    let mut builder = MagicBuilder::new(214);
    builder.add_operation(4338, 2493, [(8, ModValue::Float(55.0))], -1);

    let mut processor = MagicProcessor::new();
    enqueue(&mut processor, &builder);

    let result = run_group_pass(&mut processor, CTX, &stream());

    assert_eq!(result.synthesized(), vec![(2493, 8)]);
    assert!(result.calls.last().unwrap().is_synthetic());
}

#[test]
fn end_of_group_injection_fires_even_for_missing_trigger() {
    // The trigger operation type never appears in the stream; the pending
    // queue drains at end of pass.
    let mut builder = MagicBuilder::new(214);
    builder.add_operation(4338, 2493, [(8, ModValue::Float(55.0))], 51);

    let mut processor = MagicProcessor::new();
    enqueue(&mut processor, &builder);

    let stream = vec![(25, vec![(8, ModValue::Float(1.0))])];
    let result = run_group_pass(&mut processor, CTX, &stream);

    // Trigger 51 never observed: the injection does not fire at all.
    assert!(result.synthesized().is_empty());

    // But a trailing trigger flushes at end of pass.
    enqueue(&mut processor, &builder);
    let stream = vec![(25, vec![(8, ModValue::Float(1.0))]), (51, vec![(7, ModValue::Int(1))])];
    let result = run_group_pass(&mut processor, CTX, &stream);
    assert_eq!(result.synthesized(), vec![(2493, 8)]);
}

#[test]
fn remove_property_suppresses_every_occurrence() {
    let mut builder = MagicBuilder::new(214);
    builder.remove_property(4338, 25, 8);

    let mut processor = MagicProcessor::new();
    enqueue(&mut processor, &builder);

    let stream = vec![
        (25, vec![(8, ModValue::Float(1.0)), (9, ModValue::Int(1))]),
        (51, vec![(7, ModValue::Int(1))]),
        (25, vec![(8, ModValue::Float(2.0))]),
    ];
    let result = run_group_pass(&mut processor, CTX, &stream);

    assert!(!result.forwarded().contains(&(25, 8)));
    assert!(result.forwarded().contains(&(25, 9)));
    assert!(result.forwarded().contains(&(51, 7)));
}

#[test]
fn remove_operation_blocks_sub_entry_and_properties() {
    let mut builder = MagicBuilder::new(214);
    builder.remove_operation(4338, 51);

    let mut processor = MagicProcessor::new();
    enqueue(&mut processor, &builder);

    let result = run_group_pass(&mut processor, CTX, &stream());

    assert_eq!(result.sub_entries[0], (51, SubEntryAction::Suppress));
    assert!(result.forwarded().iter().all(|(op, _)| *op != 51));
    // The rest of the group is untouched.
    assert!(result.forwarded().contains(&(25, 8)));
    assert!(result.forwarded().contains(&(35, 12)));
}

#[test]
fn override_is_visible_to_the_original_and_restored_after() {
    let mut builder = MagicBuilder::new(214);
    builder.set_property(4338, 25, 8, ModValue::Float(55.0));

    let mut processor = MagicProcessor::new();
    enqueue(&mut processor, &builder);

    let result = run_group_pass(&mut processor, CTX, &stream());

    // The original call saw the override.
    let call = result
        .calls
        .iter()
        .find(|c| c.op_prop() == (25, 8))
        .unwrap();
    match call {
        harness::EngineCall::Forward { value, .. } => {
            assert_eq!(&value[..4], &55.0f32.to_le_bytes());
        },
        _ => panic!("expected a forwarded call"),
    }

    // The cell holds the source value again once the call returned.
    let (_, _, after) =
        *result.after.iter().find(|(op, prop, _)| (*op, *prop) == (25, 8)).unwrap();
    assert_eq!(after, slot_of(ModValue::Float(20.0)));
}

#[test]
fn batches_activate_in_fifo_order() {
    let mut first = MagicBuilder::new(214);
    first.set_property(4338, 25, 8, ModValue::Float(1.0));
    let mut second = MagicBuilder::new(214);
    second.set_property(4338, 25, 8, ModValue::Float(2.0));

    let mut processor = MagicProcessor::new();
    enqueue(&mut processor, &first);
    enqueue(&mut processor, &second);
    assert_eq!(processor.queued_batches(CTX), 2);

    let seen = |result: &harness::PassResult| match result
        .calls
        .iter()
        .find(|c| c.op_prop() == (25, 8))
        .unwrap()
    {
        harness::EngineCall::Forward { value, .. } => value[..4].to_vec(),
        _ => panic!("expected a forwarded call"),
    };

    let pass = run_group_pass(&mut processor, CTX, &stream());
    assert_eq!(seen(&pass), 1.0f32.to_le_bytes().to_vec());

    let pass = run_group_pass(&mut processor, CTX, &stream());
    assert_eq!(seen(&pass), 2.0f32.to_le_bytes().to_vec());

    // Queue drained: a third pass is untouched.
    let pass = run_group_pass(&mut processor, CTX, &stream());
    assert_eq!(seen(&pass), 20.0f32.to_le_bytes().to_vec());
}

#[test]
fn contexts_are_independent() {
    let other = SpellContext { magic_id: 214, group_id: 7000 };

    let mut builder = MagicBuilder::new(214);
    builder.remove_property(4338, 25, 8);

    let mut processor = MagicProcessor::new();
    enqueue(&mut processor, &builder);

    // The other group's stream is untouched by the queued batch.
    let result = run_group_pass(&mut processor, other, &stream());
    assert!(result.forwarded().contains(&(25, 8)));

    // The batch is still waiting for its own context.
    let result = run_group_pass(&mut processor, CTX, &stream());
    assert!(!result.forwarded().contains(&(25, 8)));
}

#[test]
fn occurrence_scoped_suppression_only_hits_its_occurrence() {
    // The same entry a removal produces, scoped to the second occurrence
    // of (25, 8).
    let mut entry = translate(
        MagicBuilder::new(214).remove_property(4338, 25, 8).modifications(),
        214,
    )
    .remove(0);
    entry.occurrence = 2;

    let mut processor = MagicProcessor::new();
    processor.enqueue(CTX, vec![entry]);

    let stream = vec![
        (25, vec![(8, ModValue::Float(1.0))]),
        (51, vec![(7, ModValue::Int(1))]),
        (25, vec![(8, ModValue::Float(2.0))]),
        (35, vec![(8, ModValue::Float(3.0))]),
    ];
    let result = run_group_pass(&mut processor, CTX, &stream);

    let hits =
        result.forwarded().iter().filter(|(op, prop)| (*op, *prop) == (25, 8)).count();
    // First occurrence forwarded, second suppressed.
    assert_eq!(hits, 1);

    // An unrelated operation carrying the same property id is untouched.
    assert!(result.forwarded().contains(&(35, 8)));
}
