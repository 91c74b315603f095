mod harness;

use spellhook::magic::{
    MagicBuilder, ModKind, ModValue, Modification, PropertyTypeTable, ValueKind,
};

fn find<'a>(
    mods: &'a [Modification],
    kind: ModKind,
    group: i32,
    op: i32,
    prop: i32,
) -> Option<&'a Modification> {
    mods.iter()
        .find(|m| m.kind == kind && m.group_id == group && m.op_id == op && m.prop_id == prop)
}

#[test]
fn set_remove_set_leaves_a_single_entry() {
    harness::setup_tracing();

    let mut builder = MagicBuilder::new(100);
    builder
        .set_property(4338, 25, 8, ModValue::Float(1.0))
        .remove_property(4338, 25, 8)
        .set_property(4338, 25, 8, ModValue::Float(2.0));

    let scoped: Vec<_> = builder
        .modifications()
        .iter()
        .filter(|m| m.group_id == 4338 && m.op_id == 25 && m.prop_id == 8)
        .collect();

    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].kind, ModKind::SetProperty);
    assert_eq!(scoped[0].value, Some(ModValue::Float(2.0)));
}

#[test]
fn add_property_redirects_to_existing_set() {
    let mut builder = MagicBuilder::new(100);
    builder
        .set_property(4338, 25, 8, ModValue::Float(1.0))
        .add_property(4338, 25, 8, ModValue::Float(3.0));

    assert_eq!(builder.len(), 1);
    let m = &builder.modifications()[0];
    assert_eq!(m.kind, ModKind::SetProperty);
    assert_eq!(m.value, Some(ModValue::Float(3.0)));
}

#[test]
fn set_property_updates_existing_injection_in_place() {
    let mut builder = MagicBuilder::new(100);
    builder
        .add_operation(4338, 2493, [(8, ModValue::Float(1.0))], 25)
        .set_property(4338, 2493, 8, ModValue::Float(9.0));

    // Still an injection tied to its parent operation, with the new value.
    let m = find(builder.modifications(), ModKind::AddProperty, 4338, 2493, 8).unwrap();
    assert_eq!(m.value, Some(ModValue::Float(9.0)));
    assert_eq!(m.insert_after_op, 25);
    assert!(find(builder.modifications(), ModKind::SetProperty, 4338, 2493, 8).is_none());
}

#[test]
fn removing_an_operation_cascades() {
    let mut builder = MagicBuilder::new(100);
    builder
        .add_operation(4338, 51, [], -1)
        .add_property(4338, 51, 8, ModValue::Float(1.0))
        .remove_operation(4338, 51);

    let scoped = builder.modifications().iter().filter(|m| m.op_id == 51).count();
    assert_eq!(scoped, 0);
}

#[test]
fn removing_a_source_operation_registers_a_removal() {
    let mut builder = MagicBuilder::new(100);
    builder.remove_operation(4338, 1);

    assert_eq!(builder.len(), 1);
    assert_eq!(builder.modifications()[0].kind, ModKind::RemoveOperation);
}

#[test]
fn removing_a_group_cascades_over_everything() {
    let mut builder = MagicBuilder::new(100);
    builder
        .set_property(4338, 25, 8, ModValue::Float(1.0))
        .add_operation(4338, 51, [(9, ModValue::Int(3))], -1)
        .set_property(7000, 25, 8, ModValue::Float(2.0))
        .remove_operation_group(4338);

    assert!(builder.modifications().iter().all(|m| m.group_id != 4338
        || m.kind == ModKind::RemoveOperationGroup));
    // The other group is untouched.
    assert!(find(builder.modifications(), ModKind::SetProperty, 7000, 25, 8).is_some());
}

#[test]
fn spell_214_scenario_round_trips() {
    let mut builder = MagicBuilder::new(214);
    builder.remove_operation(4338, 1).add_operation(
        4338,
        2493,
        [
            (187, ModValue::Int(2)),
            (8, ModValue::Float(55.0)),
            (2430, ModValue::Vec3([-90.0, 0.0, 0.0])),
            (2593, ModValue::Float(2.0)),
        ],
        -1,
    );

    let json = builder.export_json();

    // The document carries exactly two modifications, properties folded
    // into the injected operation.
    let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
    let entries = doc["Modifications"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["Type"], "RemoveOperation");
    assert_eq!(entries[1]["Type"], "AddOperation");
    assert_eq!(entries[1]["Properties"].as_object().unwrap().len(), 4);

    let mut imported = MagicBuilder::new(214);
    imported.import_json(&json).unwrap();

    assert!(find(imported.modifications(), ModKind::RemoveOperation, 4338, 1, -1).is_some());
    assert!(find(imported.modifications(), ModKind::AddOperation, 4338, 2493, -1).is_some());
    for (prop, value) in [
        (187, ModValue::Int(2)),
        (8, ModValue::Float(55.0)),
        (2430, ModValue::Vec3([-90.0, 0.0, 0.0])),
        (2593, ModValue::Float(2.0)),
    ] {
        let m = find(imported.modifications(), ModKind::AddProperty, 4338, 2493, prop).unwrap();
        assert_eq!(m.value, Some(value), "property {prop}");
    }
}

#[test]
fn export_import_is_idempotent() {
    let mut builder = MagicBuilder::new(100);
    builder
        .set_property(4338, 25, 8, ModValue::Float(1.5))
        .remove_property(4338, 25, 9)
        .add_operation(4338, 51, [(10, ModValue::Bool(true))], 25)
        .remove_operation_group(9000);

    let once = builder.export_json();

    let mut imported = MagicBuilder::new(100);
    imported.import_json(&once).unwrap();
    let twice = imported.export_json();

    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&once).unwrap(),
        serde_json::from_str::<serde_json::Value>(&twice).unwrap()
    );
}

#[test]
fn import_merges_with_conflict_rules() {
    let mut builder = MagicBuilder::new(100);
    builder.remove_property(4338, 25, 8);

    let mut other = MagicBuilder::new(100);
    other.set_property(4338, 25, 8, ModValue::Float(7.0));

    builder.import_json(&other.export_json()).unwrap();

    // The import wins over the pre-existing removal, same as a direct call.
    let scoped: Vec<_> =
        builder.modifications().iter().filter(|m| m.prop_id == 8).collect();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].kind, ModKind::SetProperty);
}

#[test]
fn import_coerces_through_the_type_table() {
    let types = PropertyTypeTable::new();
    types.register(8, ValueKind::Float);
    types.register(187, ValueKind::Int);

    let json = r#"{
        "MagicId": 100,
        "Modifications": [
            { "Type": "SetProperty", "OperationGroupId": 4338, "OperationId": 25,
              "PropertyId": 8, "Value": 55 }
        ]
    }"#;

    let mut builder = MagicBuilder::with_types(100, types);
    builder.import_json(json).unwrap();

    let m = find(builder.modifications(), ModKind::SetProperty, 4338, 25, 8).unwrap();
    assert_eq!(m.value, Some(ModValue::Float(55.0)));
}

#[test]
fn import_with_mismatched_magic_id_proceeds() {
    let mut source = MagicBuilder::new(214);
    source.set_property(4338, 25, 8, ModValue::Float(1.0));

    let mut builder = MagicBuilder::new(999);
    builder.import_json(&source.export_json()).unwrap();

    assert_eq!(builder.len(), 1);
}

#[test]
fn malformed_json_is_an_error() {
    let mut builder = MagicBuilder::new(100);
    assert!(builder.import_json("{ not json").is_err());
    assert!(builder.is_empty());
}

#[test]
fn reset_clears_everything() {
    let mut builder = MagicBuilder::new(100);
    builder.set_property(4338, 25, 8, ModValue::Float(1.0)).reset();
    assert!(builder.is_empty());
}
