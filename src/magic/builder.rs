//! Mutable, deduplicating modification set for one spell.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error};

use crate::magic::casting::{CastingEngine, SourceSelector, TargetSelector};
use crate::magic::model::{
    GroupId, ImportError, MagicId, ModKind, ModKey, ModValue, Modification, ModificationDoc,
    ModificationJson, OpTypeId, PropertyId, PropertyTypeTable, ANY,
};

/// Accumulates a conflict-resolved set of [`Modification`]s for one spell id
/// and round-trips it through the public JSON document.
///
/// All mutation methods return `&mut Self` for chaining:
///
/// ```
/// use spellhook::magic::{MagicBuilder, ModValue};
///
/// let mut builder = MagicBuilder::new(214);
/// builder
///     .remove_operation(4338, 1)
///     .add_operation(4338, 2493, [(187, ModValue::Int(2))], -1);
/// ```
pub struct MagicBuilder {
    magic_id: MagicId,
    name: String,
    description: String,
    mods: Vec<Modification>,
    types: Arc<PropertyTypeTable>,
}

impl MagicBuilder {
    pub fn new(magic_id: MagicId) -> Self {
        Self::with_types(magic_id, PropertyTypeTable::new())
    }

    /// Builder with a shared property type table for import coercion.
    pub fn with_types(magic_id: MagicId, types: Arc<PropertyTypeTable>) -> Self {
        MagicBuilder {
            magic_id,
            name: String::new(),
            description: String::new(),
            mods: Vec::new(),
            types,
        }
    }

    pub fn magic_id(&self) -> MagicId {
        self.magic_id
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    pub fn description(&mut self, description: impl Into<String>) -> &mut Self {
        self.description = description.into();
        self
    }

    /// The current modification set, in insertion order.
    pub fn modifications(&self) -> &[Modification] {
        &self.mods
    }

    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    fn find(&self, key: ModKey, kind: ModKind) -> Option<usize> {
        self.mods.iter().position(|m| m.kind == kind && m.key() == key)
    }

    fn retract(&mut self, key: ModKey, kind: ModKind) {
        self.mods.retain(|m| !(m.kind == kind && m.key() == key));
    }

    fn property_key(group: GroupId, op: OpTypeId, prop: PropertyId) -> ModKey {
        Modification::new(ModKind::SetProperty, group, op, prop).key()
    }

    fn operation_key(group: GroupId, op: OpTypeId) -> ModKey {
        Modification::new(ModKind::AddOperation, group, op, ANY).key()
    }

    /// Override a property that exists in the source spell data.
    ///
    /// When an `AddProperty` already targets the same key the value is
    /// updated in place instead, so the property stays an injection tied to
    /// its parent operation. Any pending removal of the key is retracted.
    pub fn set_property(
        &mut self,
        group: GroupId,
        op: OpTypeId,
        prop: PropertyId,
        value: ModValue,
    ) -> &mut Self {
        let key = Self::property_key(group, op, prop);
        self.retract(key, ModKind::RemoveProperty);

        if let Some(i) = self.find(key, ModKind::AddProperty) {
            self.mods[i].value = Some(value);
        } else if let Some(i) = self.find(key, ModKind::SetProperty) {
            self.mods[i].value = Some(value);
        } else {
            self.mods
                .push(Modification::new(ModKind::SetProperty, group, op, prop).with_value(value));
        }
        self
    }

    /// Inject a property that does not exist in the source spell data.
    ///
    /// When a `SetProperty` already targets the same key the call redirects
    /// there: a property present in the source file should be overridden,
    /// not injected a second time.
    pub fn add_property(
        &mut self,
        group: GroupId,
        op: OpTypeId,
        prop: PropertyId,
        value: ModValue,
    ) -> &mut Self {
        let key = Self::property_key(group, op, prop);

        if self.find(key, ModKind::SetProperty).is_some() {
            return self.set_property(group, op, prop, value);
        }

        self.retract(key, ModKind::RemoveProperty);

        // Injections surface where their parent operation does.
        let insert_after = self
            .find(Self::operation_key(group, op), ModKind::AddOperation)
            .map(|i| self.mods[i].insert_after_op)
            .unwrap_or(ANY);

        if let Some(i) = self.find(key, ModKind::AddProperty) {
            self.mods[i].value = Some(value);
            self.mods[i].insert_after_op = insert_after;
        } else {
            self.mods.push(
                Modification::new(ModKind::AddProperty, group, op, prop)
                    .with_value(value)
                    .with_insert_after(insert_after),
            );
        }
        self
    }

    /// Suppress a property. Retracts any competing set or injection first.
    pub fn remove_property(
        &mut self,
        group: GroupId,
        op: OpTypeId,
        prop: PropertyId,
    ) -> &mut Self {
        let key = Self::property_key(group, op, prop);
        self.retract(key, ModKind::SetProperty);
        self.retract(key, ModKind::AddProperty);

        if self.find(key, ModKind::RemoveProperty).is_none() {
            self.mods.push(Modification::new(ModKind::RemoveProperty, group, op, prop));
        }
        self
    }

    /// Register an injected operation, with optional initial properties.
    /// `insert_after` names the operation type the injection must follow in
    /// the execution stream, [`ANY`] for the end of the group.
    pub fn add_operation(
        &mut self,
        group: GroupId,
        op: OpTypeId,
        properties: impl IntoIterator<Item = (PropertyId, ModValue)>,
        insert_after: OpTypeId,
    ) -> &mut Self {
        let key = Self::operation_key(group, op);
        self.retract(key, ModKind::RemoveOperation);

        if let Some(i) = self.find(key, ModKind::AddOperation) {
            self.mods[i].insert_after_op = insert_after;
        } else {
            self.mods.push(
                Modification::new(ModKind::AddOperation, group, op, ANY)
                    .with_insert_after(insert_after),
            );
        }

        for (prop, value) in properties {
            self.add_property(group, op, prop, value);
        }
        self
    }

    /// Suppress an operation. Cascades over every property-level entry
    /// scoped to it. Removing an operation that was itself injected simply
    /// cancels the injection; there is nothing in the source data to
    /// suppress.
    pub fn remove_operation(&mut self, group: GroupId, op: OpTypeId) -> &mut Self {
        let key = Self::operation_key(group, op);
        let was_injected = self.find(key, ModKind::AddOperation).is_some();
        self.retract(key, ModKind::AddOperation);
        self.mods
            .retain(|m| !(m.kind.is_property_level() && m.group_id == group && m.op_id == op));

        if !was_injected && self.find(key, ModKind::RemoveOperation).is_none() {
            self.mods.push(Modification::new(ModKind::RemoveOperation, group, op, ANY));
        }
        self
    }

    pub fn add_operation_group(&mut self, group: GroupId) -> &mut Self {
        let key = Modification::new(ModKind::AddOperationGroup, group, ANY, ANY).key();
        self.retract(key, ModKind::RemoveOperationGroup);

        if self.find(key, ModKind::AddOperationGroup).is_none() {
            self.mods.push(Modification::new(ModKind::AddOperationGroup, group, ANY, ANY));
        }
        self
    }

    /// Suppress an operation group. Cascades over everything scoped to it;
    /// removing a group that was itself injected only cancels the injection.
    pub fn remove_operation_group(&mut self, group: GroupId) -> &mut Self {
        let key = Modification::new(ModKind::AddOperationGroup, group, ANY, ANY).key();
        let was_injected = self.find(key, ModKind::AddOperationGroup).is_some();
        self.mods.retain(|m| m.group_id != group);

        if !was_injected {
            self.mods.push(Modification::new(ModKind::RemoveOperationGroup, group, ANY, ANY));
        }
        self
    }

    pub fn reset(&mut self) -> &mut Self {
        self.mods.clear();
        self
    }

    /// Hand the current set to the casting engine for an immediate,
    /// ephemeral cast. Returns whether the invocation was submitted.
    pub fn cast(
        &self,
        engine: &CastingEngine,
        source: SourceSelector,
        target: TargetSelector,
    ) -> bool {
        match engine.cast(self.magic_id, &self.mods, source, target) {
            Ok(()) => true,
            Err(e) => {
                error!("cast of spell {} failed: {e}", self.magic_id);
                false
            },
        }
    }

    /// Export the set as the public JSON document.
    ///
    /// Properties injected under an injected operation fold into that
    /// operation's `Properties` map, which keeps documents for hand editing
    /// close to the spell file's own shape.
    pub fn export_json(&self) -> String {
        let mut out = Vec::new();

        for m in &self.mods {
            match m.kind {
                ModKind::AddProperty
                    if self
                        .find(Self::operation_key(m.group_id, m.op_id), ModKind::AddOperation)
                        .is_some() => {},
                ModKind::AddOperation => {
                    let properties: BTreeMap<String, serde_json::Value> = self
                        .mods
                        .iter()
                        .filter(|p| {
                            p.kind == ModKind::AddProperty
                                && p.group_id == m.group_id
                                && p.op_id == m.op_id
                        })
                        .filter_map(|p| {
                            Some((p.prop_id.to_string(), p.value?.to_json()))
                        })
                        .collect();

                    out.push(ModificationJson {
                        kind: ModKind::AddOperation,
                        operation_group_id: m.group_id,
                        operation_id: Some(m.op_id),
                        property_id: None,
                        value: None,
                        properties: (!properties.is_empty()).then_some(properties),
                        insert_after_operation_type_id: Some(m.insert_after_op),
                    });
                },
                _ => out.push(ModificationJson {
                    kind: m.kind,
                    operation_group_id: m.group_id,
                    operation_id: (m.op_id != ANY).then_some(m.op_id),
                    property_id: (m.prop_id != ANY).then_some(m.prop_id),
                    value: m.value.map(ModValue::to_json),
                    properties: None,
                    insert_after_operation_type_id: (m.kind == ModKind::AddProperty)
                        .then_some(m.insert_after_op),
                }),
            }
        }

        ModificationDoc {
            magic_id: self.magic_id,
            name: self.name.clone(),
            description: self.description.clone(),
            modifications: out,
        }
        .to_json()
    }

    pub fn export_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.export_json())
    }

    /// Merge a JSON document into the current set, using the same conflict
    /// rules as the direct mutation calls. Values coerce to the statically
    /// known kind of their property id when the type table has one.
    pub fn import_json(&mut self, text: &str) -> Result<&mut Self, ImportError> {
        let doc = ModificationDoc::from_json(text)?;
        doc.check_magic_id(self.magic_id);

        if !doc.name.is_empty() {
            self.name = doc.name.clone();
        }
        if !doc.description.is_empty() {
            self.description = doc.description.clone();
        }

        for (index, m) in doc.modifications.iter().enumerate() {
            let group = m.operation_group_id;
            let op = m.operation_id.unwrap_or(ANY);
            let prop = m.property_id.unwrap_or(ANY);

            match m.kind {
                ModKind::SetProperty => {
                    let value = decode_value(&self.types, m, prop, index)?;
                    self.set_property(group, op, prop, value);
                },
                ModKind::AddProperty => {
                    let value = decode_value(&self.types, m, prop, index)?;
                    self.add_property(group, op, prop, value);
                },
                ModKind::RemoveProperty => {
                    self.remove_property(group, op, prop);
                },
                ModKind::AddOperation => {
                    let mut properties = Vec::new();
                    for (k, v) in m.properties.iter().flatten() {
                        let prop: PropertyId = k.parse().map_err(|_| ImportError::BadValue {
                            index,
                        })?;
                        let value = ModValue::from_json(v, self.types.kind_of(prop))
                            .ok_or(ImportError::BadValue { index })?;
                        properties.push((prop, value));
                    }
                    self.add_operation(
                        group,
                        op,
                        properties,
                        m.insert_after_operation_type_id.unwrap_or(ANY),
                    );
                },
                ModKind::RemoveOperation => {
                    self.remove_operation(group, op);
                },
                ModKind::AddOperationGroup => {
                    self.add_operation_group(group);
                },
                ModKind::RemoveOperationGroup => {
                    self.remove_operation_group(group);
                },
            }
        }

        debug!(
            "imported {} modifications into spell {}",
            doc.modifications.len(),
            self.magic_id
        );
        Ok(self)
    }

    pub fn import_file(&mut self, path: impl AsRef<Path>) -> Result<&mut Self, ImportError> {
        let text = std::fs::read_to_string(path)?;
        self.import_json(&text)
    }
}

fn decode_value(
    types: &PropertyTypeTable,
    m: &ModificationJson,
    prop: PropertyId,
    index: usize,
) -> Result<ModValue, ImportError> {
    let raw = m.value.as_ref().ok_or(ImportError::BadValue { index })?;
    ModValue::from_json(raw, types.kind_of(prop)).ok_or(ImportError::BadValue { index })
}
