use crate::model::FieldId;
use std::collections::BTreeMap;

///
/// EntityModel
///
/// Runtime entity metadata: the field namespace plus the hierarchy
/// configuration used by `parent_of`/`child_of` resolution.
///

#[derive(Clone, Debug)]
pub struct EntityModel {
    pub name: String,
    /// Name of the relation that points to the parent record.
    pub parent_field: String,
    /// Stored text field holding the materialized ancestor path, when the
    /// entity maintains one.
    pub parent_path_field: Option<FieldId>,
    pub(crate) fields: BTreeMap<String, FieldId>,
}

impl EntityModel {
    #[must_use]
    pub fn field_id(&self, name: &str) -> Option<FieldId> {
        self.fields.get(name).copied()
    }

    pub fn field_ids(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.fields.values().copied()
    }
}
