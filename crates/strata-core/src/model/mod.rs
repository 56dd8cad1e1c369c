pub mod entity;
pub mod field;
pub mod registry;
pub mod trigger;

pub use entity::EntityModel;
pub use field::{ComputeHandler, FieldDef, FieldKind, FieldModel, SearchHandler};
pub use registry::{EntityBuilder, SchemaBuilder, SchemaError, SchemaRegistry};
pub use trigger::TriggerTree;

use derive_more::Display;

///
/// EntityId
///
/// Dense handle assigned by the schema builder. Only meaningful together
/// with the registry that produced it.
///

#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EntityId(pub(crate) u32);

impl EntityId {
    #[must_use]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

///
/// FieldId
///

#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FieldId(pub(crate) u32);

impl FieldId {
    #[must_use]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}
