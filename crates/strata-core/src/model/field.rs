use crate::{
    domain::{Domain, DomainError, Operator},
    model::EntityId,
    recompute::{ComputeScope, RecomputeError},
    value::{RecordId, Value},
};
use std::{fmt, sync::Arc};

///
/// ComputeHandler
///
/// Batch compute function of a computed field. The handler reads its
/// dependencies and writes the results through the scope; the scheduler owns
/// pending-set bookkeeping around the call.
///

pub type ComputeHandler =
    Arc<dyn Fn(&mut ComputeScope<'_>, &[RecordId]) -> Result<(), RecomputeError>>;

///
/// SearchHandler
///
/// Search function of a non-stored field: rewrites a condition on the field
/// into a domain over stored fields. `Ok(None)` means the operator is not
/// handled, letting the optimizer fall back to the inverse operator.
///

pub type SearchHandler = Arc<dyn Fn(Operator, &Value) -> Result<Option<Domain>, DomainError>>;

///
/// FieldKind
///
/// Runtime type shape used by predicate validation and rewrites.
/// This is a lossy projection of the full schema type system.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Text,
    Date,
    DateTime,
    ManyToOne { comodel: String },
    OneToMany { comodel: String, inverse: String },
    ManyToMany { comodel: String },
}

impl FieldKind {
    #[must_use]
    pub const fn relational(&self) -> bool {
        matches!(
            self,
            Self::ManyToOne { .. } | Self::OneToMany { .. } | Self::ManyToMany { .. }
        )
    }

    #[must_use]
    pub const fn is_x2many(&self) -> bool {
        matches!(self, Self::OneToMany { .. } | Self::ManyToMany { .. })
    }

    #[must_use]
    pub fn comodel(&self) -> Option<&str> {
        match self {
            Self::ManyToOne { comodel }
            | Self::OneToMany { comodel, .. }
            | Self::ManyToMany { comodel } => Some(comodel),
            _ => None,
        }
    }

    /// The value a missing column is read back as, when one exists.
    /// Fields without a falsy value need an explicit not-set check when
    /// negating inequalities.
    #[must_use]
    pub const fn falsy_value(&self) -> Option<Value> {
        match self {
            Self::Bool => Some(Value::Bool(false)),
            _ => None,
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::ManyToOne { .. } => "many2one",
            Self::OneToMany { .. } => "one2many",
            Self::ManyToMany { .. } => "many2many",
        }
    }
}

///
/// FieldModel
///
/// Runtime field metadata used by the optimizer, the cache and the
/// scheduler.
///

#[derive(Clone)]
pub struct FieldModel {
    pub entity: EntityId,
    pub name: String,
    pub kind: FieldKind,
    /// Whether the field is persisted as a column.
    pub stored: bool,
    pub compute: Option<ComputeHandler>,
    pub search: Option<SearchHandler>,
    /// Dot-separated dependency paths of the compute function.
    pub depends: Vec<String>,
    /// Context keys the cached value varies by.
    pub depends_context: Vec<String>,
    /// Whether the field depends on itself through a relation path.
    /// Recursive fields are computed one record at a time.
    pub recursive: bool,
    /// `(parent_field, parent_entity)` when delegated to a parent entity.
    pub inherited: Option<(String, String)>,
}

impl FieldModel {
    #[must_use]
    pub const fn computed(&self) -> bool {
        self.compute.is_some()
    }

    #[must_use]
    pub fn context_dependent(&self) -> bool {
        !self.depends_context.is_empty()
    }
}

impl fmt::Debug for FieldModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldModel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("stored", &self.stored)
            .field("computed", &self.computed())
            .field("recursive", &self.recursive)
            .finish_non_exhaustive()
    }
}

///
/// FieldDef
///
/// Declaration-time field description consumed by the schema builder.
///

pub struct FieldDef {
    pub(crate) name: String,
    pub(crate) kind: FieldKind,
    pub(crate) stored: bool,
    pub(crate) compute: Option<ComputeHandler>,
    pub(crate) search: Option<SearchHandler>,
    pub(crate) depends: Vec<String>,
    pub(crate) depends_context: Vec<String>,
    pub(crate) recursive: bool,
    pub(crate) inherited: Option<(String, String)>,
}

impl FieldDef {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            stored: true,
            compute: None,
            search: None,
            depends: Vec::new(),
            depends_context: Vec::new(),
            recursive: false,
            inherited: None,
        }
    }

    /// Declare the field computed from the given dependency paths.
    #[must_use]
    pub fn computed(mut self, depends: &[&str], handler: ComputeHandler) -> Self {
        self.depends = depends.iter().map(ToString::to_string).collect();
        self.compute = Some(handler);
        self
    }

    #[must_use]
    pub const fn non_stored(mut self) -> Self {
        self.stored = false;
        self
    }

    #[must_use]
    pub fn searchable(mut self, handler: SearchHandler) -> Self {
        self.search = Some(handler);
        self
    }

    #[must_use]
    pub fn context_dependent(mut self, keys: &[&str]) -> Self {
        self.depends_context = keys.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub const fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    #[must_use]
    pub fn inherited_from(
        mut self,
        parent_field: impl Into<String>,
        parent_entity: impl Into<String>,
    ) -> Self {
        self.inherited = Some((parent_field.into(), parent_entity.into()));
        self
    }
}
