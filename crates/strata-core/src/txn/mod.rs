use crate::{
    cache::{ContextKey, RecordCache},
    model::{FieldId, SchemaRegistry},
    value::{RecordId, Value},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::{Deref, DerefMut},
};

///
/// Context
///
/// Free-form per-environment metadata (current company, language, flags).
/// Context keys feed the cache keys of context-dependent fields.
///

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Context(BTreeMap<String, Value>);

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

///
/// TransactionId
///

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TransactionId(u64);

///
/// Environment
///
/// Lightweight handle into a transaction: the transaction id plus the
/// caller's context. State lives in the manager, not behind backpointers.
///

#[derive(Clone, Debug)]
pub struct Environment {
    pub txn: TransactionId,
    pub context: Context,
}

impl Environment {
    #[must_use]
    pub const fn new(txn: TransactionId, context: Context) -> Self {
        Self { txn, context }
    }

    /// Cache key of `field` under this environment's context.
    #[must_use]
    pub fn cache_key(&self, registry: &SchemaRegistry, field: FieldId) -> ContextKey {
        ContextKey::for_field(registry, field, &self.context)
    }
}

///
/// TransactionManager
///
/// Owns every open transaction; environments resolve their state through
/// it by id.
///

#[derive(Debug, Default)]
pub struct TransactionManager {
    txns: BTreeMap<TransactionId, Transaction>,
    next: u64,
}

impl TransactionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) -> TransactionId {
        self.next += 1;
        let id = TransactionId(self.next);
        self.txns.insert(id, Transaction::new());
        id
    }

    #[must_use]
    pub fn transaction(&mut self, id: TransactionId) -> Option<&mut Transaction> {
        self.txns.get_mut(&id)
    }

    /// Close a transaction and return its final state.
    pub fn end(&mut self, id: TransactionId) -> Option<Transaction> {
        self.txns.remove(&id)
    }
}

///
/// Transaction
///
/// The mutable ORM state of one transaction: the record cache, the pending
/// recomputation sets, and the stack of protected fields. Mutated only by
/// the single active caller; cross-session consistency is the store's
/// transaction isolation.
///

#[derive(Debug, Default)]
pub struct Transaction {
    pub cache: RecordCache,
    pub(crate) tocompute: BTreeMap<FieldId, BTreeSet<RecordId>>,
    protected: Vec<BTreeMap<FieldId, BTreeSet<RecordId>>>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `field` to be computed on the given records.
    pub fn add_to_compute(
        &mut self,
        registry: &SchemaRegistry,
        field: FieldId,
        ids: impl IntoIterator<Item = RecordId>,
    ) {
        let model = registry.field(field);
        debug_assert!(
            model.computed() && model.stored,
            "only stored computed fields are scheduled for recomputation"
        );
        let pending = self.tocompute.entry(field).or_default();
        pending.extend(ids);
        if pending.is_empty() {
            self.tocompute.remove(&field);
        }
    }

    /// Mark `field` as computed on the given records, even when the compute
    /// function produced a fallback value; pending entries must always make
    /// progress.
    pub fn remove_to_compute(
        &mut self,
        field: FieldId,
        ids: impl IntoIterator<Item = RecordId>,
    ) {
        if let Some(pending) = self.tocompute.get_mut(&field) {
            for id in ids {
                pending.remove(&id);
            }
            if pending.is_empty() {
                self.tocompute.remove(&field);
            }
        }
    }

    #[must_use]
    pub fn records_to_compute(&self, field: FieldId) -> BTreeSet<RecordId> {
        self.tocompute.get(&field).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn is_to_compute(&self, field: FieldId, record: RecordId) -> bool {
        self.tocompute
            .get(&field)
            .is_some_and(|ids| ids.contains(&record))
    }

    pub fn fields_to_compute(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.tocompute
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(field, _)| *field)
    }

    #[must_use]
    pub fn has_pending_computations(&self) -> bool {
        self.tocompute.values().any(|ids| !ids.is_empty())
    }

    /// Whether `record` is protected against invalidation or recomputation
    /// of `field`.
    #[must_use]
    pub fn is_protected(&self, field: FieldId, record: RecordId) -> bool {
        self.protected
            .iter()
            .any(|layer| layer.get(&field).is_some_and(|ids| ids.contains(&record)))
    }

    /// Prevent invalidation/recomputation of `fields` on `ids` for the
    /// lifetime of the returned guard. The protection is released on every
    /// exit path, panics included.
    pub fn protecting(&mut self, fields: &[FieldId], ids: &[RecordId]) -> ProtectGuard<'_> {
        let mut layer: BTreeMap<FieldId, BTreeSet<RecordId>> = BTreeMap::new();
        for field in fields {
            layer
                .entry(*field)
                .or_default()
                .extend(ids.iter().copied());
        }
        self.protected.push(layer);
        ProtectGuard { txn: self }
    }

    /// Drop all caches and pending computations, e.g. when recovering from
    /// a failed operation.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.tocompute.clear();
    }
}

///
/// ProtectGuard
///
/// Scope guard for one protection layer. Derefs to the transaction so the
/// protected scope can keep operating on it.
///

pub struct ProtectGuard<'a> {
    txn: &'a mut Transaction,
}

impl Deref for ProtectGuard<'_> {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        self.txn
    }
}

impl DerefMut for ProtectGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.txn
    }
}

impl Drop for ProtectGuard<'_> {
    fn drop(&mut self) {
        self.txn.protected.pop();
    }
}

///
/// TESTS
///
