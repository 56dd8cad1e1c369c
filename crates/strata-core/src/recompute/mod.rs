use crate::{
    MAX_FIXPOINT_ITERATIONS, PREFETCH_MAX,
    cache::{CacheMiss, ContextKey},
    model::{ComputeHandler, FieldId, FieldKind, SchemaRegistry, TriggerTree},
    store::{RecordStore, StoreError},
    txn::{Context, Transaction},
    value::{RecordId, Value},
};
use std::collections::BTreeSet;
use thiserror::Error as ThisError;

///
/// RecomputeError
///

#[derive(Debug, ThisError)]
pub enum RecomputeError {
    /// A compute function failed for one record, after batch isolation. The
    /// record's pending membership has been restored.
    #[error("compute of field {field} failed for record {record}: {message}")]
    ComputeFailed {
        field: FieldId,
        record: RecordId,
        message: String,
    },

    #[error("compute handler error: {message}")]
    Handler { message: String },

    #[error(transparent)]
    CacheMiss(#[from] CacheMiss),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RecomputeError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }
}

///
/// ComputeScope
///
/// What a compute function sees: dependency reads (with fetch-on-miss and
/// recursive recomputation) and result writes for the field being computed.
///

pub struct ComputeScope<'a> {
    pub(crate) txn: &'a mut Transaction,
    pub(crate) registry: &'a SchemaRegistry,
    pub(crate) store: &'a dyn RecordStore,
    pub(crate) context: &'a Context,
    pub(crate) field: FieldId,
}

impl<'a> ComputeScope<'a> {
    #[must_use]
    pub const fn registry(&self) -> &'a SchemaRegistry {
        self.registry
    }

    /// Value of `field` for `record`, computing or fetching it if needed.
    pub fn get(&mut self, field: FieldId, record: RecordId) -> Result<Value, RecomputeError> {
        self.txn
            .fetch_value(self.registry, self.store, self.context, field, record)
    }

    /// Assign the computed value for `record`.
    pub fn set(&mut self, record: RecordId, value: Value) -> Result<(), RecomputeError> {
        self.txn.write_value(
            self.registry,
            self.store,
            self.context,
            self.field,
            record,
            value,
        )
    }

    /// Write some other field as a side effect of the computation. Unlike
    /// [`Self::set`], this goes through the full write path and notifies
    /// dependents unless the target is protected.
    pub fn write(
        &mut self,
        field: FieldId,
        record: RecordId,
        value: Value,
    ) -> Result<(), RecomputeError> {
        self.txn
            .write_value(self.registry, self.store, self.context, field, record, value)
    }
}

impl Transaction {
    /// Notify that `fields` changed on the given records: walk the trigger
    /// tree backward to find every dependent computed field, queue the
    /// stored ones for recomputation and invalidate the others.
    ///
    /// `created` skips the reverse lookups that cannot match a just-created
    /// record. Callers pass `before = true` when notifying *before* the
    /// cache is updated, so reverse traversal still observes the old
    /// relation values.
    pub fn modified(
        &mut self,
        registry: &SchemaRegistry,
        store: &dyn RecordStore,
        context: &Context,
        fields: &[FieldId],
        ids: &[RecordId],
        created: bool,
        before: bool,
    ) -> Result<(), RecomputeError> {
        // the walk below is materialized before any marking happens, so a
        // pre-write notification only differs from a post-write one by the
        // cache/store state it observes at call time
        let _ = before;
        if ids.is_empty() {
            return Ok(());
        }
        let trees: Vec<&TriggerTree> = fields
            .iter()
            .filter_map(|field| registry.trigger_tree(*field))
            .collect();
        if trees.is_empty() {
            return Ok(());
        }
        let select = |field: FieldId| registry.field(field).computed();
        let tree = TriggerTree::merge(trees, &select);
        if tree.is_empty() {
            return Ok(());
        }

        let id_set: BTreeSet<RecordId> = ids.iter().copied().collect();
        let mut actions: Vec<(FieldId, BTreeSet<RecordId>)> = Vec::new();
        self.collect_triggers(registry, store, &tree, id_set, created, &mut actions)?;

        for (field, mut records) in actions {
            records.retain(|id| !self.is_protected(field, *id));
            if records.is_empty() {
                continue;
            }
            let model = registry.field(field);
            let recursive = model.recursive;
            let previously_marked = if recursive {
                if model.stored {
                    self.records_to_compute(field)
                } else {
                    self.cache.records_with_field_any_context(field)
                }
            } else {
                BTreeSet::new()
            };

            if model.stored {
                self.add_to_compute(registry, field, records.iter().copied());
            } else {
                // non-stored computed fields are recomputed on read; just
                // drop the stale values
                let id_list: Vec<RecordId> = records.iter().copied().collect();
                self.cache.invalidate(Some(&[(field, Some(&id_list))]));
            }

            if recursive {
                // propagate through the self-referential dependency, but
                // only for records that were not already scheduled
                let fresh: Vec<RecordId> =
                    records.difference(&previously_marked).copied().collect();
                if !fresh.is_empty() {
                    self.modified(registry, store, context, &[field], &fresh, false, false)?;
                }
            }
        }
        Ok(())
    }

    /// Walk one trigger tree level: node fields apply to `ids` directly,
    /// edges map `ids` backward through the labeled relation.
    fn collect_triggers(
        &self,
        registry: &SchemaRegistry,
        store: &dyn RecordStore,
        tree: &TriggerTree,
        ids: BTreeSet<RecordId>,
        created: bool,
        out: &mut Vec<(FieldId, BTreeSet<RecordId>)>,
    ) -> Result<(), RecomputeError> {
        if ids.is_empty() {
            return Ok(());
        }
        for field in &tree.root {
            out.push((*field, ids.clone()));
        }
        for (label, subtree) in tree.edges() {
            let mapped = match &registry.field(label).kind {
                FieldKind::ManyToOne { .. } if created => {
                    // no existing record can reference a record that did not
                    // exist before this write
                    continue;
                }
                FieldKind::ManyToOne { .. } | FieldKind::ManyToMany { .. } => {
                    store.records_referencing(registry, label, &ids)?
                }
                FieldKind::OneToMany { comodel, inverse } => {
                    let comodel_id = registry
                        .entity_id(comodel)
                        .expect("comodels are validated at build time");
                    let inverse_field = registry
                        .field_id(comodel_id, inverse)
                        .expect("inverses are validated at build time");
                    self.referenced_through(registry, store, inverse_field, &ids)?
                }
                _ => continue,
            };
            self.collect_triggers(registry, store, subtree, mapped, false, out)?;
        }
        Ok(())
    }

    /// Values of a many2one field on `ids` (cache first, store for the
    /// rest), as a set of target records.
    fn referenced_through(
        &self,
        registry: &SchemaRegistry,
        store: &dyn RecordStore,
        relation: FieldId,
        ids: &BTreeSet<RecordId>,
    ) -> Result<BTreeSet<RecordId>, RecomputeError> {
        let mut mapped = BTreeSet::new();
        let mut missing = Vec::new();
        for id in ids {
            match self.cache.get(relation, &ContextKey::CANONICAL, *id) {
                Ok(Value::Id(target)) => {
                    mapped.insert(*target);
                }
                Ok(_) => {}
                Err(_) => missing.push(*id),
            }
        }
        if !missing.is_empty() {
            for (_, value) in store.fetch(registry, relation, &missing)? {
                if let Value::Id(target) = value {
                    mapped.insert(target);
                }
            }
        }
        Ok(mapped)
    }

    /// Write `value` for `(field, record)` through the cache, notifying
    /// dependents. Writes on records protected for `field` (in-progress
    /// computation) update the cache only.
    pub fn write_value(
        &mut self,
        registry: &SchemaRegistry,
        store: &dyn RecordStore,
        context: &Context,
        field: FieldId,
        record: RecordId,
        value: Value,
    ) -> Result<(), RecomputeError> {
        let model = registry.field(field);
        let protected = self.is_protected(field, record);
        if !protected && model.kind.relational() {
            // dependents reading the old relation must be discovered before
            // the relation changes underneath them
            self.modified(registry, store, context, &[field], &[record], false, true)?;
        }

        self.remove_to_compute(field, [record]);
        let key = ContextKey::for_field(registry, field, context);
        self.cache.set(field, &key, record, value, model.stored);

        if !protected {
            self.modified(registry, store, context, &[field], &[record], false, false)?;
        }
        Ok(())
    }

    /// Read `(field, record)`: cached value, pending computation, or
    /// fetch-on-miss from the store.
    pub fn fetch_value(
        &mut self,
        registry: &SchemaRegistry,
        store: &dyn RecordStore,
        context: &Context,
        field: FieldId,
        record: RecordId,
    ) -> Result<Value, RecomputeError> {
        // a pending computation must run before the value can be trusted
        if self.is_to_compute(field, record) && !self.is_protected(field, record) {
            self.recompute_field(registry, store, context, field)?;
        }

        let key = ContextKey::for_field(registry, field, context);
        if let Ok(value) = self.cache.get(field, &key, record) {
            return Ok(value.clone());
        }

        let model = registry.field(field);
        if model.stored {
            for (id, value) in store.fetch(registry, field, &[record])? {
                self.cache.set(field, &key, id, value, false);
            }
            return self
                .cache
                .get(field, &key, record)
                .cloned()
                .map_err(RecomputeError::from);
        }
        if let Some(handler) = model.compute.clone() {
            if self.is_protected(field, record) {
                // re-entrant read during its own computation
                self.cache.set(field, &key, record, Value::Null, false);
                return Ok(Value::Null);
            }
            let entity = model.entity;
            self.compute_batch(registry, store, context, field, entity, &handler, &[record])?;
            // fall back to a null value if the compute assigned nothing, so
            // the read (and the recomputation) always terminates
            if let Ok(value) = self.cache.get(field, &key, record) {
                return Ok(value.clone());
            }
            self.cache.set(field, &key, record, Value::Null, false);
            return Ok(Value::Null);
        }
        Err(CacheMiss { field, record }.into())
    }

    /// Drain every pending computation, in dependency order by
    /// construction of the trigger tree. Bounded; exceeding the cap logs a
    /// warning and leaves the remainder for the next flush.
    pub fn recompute_all(
        &mut self,
        registry: &SchemaRegistry,
        store: &dyn RecordStore,
        context: &Context,
    ) -> Result<(), RecomputeError> {
        for _ in 0..MAX_FIXPOINT_ITERATIONS {
            let fields: Vec<FieldId> = self.fields_to_compute().collect();
            if fields.is_empty() {
                return Ok(());
            }
            for field in fields {
                self.recompute_field(registry, store, context, field)?;
            }
        }
        log::warn!("too many iterations when recomputing fields, likely a dependency cycle");
        Ok(())
    }

    /// Process the pending computations of one field. Recursive fields are
    /// computed one record at a time so self-referential dependencies can
    /// resolve through re-entrant reads.
    pub(crate) fn recompute_field(
        &mut self,
        registry: &SchemaRegistry,
        store: &dyn RecordStore,
        context: &Context,
        field: FieldId,
    ) -> Result<(), RecomputeError> {
        let model = registry.field(field);
        let Some(handler) = model.compute.clone() else {
            // nothing to run; drop the bookkeeping
            self.tocompute.remove(&field);
            return Ok(());
        };
        let entity = model.entity;
        let recursive = model.recursive;

        let snapshot: Vec<RecordId> = self.records_to_compute(field).into_iter().collect();
        if recursive {
            for id in snapshot {
                if self.is_to_compute(field, id) {
                    self.compute_batch(registry, store, context, field, entity, &handler, &[id])?;
                }
            }
        } else {
            for chunk in snapshot.chunks(PREFETCH_MAX) {
                let still_pending: Vec<RecordId> = chunk
                    .iter()
                    .copied()
                    .filter(|id| self.is_to_compute(field, *id))
                    .collect();
                if !still_pending.is_empty() {
                    self.compute_batch(
                        registry,
                        store,
                        context,
                        field,
                        entity,
                        &handler,
                        &still_pending,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Run one compute invocation. Records are marked computed *before* the
    /// handler runs (forward progress even on fallback results), the field
    /// is protected for the duration, and failures restore the pending
    /// membership before isolating the offending record.
    fn compute_batch(
        &mut self,
        registry: &SchemaRegistry,
        store: &dyn RecordStore,
        context: &Context,
        field: FieldId,
        entity: crate::model::EntityId,
        handler: &ComputeHandler,
        ids: &[RecordId],
    ) -> Result<(), RecomputeError> {
        self.remove_to_compute(field, ids.iter().copied());

        let stored = registry.field(field).stored;
        let result = {
            let mut guard = self.protecting(&[field], ids);
            let mut scope = ComputeScope {
                txn: &mut *guard,
                registry,
                store,
                context,
                field,
            };
            handler(&mut scope, ids)
        };

        match result {
            Ok(()) => Ok(()),
            Err(_) if ids.len() > 1 => {
                // restore state, then retry one record at a time to isolate
                // the failure
                if stored {
                    self.add_to_compute(registry, field, ids.iter().copied());
                }
                self.retry_individually(registry, store, context, field, entity, handler, ids)
            }
            Err(err) => {
                let existing = store.exists(registry, entity, ids)?;
                if existing.is_empty() {
                    // the record is gone; its computation is moot
                    Ok(())
                } else {
                    if stored {
                        self.add_to_compute(registry, field, ids.iter().copied());
                    }
                    Err(RecomputeError::ComputeFailed {
                        field,
                        record: ids[0],
                        message: err.to_string(),
                    })
                }
            }
        }
    }

    fn retry_individually(
        &mut self,
        registry: &SchemaRegistry,
        store: &dyn RecordStore,
        context: &Context,
        field: FieldId,
        entity: crate::model::EntityId,
        handler: &ComputeHandler,
        ids: &[RecordId],
    ) -> Result<(), RecomputeError> {
        let stored = registry.field(field).stored;
        let existing = store.exists(registry, entity, ids)?;
        let missing: Vec<RecordId> = ids
            .iter()
            .copied()
            .filter(|id| !existing.contains(id))
            .collect();
        self.remove_to_compute(field, missing);

        let mut failure: Option<RecomputeError> = None;
        for id in ids.iter().copied().filter(|id| existing.contains(id)) {
            self.remove_to_compute(field, [id]);
            let result = {
                let mut guard = self.protecting(&[field], &[id]);
                let mut scope = ComputeScope {
                    txn: &mut *guard,
                    registry,
                    store,
                    context,
                    field,
                };
                handler(&mut scope, &[id])
            };
            if let Err(err) = result {
                // keep the failed record pending: recomputation is
                // at-least-once
                if stored {
                    self.add_to_compute(registry, field, [id]);
                }
                failure.get_or_insert(RecomputeError::ComputeFailed {
                    field,
                    record: id,
                    message: err.to_string(),
                });
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Flush pending computations and dirty cache entries to the store.
    pub fn flush(
        &mut self,
        registry: &SchemaRegistry,
        store: &dyn RecordStore,
        context: &Context,
    ) -> Result<(), RecomputeError> {
        for _ in 0..MAX_FIXPOINT_ITERATIONS {
            self.recompute_all(registry, store, context)?;
            let fields: Vec<FieldId> = self.cache.dirty_fields().collect();
            if fields.is_empty() {
                return Ok(());
            }
            for field in fields {
                let values = self.cache.take_dirty(field);
                if !values.is_empty() {
                    store.persist(registry, field, &values)?;
                }
            }
        }
        log::warn!("too many iterations when flushing fields");
        Ok(())
    }
}

///
/// TESTS
///
