use crate::{
    model::{FieldId, SchemaRegistry},
    store::RecordStore,
    txn::Context,
    value::{RecordId, Value},
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error as ThisError;

///
/// CacheMiss
///
/// Expected, recoverable signal distinguishing "no value yet" from a cached
/// falsy value. Callers decide whether to fetch, compute, or escalate.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq, ThisError)]
#[error("no cached value for field {field} on record {record}")]
pub struct CacheMiss {
    pub field: FieldId,
    pub record: RecordId,
}

///
/// ContextKey
///
/// Tuple of the context values a context-dependent field's cache varies by.
/// Context-independent fields (and all dirty entries) live under the
/// canonical empty key.
///

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ContextKey(Vec<Value>);

impl ContextKey {
    pub const CANONICAL: Self = Self(Vec::new());

    /// Derive the key for `field` from the declared context dependencies.
    #[must_use]
    pub fn for_field(registry: &SchemaRegistry, field: FieldId, context: &Context) -> Self {
        let model = registry.field(field);
        if model.depends_context.is_empty() {
            return Self::CANONICAL;
        }
        Self(
            model
                .depends_context
                .iter()
                .map(|key| context.get(key).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }
}

///
/// RecordCache
///
/// Per-transaction record cache, partitioned field-first so the common
/// operations (which records have a value, invalidate one field everywhere)
/// stay cheap: `field -> context-key -> record -> value`.
///
/// Entries whose value differs from the database are *dirty*. Dirty entries
/// always live under the canonical context key: that is the value the next
/// flush writes back.
///

#[derive(Debug, Default)]
pub struct RecordCache {
    data: BTreeMap<FieldId, BTreeMap<ContextKey, BTreeMap<RecordId, Value>>>,
    dirty: BTreeMap<FieldId, BTreeSet<RecordId>>,
}

impl RecordCache {
    /// Cached value for `(field, key, record)`.
    pub fn get(&self, field: FieldId, key: &ContextKey, record: RecordId) -> Result<&Value, CacheMiss> {
        self.data
            .get(&field)
            .and_then(|slots| slots.get(key))
            .and_then(|slot| slot.get(&record))
            .ok_or(CacheMiss { field, record })
    }

    /// Store a value. A clean entry may be promoted to dirty; demoting a
    /// dirty entry through `set` would silently drop a pending database
    /// write, which is a bug in the caller.
    ///
    /// # Panics
    ///
    /// Panics when `dirty` is false and the entry is currently dirty.
    pub fn set(
        &mut self,
        field: FieldId,
        key: &ContextKey,
        record: RecordId,
        value: Value,
        dirty: bool,
    ) {
        let was_dirty = self
            .dirty
            .get(&field)
            .is_some_and(|ids| ids.contains(&record));
        assert!(
            dirty || !was_dirty,
            "inconsistent cache write: field {field} on record {record} is dirty; \
             flush or invalidate before writing a clean value"
        );

        let key = if dirty { &ContextKey::CANONICAL } else { key };
        self.data
            .entry(field)
            .or_default()
            .entry(key.clone())
            .or_default()
            .insert(record, value);
        if dirty {
            self.dirty.entry(field).or_default().insert(record);
        }
    }

    /// Store values for several records at once.
    pub fn update(
        &mut self,
        field: FieldId,
        key: &ContextKey,
        values: impl IntoIterator<Item = (RecordId, Value)>,
        dirty: bool,
    ) {
        for (record, value) in values {
            self.set(field, key, record, value, dirty);
        }
    }

    /// Store a value only if the slot is empty; existing values win.
    pub fn insert_missing(
        &mut self,
        field: FieldId,
        key: &ContextKey,
        record: RecordId,
        value: Value,
    ) {
        let slot = self
            .data
            .entry(field)
            .or_default()
            .entry(key.clone())
            .or_default();
        slot.entry(record).or_insert(value);
    }

    #[must_use]
    pub fn contains(&self, field: FieldId, key: &ContextKey, record: RecordId) -> bool {
        self.get(field, key, record).is_ok()
    }

    /// Whether `field` has a value for at least one record in any context.
    #[must_use]
    pub fn contains_field(&self, field: FieldId) -> bool {
        self.data
            .get(&field)
            .is_some_and(|slots| slots.values().any(|slot| !slot.is_empty()))
    }

    #[must_use]
    pub fn is_dirty(&self, field: FieldId, record: RecordId) -> bool {
        self.dirty
            .get(&field)
            .is_some_and(|ids| ids.contains(&record))
    }

    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.dirty.values().any(|ids| !ids.is_empty())
    }

    /// Fields that currently have dirty records.
    pub fn dirty_fields(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.dirty
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(field, _)| *field)
    }

    /// Make `field` clean everywhere and return the formerly dirty values
    /// (from the canonical slot) for flushing.
    pub fn take_dirty(&mut self, field: FieldId) -> Vec<(RecordId, Value)> {
        let Some(ids) = self.dirty.remove(&field) else {
            return Vec::new();
        };
        let canonical = self
            .data
            .get(&field)
            .and_then(|slots| slots.get(&ContextKey::CANONICAL));
        ids.into_iter()
            .filter_map(|record| {
                canonical
                    .and_then(|slot| slot.get(&record))
                    .map(|value| (record, value.clone()))
            })
            .collect()
    }

    /// Records with a cached value for `field` under the given context.
    #[must_use]
    pub fn records_with_field(&self, field: FieldId, key: &ContextKey) -> BTreeSet<RecordId> {
        self.data
            .get(&field)
            .and_then(|slots| slots.get(key))
            .map(|slot| slot.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Records with a cached value for `field` in any context.
    #[must_use]
    pub fn records_with_field_any_context(&self, field: FieldId) -> BTreeSet<RecordId> {
        self.data
            .get(&field)
            .map(|slots| {
                slots
                    .values()
                    .flat_map(|slot| slot.keys().copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Cached values of `field` for the given records, skipping misses.
    pub fn get_values<'a>(
        &'a self,
        field: FieldId,
        key: &ContextKey,
        records: &'a [RecordId],
    ) -> impl Iterator<Item = &'a Value> {
        let slot = self.data.get(&field).and_then(|slots| slots.get(key));
        records
            .iter()
            .filter_map(move |record| slot.and_then(|slot| slot.get(record)))
    }

    /// Ids among `records` that have no cached value for `field`.
    #[must_use]
    pub fn missing_ids(
        &self,
        field: FieldId,
        key: &ContextKey,
        records: &[RecordId],
    ) -> Vec<RecordId> {
        records
            .iter()
            .copied()
            .filter(|record| !self.contains(field, key, *record))
            .collect()
    }

    /// Invalidate the cache, partially or totally.
    ///
    /// `None` wipes everything; `(field, None)` wipes one field for all
    /// records; `(field, Some(ids))` wipes just those records, in *all*
    /// context variants. Invalidating dirty entries drops pending database
    /// writes; that is allowed but logged as unsafe.
    pub fn invalidate(&mut self, spec: Option<&[(FieldId, Option<&[RecordId]>)]>) {
        let Some(spec) = spec else {
            if self.has_dirty() {
                log::warn!("invalidating the whole cache with dirty entries pending");
            }
            self.data.clear();
            self.dirty.clear();
            return;
        };
        for (field, ids) in spec {
            match ids {
                None => {
                    if self.dirty.get(field).is_some_and(|ids| !ids.is_empty()) {
                        log::warn!("invalidating field {field} with dirty entries pending");
                    }
                    self.data.remove(field);
                    self.dirty.remove(field);
                }
                Some(ids) => {
                    if let Some(dirty) = self.dirty.get_mut(field) {
                        if ids.iter().any(|id| dirty.contains(id)) {
                            log::warn!("invalidating dirty records of field {field}");
                        }
                        for id in *ids {
                            dirty.remove(id);
                        }
                    }
                    if let Some(slots) = self.data.get_mut(field) {
                        for slot in slots.values_mut() {
                            for id in *ids {
                                slot.remove(id);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drop everything, dirty flags included, without warnings. Used when a
    /// failed operation abandons the transaction state.
    pub fn clear(&mut self) {
        self.data.clear();
        self.dirty.clear();
    }

    /// Diagnostic consistency check: compare clean entries of stored,
    /// context-independent fields against the persisted values and log
    /// discrepancies. Never raises; this is a debugging aid, not a
    /// correctness gate.
    pub fn check(&self, registry: &SchemaRegistry, store: &dyn RecordStore) {
        for (field, slots) in &self.data {
            let model = registry.field(*field);
            if !model.stored || model.context_dependent() {
                continue;
            }
            let dirty = self.dirty.get(field);
            for slot in slots.values() {
                let ids: Vec<RecordId> = slot
                    .keys()
                    .copied()
                    .filter(|id| !dirty.is_some_and(|d| d.contains(id)))
                    .collect();
                if ids.is_empty() {
                    continue;
                }
                let fetched = match store.fetch(registry, *field, &ids) {
                    Ok(rows) => rows,
                    Err(err) => {
                        log::warn!("cache check could not fetch {field}: {err}");
                        continue;
                    }
                };
                for (record, persisted) in fetched {
                    if let Some(cached) = slot.get(&record)
                        && *cached != persisted
                        && !(!cached.truthy() && !persisted.truthy())
                    {
                        log::warn!(
                            "invalid cache for field {} on record {record}: \
                             cached {cached}, fetched {persisted}",
                            registry.qualified_name(*field),
                        );
                    }
                }
            }
        }
    }
}

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;

    fn field(id: u32) -> FieldId {
        FieldId(id)
    }

    const KEY: &ContextKey = &ContextKey::CANONICAL;

    #[test]
    fn miss_is_distinct_from_falsy_values() {
        let mut cache = RecordCache::default();
        let record = RecordId(1);

        assert_eq!(
            cache.get(field(1), KEY, record),
            Err(CacheMiss {
                field: field(1),
                record
            })
        );

        cache.set(field(1), KEY, record, Value::Bool(false), false);
        assert_eq!(cache.get(field(1), KEY, record), Ok(&Value::Bool(false)));
    }

    #[test]
    fn clean_entry_can_be_promoted_to_dirty() {
        let mut cache = RecordCache::default();
        let record = RecordId(1);

        cache.set(field(1), KEY, record, Value::Int(1), false);
        assert!(!cache.is_dirty(field(1), record));

        cache.set(field(1), KEY, record, Value::Int(2), true);
        assert!(cache.is_dirty(field(1), record));
    }

    #[test]
    #[should_panic(expected = "inconsistent cache write")]
    fn demoting_a_dirty_entry_panics() {
        let mut cache = RecordCache::default();
        let record = RecordId(1);

        cache.set(field(1), KEY, record, Value::Int(2), true);
        cache.set(field(1), KEY, record, Value::Int(3), false);
    }

    #[test]
    fn invalidate_specific_records_touches_all_contexts() {
        let mut cache = RecordCache::default();
        let other_key = ContextKey(vec![Value::from("fr")]);

        cache.set(field(1), KEY, RecordId(1), Value::Int(1), false);
        cache.set(field(1), &other_key, RecordId(1), Value::Int(2), false);
        cache.set(field(1), KEY, RecordId(2), Value::Int(3), false);

        cache.invalidate(Some(&[(field(1), Some(&[RecordId(1)]))]));
        assert!(!cache.contains(field(1), KEY, RecordId(1)));
        assert!(!cache.contains(field(1), &other_key, RecordId(1)));
        assert!(cache.contains(field(1), KEY, RecordId(2)));
    }

    #[test]
    fn invalidate_whole_field_and_everything() {
        let mut cache = RecordCache::default();
        cache.set(field(1), KEY, RecordId(1), Value::Int(1), false);
        cache.set(field(2), KEY, RecordId(1), Value::Int(2), false);

        cache.invalidate(Some(&[(field(1), None)]));
        assert!(!cache.contains_field(field(1)));
        assert!(cache.contains_field(field(2)));

        cache.invalidate(None);
        assert!(!cache.contains_field(field(2)));
    }

    #[test]
    fn invalidating_dirty_entries_clears_the_flag() {
        let mut cache = RecordCache::default();
        cache.set(field(1), KEY, RecordId(1), Value::Int(1), true);

        cache.invalidate(Some(&[(field(1), Some(&[RecordId(1)]))]));
        assert!(!cache.is_dirty(field(1), RecordId(1)));
        // a clean write is fine again afterwards
        cache.set(field(1), KEY, RecordId(1), Value::Int(5), false);
    }

    #[test]
    fn take_dirty_returns_pending_values_and_cleans() {
        let mut cache = RecordCache::default();
        cache.set(field(1), KEY, RecordId(1), Value::Int(10), true);
        cache.set(field(1), KEY, RecordId(2), Value::Int(20), true);

        let mut pending = cache.take_dirty(field(1));
        pending.sort_by_key(|(record, _)| *record);
        assert_eq!(
            pending,
            vec![
                (RecordId(1), Value::Int(10)),
                (RecordId(2), Value::Int(20)),
            ]
        );
        assert!(!cache.has_dirty());
        // values remain cached, now clean
        assert_eq!(cache.get(field(1), KEY, RecordId(1)), Ok(&Value::Int(10)));
    }

    #[test]
    fn missing_ids_reports_only_absent_records() {
        let mut cache = RecordCache::default();
        cache.set(field(1), KEY, RecordId(1), Value::Int(1), false);

        let missing = cache.missing_ids(field(1), KEY, &[RecordId(1), RecordId(2), RecordId(3)]);
        assert_eq!(missing, vec![RecordId(2), RecordId(3)]);
    }

    #[test]
    fn insert_missing_does_not_overwrite() {
        let mut cache = RecordCache::default();
        cache.set(field(1), KEY, RecordId(1), Value::Int(1), false);
        cache.insert_missing(field(1), KEY, RecordId(1), Value::Int(9));
        cache.insert_missing(field(1), KEY, RecordId(2), Value::Int(9));

        assert_eq!(cache.get(field(1), KEY, RecordId(1)), Ok(&Value::Int(1)));
        assert_eq!(cache.get(field(1), KEY, RecordId(2)), Ok(&Value::Int(9)));
    }

    #[test]
    fn dirty_write_lands_in_canonical_slot() {
        let mut cache = RecordCache::default();
        let lang_key = ContextKey(vec![Value::from("fr")]);

        cache.set(field(1), &lang_key, RecordId(1), Value::Int(7), true);
        assert_eq!(cache.get(field(1), KEY, RecordId(1)), Ok(&Value::Int(7)));
    }
}
