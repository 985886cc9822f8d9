//! Normalized cache store with optimistic layers.
//!
//! The base holds authoritative data. Optimistic layers sit on top in
//! creation order; reads resolve from the newest layer down to the base.
//! A layer slot either holds a value or a tombstone hiding lower data.
//!
//! ```text
//!   layer 2   [title = "Draft"]          ← read sees "Draft"
//!   layer 1   [body  = <evicted>]        ← read sees body as absent
//!   base      [title = "Old", body = ..]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use sieve_core::{read_ref, FieldKey, ObjectKey, RefValue, StorageError};
use tracing::debug;
use uuid::Uuid;

use super::snapshot::{CacheSnapshot, Location};

/// Field key → stored value.
pub type FieldMap = BTreeMap<FieldKey, Value>;

/// Flat cache contents: root entries and object entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheData {
    pub roots: FieldMap,
    pub objects: BTreeMap<ObjectKey, FieldMap>,
}

impl CacheData {
    fn fields(&self, location: &Location) -> Option<&FieldMap> {
        match location {
            Location::Root => Some(&self.roots),
            Location::Object(key) => self.objects.get(key),
        }
    }

    fn fields_mut(&mut self, location: &Location) -> &mut FieldMap {
        match location {
            Location::Root => &mut self.roots,
            Location::Object(key) => self.objects.entry(key.clone()).or_default(),
        }
    }

    /// Stored references that do not resolve to an object entry.
    pub fn dangling_refs(&self) -> Vec<ObjectKey> {
        let mut dangling = BTreeSet::new();
        let maps = std::iter::once(&self.roots).chain(self.objects.values());
        for map in maps {
            for value in map.values() {
                collect_refs(value, &mut |key| {
                    if !self.objects.contains_key(key) {
                        dangling.insert(key.clone());
                    }
                });
            }
        }
        dangling.into_iter().collect()
    }
}

/// Identifier of an optimistic layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(Uuid);

impl LayerId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a transaction writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Base,
    /// Created on first use, on top of existing layers.
    Optimistic(LayerId),
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Value(Value),
    Evicted,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct FieldDelta {
    /// Hides everything below this layer for the location.
    evicted: bool,
    fields: BTreeMap<FieldKey, Slot>,
}

#[derive(Debug, Clone)]
struct OptimisticLayer {
    id: LayerId,
    roots: FieldDelta,
    objects: BTreeMap<ObjectKey, FieldDelta>,
}

impl OptimisticLayer {
    fn delta(&self, location: &Location) -> Option<&FieldDelta> {
        match location {
            Location::Root => Some(&self.roots),
            Location::Object(key) => self.objects.get(key),
        }
    }

    fn delta_mut(&mut self, location: &Location) -> &mut FieldDelta {
        match location {
            Location::Root => &mut self.roots,
            Location::Object(key) => self.objects.entry(key.clone()).or_default(),
        }
    }
}

/// Cache state: authoritative base plus optimistic layers.
#[derive(Debug, Clone, Default)]
pub struct NormalizedCache {
    base: CacheData,
    layers: Vec<OptimisticLayer>,
}

impl NormalizedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative data only.
    pub fn base(&self) -> &CacheData {
        &self.base
    }

    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.layers.iter().map(|l| l.id).collect()
    }

    /// Resolve every layer into one flat view.
    pub fn flatten(&self) -> CacheData {
        let mut flat = CacheData {
            roots: self.resolved_fields(&Location::Root),
            objects: BTreeMap::new(),
        };
        let mut keys: BTreeSet<ObjectKey> = self.base.objects.keys().cloned().collect();
        for layer in &self.layers {
            keys.extend(layer.objects.keys().cloned());
        }
        for key in keys {
            let fields = self.resolved_fields(&Location::Object(key.clone()));
            if !fields.is_empty() {
                flat.objects.insert(key, fields);
            }
        }
        flat
    }

    fn resolved_fields(&self, location: &Location) -> FieldMap {
        let mut fields = self.base.fields(location).cloned().unwrap_or_default();
        for layer in &self.layers {
            if let Some(delta) = layer.delta(location) {
                if delta.evicted {
                    fields.clear();
                }
                for (key, slot) in &delta.fields {
                    match slot {
                        Slot::Value(value) => {
                            fields.insert(key.clone(), value.clone());
                        }
                        Slot::Evicted => {
                            fields.remove(key);
                        }
                    }
                }
            }
        }
        fields
    }

    fn ensure_layer(&mut self, id: LayerId) -> &mut OptimisticLayer {
        let index = match self.layers.iter().position(|l| l.id == id) {
            Some(index) => index,
            None => {
                debug!(layer = %id, "Optimistic layer created");
                self.layers.push(OptimisticLayer {
                    id,
                    roots: FieldDelta::default(),
                    objects: BTreeMap::new(),
                });
                self.layers.len() - 1
            }
        };
        &mut self.layers[index]
    }

    /// Drop an optimistic layer. Returns false if it did not exist.
    pub fn remove_layer(&mut self, id: LayerId) -> bool {
        let before = self.layers.len();
        self.layers.retain(|l| l.id != id);
        let removed = self.layers.len() != before;
        if removed {
            debug!(layer = %id, "Optimistic layer removed");
        }
        removed
    }
}

impl CacheSnapshot for NormalizedCache {
    fn field(&self, location: &Location, key: &FieldKey) -> Option<Value> {
        for layer in self.layers.iter().rev() {
            if let Some(delta) = layer.delta(location) {
                match delta.fields.get(key) {
                    Some(Slot::Value(value)) => return Some(value.clone()),
                    Some(Slot::Evicted) => return None,
                    None if delta.evicted => return None,
                    None => {}
                }
            }
        }
        self.base.fields(location)?.get(key).cloned()
    }

    fn field_keys(&self, location: &Location) -> Vec<FieldKey> {
        self.resolved_fields(location).into_keys().collect()
    }
}

/// Mutable access to the cache for one write target.
///
/// Reads see the fully layered view; writes land on the target only.
pub struct CacheTransaction<'a> {
    cache: &'a mut NormalizedCache,
    target: WriteTarget,
}

impl<'a> CacheTransaction<'a> {
    pub fn new(cache: &'a mut NormalizedCache, target: WriteTarget) -> Self {
        if let WriteTarget::Optimistic(id) = target {
            cache.ensure_layer(id);
        }
        Self { cache, target }
    }

    pub fn target(&self) -> WriteTarget {
        self.target
    }

    /// Drop an optimistic layer as part of this transaction.
    pub fn remove_layer(&mut self, id: LayerId) -> bool {
        self.cache.remove_layer(id)
    }

    /// Store a value.
    pub fn write_field(&mut self, location: &Location, key: FieldKey, value: Value) {
        match self.target {
            WriteTarget::Base => {
                self.cache.base.fields_mut(location).insert(key, value);
            }
            WriteTarget::Optimistic(id) => {
                self.cache
                    .ensure_layer(id)
                    .delta_mut(location)
                    .fields
                    .insert(key, Slot::Value(value));
            }
        }
    }

    /// Remove one field. Returns true if a value was visible before.
    ///
    /// Evicting the last field of an object drops the object, and every
    /// reference to it goes with it.
    pub fn evict_field(&mut self, location: &Location, key: &FieldKey) -> bool {
        let existed = self.cache.field(location, key).is_some();
        match self.target {
            WriteTarget::Base => {
                if let Some(fields) = match location {
                    Location::Root => Some(&mut self.cache.base.roots),
                    Location::Object(object) => self.cache.base.objects.get_mut(object),
                } {
                    fields.remove(key);
                }
                if let Location::Object(object) = location {
                    if self.cache.base.objects.get(object).is_some_and(|f| f.is_empty()) {
                        self.cache.base.objects.remove(object);
                    }
                }
            }
            WriteTarget::Optimistic(id) => {
                self.cache
                    .ensure_layer(id)
                    .delta_mut(location)
                    .fields
                    .insert(key.clone(), Slot::Evicted);
            }
        }
        if let Location::Object(object) = location {
            if existed && !self.cache.has_object(object) {
                debug!(object = %object, "Object emptied by eviction");
                self.strip_references(object);
            }
        }
        existed
    }

    /// Remove a whole object entry and every reference to it.
    ///
    /// Fields holding a single reference to the object become absent; lists
    /// and embedded maps lose the matching entries.
    pub fn evict_object(&mut self, object: &ObjectKey) -> bool {
        let location = Location::Object(object.clone());
        let existed = self.cache.has_object(object);

        match self.target {
            WriteTarget::Base => {
                self.cache.base.objects.remove(object);
            }
            WriteTarget::Optimistic(id) => {
                let delta = self.cache.ensure_layer(id).delta_mut(&location);
                delta.evicted = true;
                delta.fields.clear();
            }
        }
        self.strip_references(object);
        existed
    }

    fn strip_references(&mut self, object: &ObjectKey) {
        let flat = self.cache.flatten();
        let mut fields = flat.roots.into_keys().map(|key| (Location::Root, key)).collect::<Vec<_>>();
        for (owner, map) in flat.objects {
            fields.extend(map.into_keys().map(|key| (Location::Object(owner.clone()), key)));
        }
        // Stripping may cascade into other evictions, so re-read each value.
        for (location, key) in fields {
            let Some(value) = self.cache.field(&location, &key) else {
                continue;
            };
            match strip_ref(&value, object) {
                Stripped::Untouched => {}
                Stripped::Removed => {
                    self.evict_field(&location, &key);
                }
                Stripped::Replaced(value) => self.write_field(&location, key, value),
            }
        }
    }
}

impl CacheSnapshot for CacheTransaction<'_> {
    fn field(&self, location: &Location, key: &FieldKey) -> Option<Value> {
        self.cache.field(location, key)
    }

    fn field_keys(&self, location: &Location) -> Vec<FieldKey> {
        self.cache.field_keys(location)
    }
}

enum Stripped {
    Untouched,
    Removed,
    Replaced(Value),
}

fn strip_ref(value: &Value, object: &ObjectKey) -> Stripped {
    match read_ref(value) {
        RefValue::Ref(key) if &key == object => return Stripped::Removed,
        RefValue::Ref(_) | RefValue::Malformed => return Stripped::Untouched,
        RefValue::NotRef => {}
    }
    match value {
        Value::Array(items) => {
            let mut changed = false;
            let mut kept = Vec::with_capacity(items.len());
            for item in items {
                match strip_ref(item, object) {
                    Stripped::Untouched => kept.push(item.clone()),
                    Stripped::Removed => changed = true,
                    Stripped::Replaced(item) => {
                        changed = true;
                        kept.push(item);
                    }
                }
            }
            if changed {
                Stripped::Replaced(Value::Array(kept))
            } else {
                Stripped::Untouched
            }
        }
        Value::Object(map) => {
            let mut changed = false;
            let mut kept = serde_json::Map::new();
            for (name, item) in map {
                match strip_ref(item, object) {
                    Stripped::Untouched => {
                        kept.insert(name.clone(), item.clone());
                    }
                    Stripped::Removed => changed = true,
                    Stripped::Replaced(item) => {
                        changed = true;
                        kept.insert(name.clone(), item);
                    }
                }
            }
            if changed {
                Stripped::Replaced(Value::Object(kept))
            } else {
                Stripped::Untouched
            }
        }
        _ => Stripped::Untouched,
    }
}

fn collect_refs(value: &Value, visit: &mut impl FnMut(&ObjectKey)) {
    match read_ref(value) {
        RefValue::Ref(key) => visit(&key),
        RefValue::Malformed => {}
        RefValue::NotRef => match value {
            Value::Array(items) => items.iter().for_each(|item| collect_refs(item, visit)),
            Value::Object(map) => map.values().for_each(|item| collect_refs(item, visit)),
            _ => {}
        },
    }
}

/// Shared handle to a normalized cache.
///
/// Cheap to clone; clones share state. Lock guards are never held across
/// an `.await`.
#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    inner: Arc<RwLock<NormalizedCache>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the current layered state.
    pub fn read<R>(&self, f: impl FnOnce(&NormalizedCache) -> R) -> Result<R, StorageError> {
        let cache = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(f(&cache))
    }

    /// Run `f` with write access for `target`.
    pub fn transact<R>(
        &self,
        target: WriteTarget,
        f: impl FnOnce(&mut CacheTransaction<'_>) -> R,
    ) -> Result<R, StorageError> {
        let mut cache = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut tx = CacheTransaction::new(&mut cache, target);
        Ok(f(&mut tx))
    }

    /// Roll back an optimistic layer. Returns false if it was already gone.
    pub fn remove_layer(&self, id: LayerId) -> Result<bool, StorageError> {
        let mut cache = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(cache.remove_layer(id))
    }

    /// Flat copy of the layered state.
    pub fn flatten(&self) -> Result<CacheData, StorageError> {
        self.read(NormalizedCache::flatten)
    }

    /// Drop every entry and layer.
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut cache = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        *cache = NormalizedCache::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use sieve_core::make_ref;

    fn post() -> ObjectKey {
        ObjectKey::new("Post", "5")
    }

    fn seed(store: &CacheStore) {
        store
            .transact(WriteTarget::Base, |tx| {
                let post_loc = Location::Object(post());
                tx.write_field(&post_loc, FieldKey::new("title"), json!("Old"));
                tx.write_field(&post_loc, FieldKey::new("body"), json!("Text"));
                tx.write_field(&Location::Root, FieldKey::new("featured"), make_ref(&post()));
                tx.write_field(
                    &Location::Root,
                    FieldKey::new("posts"),
                    json!([make_ref(&post()), make_ref(&ObjectKey::new("Post", "6"))]),
                );
                tx.write_field(
                    &Location::Object(ObjectKey::new("Post", "6")),
                    FieldKey::new("title"),
                    json!("Other"),
                );
            })
            .unwrap();
    }

    #[test]
    fn test_null_is_present_absence_is_not() {
        let store = CacheStore::new();
        store
            .transact(WriteTarget::Base, |tx| {
                tx.write_field(&Location::Root, FieldKey::new("me"), Value::Null)
            })
            .unwrap();

        store
            .read(|cache| {
                assert_eq!(cache.root_field(&FieldKey::new("me")), Some(Value::Null));
                assert_eq!(cache.root_field(&FieldKey::new("you")), None);
            })
            .unwrap();
    }

    #[test]
    fn test_optimistic_layer_shadows_and_rolls_back() {
        let store = CacheStore::new();
        seed(&store);
        let layer = LayerId::new();

        store
            .transact(WriteTarget::Optimistic(layer), |tx| {
                tx.write_field(&Location::Object(post()), FieldKey::new("title"), json!("Draft"));
                tx.evict_field(&Location::Object(post()), &FieldKey::new("body"));
            })
            .unwrap();

        store
            .read(|cache| {
                assert_eq!(cache.object_field(&post(), &FieldKey::new("title")), Some(json!("Draft")));
                assert_eq!(cache.object_field(&post(), &FieldKey::new("body")), None);
                assert_eq!(
                    cache.base().objects[&post()][&FieldKey::new("title")],
                    json!("Old")
                );
            })
            .unwrap();

        assert!(store.remove_layer(layer).unwrap());
        assert!(!store.remove_layer(layer).unwrap());
        store
            .read(|cache| {
                assert_eq!(cache.object_field(&post(), &FieldKey::new("title")), Some(json!("Old")));
                assert_eq!(cache.object_field(&post(), &FieldKey::new("body")), Some(json!("Text")));
            })
            .unwrap();
    }

    #[test]
    fn test_evict_object_removes_references() {
        let store = CacheStore::new();
        seed(&store);

        let existed = store
            .transact(WriteTarget::Base, |tx| tx.evict_object(&post()))
            .unwrap();
        assert!(existed);

        let flat = store.flatten().unwrap();
        assert!(!flat.objects.contains_key(&post()));
        assert!(!flat.roots.contains_key(&FieldKey::new("featured")));
        assert_eq!(
            flat.roots[&FieldKey::new("posts")],
            json!([make_ref(&ObjectKey::new("Post", "6"))])
        );
        assert!(flat.dangling_refs().is_empty());
    }

    #[test]
    fn test_evict_object_in_layer_keeps_base() {
        let store = CacheStore::new();
        seed(&store);
        let layer = LayerId::new();

        store
            .transact(WriteTarget::Optimistic(layer), |tx| tx.evict_object(&post()))
            .unwrap();
        store
            .read(|cache| {
                assert!(!cache.has_object(&post()));
                assert!(cache.base().objects.contains_key(&post()));
            })
            .unwrap();
        assert!(store.flatten().unwrap().dangling_refs().is_empty());

        store.remove_layer(layer).unwrap();
        store.read(|cache| assert!(cache.has_object(&post()))).unwrap();
    }

    #[test]
    fn test_evicting_last_field_removes_object() {
        let store = CacheStore::new();
        store
            .transact(WriteTarget::Base, |tx| {
                let user = Location::Object(ObjectKey::new("User", "1"));
                tx.write_field(&user, FieldKey::new("name"), json!("Ann"));
                assert!(tx.evict_field(&user, &FieldKey::new("name")));
                assert!(!tx.evict_field(&user, &FieldKey::new("name")));
            })
            .unwrap();
        assert!(store.flatten().unwrap().objects.is_empty());
    }

    #[test]
    fn test_emptied_object_loses_its_references() {
        let user = ObjectKey::new("User", "1");
        let store = CacheStore::new();
        store
            .transact(WriteTarget::Base, |tx| {
                let loc = Location::Object(user.clone());
                tx.write_field(&loc, FieldKey::new("__typename"), json!("User"));
                tx.write_field(&loc, FieldKey::new("id"), json!("1"));
                tx.write_field(&Location::Root, FieldKey::new("me"), make_ref(&user));
                tx.evict_field(&loc, &FieldKey::new("__typename"));
                tx.evict_field(&loc, &FieldKey::new("id"));
            })
            .unwrap();

        let flat = store.flatten().unwrap();
        assert!(!flat.roots.contains_key(&FieldKey::new("me")));
        assert!(flat.dangling_refs().is_empty());
    }

    #[test]
    fn test_emptied_object_in_layer_loses_its_references() {
        let user = ObjectKey::new("User", "1");
        let store = CacheStore::new();
        store
            .transact(WriteTarget::Base, |tx| {
                tx.write_field(&Location::Object(user.clone()), FieldKey::new("name"), json!("Ann"));
                tx.write_field(&Location::Root, FieldKey::new("me"), make_ref(&user));
            })
            .unwrap();
        let layer = LayerId::new();
        store
            .transact(WriteTarget::Optimistic(layer), |tx| {
                tx.evict_field(&Location::Object(user.clone()), &FieldKey::new("name"));
            })
            .unwrap();
        assert!(store.flatten().unwrap().dangling_refs().is_empty());

        store.remove_layer(layer).unwrap();
        store
            .read(|c| assert_eq!(c.root_field(&FieldKey::new("me")), Some(make_ref(&user))))
            .unwrap();
    }

    #[test]
    fn test_evict_object_strips_nested_references() {
        let user = ObjectKey::new("User", "1");
        let other = ObjectKey::new("User", "2");
        let store = CacheStore::new();
        store
            .transact(WriteTarget::Base, |tx| {
                tx.write_field(&Location::Object(user.clone()), FieldKey::new("name"), json!("Ann"));
                tx.write_field(&Location::Object(other.clone()), FieldKey::new("name"), json!("Bo"));
                tx.write_field(&Location::Root, FieldKey::new("feed"), json!({"top": make_ref(&user)}));
                tx.write_field(
                    &Location::Root,
                    FieldKey::new("pages"),
                    json!([[make_ref(&user), make_ref(&other)], {"owner": make_ref(&user), "size": 2}]),
                );
            })
            .unwrap();

        store
            .transact(WriteTarget::Base, |tx| tx.evict_object(&user))
            .unwrap();

        let flat = store.flatten().unwrap();
        assert_eq!(flat.roots[&FieldKey::new("feed")], json!({}));
        assert_eq!(
            flat.roots[&FieldKey::new("pages")],
            json!([[make_ref(&other)], {"size": 2}])
        );
        assert!(flat.dangling_refs().is_empty());
    }

    #[test]
    fn test_eviction_cascades_through_emptied_owners() {
        let a = ObjectKey::new("Node", "a");
        let b = ObjectKey::new("Node", "b");
        let c = ObjectKey::new("Node", "c");
        let store = CacheStore::new();
        store
            .transact(WriteTarget::Base, |tx| {
                tx.write_field(&Location::Object(a.clone()), FieldKey::new("next"), make_ref(&b));
                tx.write_field(&Location::Object(b.clone()), FieldKey::new("label"), json!("b"));
                tx.write_field(
                    &Location::Object(c.clone()),
                    FieldKey::new("links"),
                    json!([make_ref(&a), make_ref(&b)]),
                );
            })
            .unwrap();

        store.transact(WriteTarget::Base, |tx| tx.evict_object(&b)).unwrap();

        let flat = store.flatten().unwrap();
        assert!(!flat.objects.contains_key(&a));
        assert_eq!(flat.objects[&c][&FieldKey::new("links")], json!([]));
        assert!(flat.dangling_refs().is_empty());
    }

    #[test]
    fn test_layers_resolve_newest_first() {
        let store = CacheStore::new();
        let first = LayerId::new();
        let second = LayerId::new();
        let key = FieldKey::new("count");

        store
            .transact(WriteTarget::Optimistic(first), |tx| {
                tx.write_field(&Location::Root, key.clone(), json!(1))
            })
            .unwrap();
        store
            .transact(WriteTarget::Optimistic(second), |tx| {
                tx.write_field(&Location::Root, key.clone(), json!(2))
            })
            .unwrap();
        // Writing to an existing layer does not reorder it.
        store
            .transact(WriteTarget::Optimistic(first), |tx| {
                tx.write_field(&Location::Root, key.clone(), json!(3))
            })
            .unwrap();

        store.read(|c| assert_eq!(c.root_field(&key), Some(json!(2)))).unwrap();
        store.remove_layer(second).unwrap();
        store.read(|c| assert_eq!(c.root_field(&key), Some(json!(3)))).unwrap();
        assert_eq!(store.read(|c| c.layer_ids()).unwrap(), vec![first]);
    }

    proptest! {
        #[test]
        fn prop_removing_layer_restores_base(
            writes in prop::collection::vec(("[a-d]", 0i64..100, any::<bool>()), 0..20)
        ) {
            let store = CacheStore::new();
            seed(&store);
            let before = store.flatten().unwrap();

            let layer = LayerId::new();
            store.transact(WriteTarget::Optimistic(layer), |tx| {
                for (name, value, evict) in &writes {
                    let loc = Location::Object(post());
                    if *evict {
                        tx.evict_field(&loc, &FieldKey::new(name.as_str()));
                    } else {
                        tx.write_field(&loc, FieldKey::new(name.as_str()), json!(value));
                    }
                }
            }).unwrap();

            store.remove_layer(layer).unwrap();
            prop_assert_eq!(store.flatten().unwrap(), before);
        }
    }
}
