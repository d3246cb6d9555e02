use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use datafront_common::{EntityId, EntityKind, Fields};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::observers::{ObserverId, Observers};

/// Address of one entity: its namespace and id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(kind: impl Into<EntityKind>, id: impl Into<EntityId>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Canonical copy of one server entity.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    id: EntityId,
    fields: Fields,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, fields: Fields) -> Self {
        let mut entity = Self {
            id: id.into(),
            fields: Fields::new(),
        };
        entity.merge(fields);
        entity
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Shallow field-level merge. Fields absent from `fields` keep their
    /// value; the `id` field is never overwritten. Returns the names of the
    /// fields whose value actually changed.
    pub fn merge(&mut self, fields: Fields) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, value) in fields {
            if name == "id" {
                continue;
            }
            if self.fields.get(&name) != Some(&value) {
                self.fields.insert(name.clone(), value);
                changed.push(name);
            }
        }
        changed
    }

    /// The entity as a JSON object, `id` included.
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), self.id.to_value());
        Value::Object(object)
    }

    /// Deserialize into a typed view of the entity.
    ///
    /// ```rust
    /// use datafront_client::Entity;
    /// use serde::Deserialize;
    /// use serde_json::json;
    ///
    /// #[derive(Deserialize)]
    /// struct Factory {
    ///     id: i64,
    ///     level: u32,
    /// }
    ///
    /// let entity = Entity::new(42, json!({ "level": 3 }).as_object().cloned().unwrap());
    /// let factory: Factory = entity.decode().unwrap();
    /// assert_eq!((factory.id, factory.level), (42, 3));
    /// ```
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_value())
    }
}

/// What happened to an entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntityChange {
    Inserted,
    Updated { fields: Vec<String> },
    Removed,
    /// Dropped by garbage collection; the server still has it.
    Evicted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityEvent {
    pub key: EntityKey,
    pub change: EntityChange,
}

struct Slot {
    entity: Rc<Entity>,
    touched_at: Instant,
}

#[derive(Default)]
struct StoreInner {
    entities: HashMap<EntityKey, Slot>,
    retains: HashMap<EntityKey, usize>,
    key_observers: HashMap<EntityKey, Observers<EntityEvent>>,
    change_observers: Observers<EntityEvent>,
}

/// Normalized mapping of entity kind and id to the one canonical copy of
/// each entity. Queries hold keys into the store, never copies.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct EntityStore {
    inner: Rc<RefCell<StoreInner>>,
    clock: Rc<dyn Clock>,
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityStore [{} entities]", self.inner.borrow().entities.len())
    }
}

impl EntityStore {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StoreInner::default())),
            clock,
        }
    }

    pub fn get(&self, kind: &EntityKind, id: &EntityId) -> Option<Rc<Entity>> {
        self.get_key(&EntityKey::new(kind.clone(), id.clone()))
    }

    pub fn get_key(&self, key: &EntityKey) -> Option<Rc<Entity>> {
        self.inner
            .borrow()
            .entities
            .get(key)
            .map(|slot| slot.entity.clone())
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.inner.borrow().entities.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge partial field sets into entities of `kind`, creating the ones not
    /// cached yet. Observers are only told about real changes: writing a value
    /// a field already has is silent, though it still counts as a touch for
    /// eviction. Returns the changes that were applied.
    pub fn put<I>(&self, kind: &EntityKind, entries: I) -> Vec<EntityEvent>
    where
        I: IntoIterator<Item = (EntityId, Fields)>,
    {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            for (id, fields) in entries {
                let key = EntityKey::new(kind.clone(), id);
                match inner.entities.get_mut(&key) {
                    Some(slot) => {
                        slot.touched_at = now;
                        let changed = if fields
                            .iter()
                            .any(|(name, value)| name != "id" && slot.entity.get(name) != Some(value))
                        {
                            Rc::make_mut(&mut slot.entity).merge(fields)
                        } else {
                            Vec::new()
                        };
                        if !changed.is_empty() {
                            trace!("Updated {} fields {:?}", key, changed);
                            events.push(EntityEvent {
                                key,
                                change: EntityChange::Updated { fields: changed },
                            });
                        }
                    }
                    None => {
                        trace!("Inserted {}", key);
                        let entity = Rc::new(Entity::new(key.id.clone(), fields));
                        inner.entities.insert(
                            key.clone(),
                            Slot {
                                entity,
                                touched_at: now,
                            },
                        );
                        events.push(EntityEvent {
                            key,
                            change: EntityChange::Inserted,
                        });
                    }
                }
            }
        }

        self.notify(&events);
        events
    }

    /// Convenience for a single entity.
    pub fn put_one(&self, kind: &EntityKind, id: impl Into<EntityId>, fields: Fields) -> bool {
        !self.put(kind, [(id.into(), fields)]).is_empty()
    }

    /// Drop an entity the server deleted. Returns false if it was not cached.
    pub fn remove(&self, kind: &EntityKind, id: &EntityId) -> bool {
        let key = EntityKey::new(kind.clone(), id.clone());
        let removed = self.inner.borrow_mut().entities.remove(&key).is_some();
        if removed {
            debug!("Removed {}", key);
            self.notify(&[EntityEvent {
                key,
                change: EntityChange::Removed,
            }]);
        }
        removed
    }

    /// Watch one entity. The handler also fires for an entity that does not
    /// exist yet once it is inserted.
    pub fn subscribe(
        &self,
        kind: &EntityKind,
        id: &EntityId,
        handler: impl Fn(&EntityEvent) + 'static,
    ) -> ObserverId {
        self.inner
            .borrow_mut()
            .key_observers
            .entry(EntityKey::new(kind.clone(), id.clone()))
            .or_default()
            .insert(Rc::new(handler))
    }

    pub fn unsubscribe(&self, kind: &EntityKind, id: &EntityId, observer: ObserverId) -> bool {
        let key = EntityKey::new(kind.clone(), id.clone());
        let mut inner = self.inner.borrow_mut();
        let Some(observers) = inner.key_observers.get_mut(&key) else {
            return false;
        };
        let removed = observers.remove(observer);
        if observers.len() == 0 {
            inner.key_observers.remove(&key);
        }
        removed
    }

    /// Watch every change to every entity.
    pub fn on_change(&self, handler: impl Fn(&EntityEvent) + 'static) -> ObserverId {
        self.inner.borrow_mut().change_observers.insert(Rc::new(handler))
    }

    pub fn off_change(&self, observer: ObserverId) -> bool {
        self.inner.borrow_mut().change_observers.remove(observer)
    }

    /// Pin an entity against eviction. Calls nest.
    pub fn retain(&self, key: &EntityKey) {
        *self.inner.borrow_mut().retains.entry(key.clone()).or_insert(0) += 1;
    }

    /// Undo one [`retain`](EntityStore::retain).
    pub fn release(&self, key: &EntityKey) {
        let mut inner = self.inner.borrow_mut();
        if let Some(count) = inner.retains.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.retains.remove(key);
            }
        }
    }

    pub fn retain_count(&self, key: &EntityKey) -> usize {
        self.inner.borrow().retains.get(key).copied().unwrap_or(0)
    }

    /// Evict entities nobody retains that were last written at least `grace`
    /// before `now`. Returns the number evicted.
    pub fn collect_garbage(&self, now: Instant, grace: Duration) -> usize {
        let evicted: Vec<EntityKey> = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let expired: Vec<EntityKey> = inner
                .entities
                .iter()
                .filter(|(key, slot)| {
                    !inner.retains.contains_key(*key)
                        && now.saturating_duration_since(slot.touched_at) >= grace
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                inner.entities.remove(key);
            }
            expired
        };

        if !evicted.is_empty() {
            debug!("Evicted {} unreferenced entities", evicted.len());
        }
        let events: Vec<EntityEvent> = evicted
            .into_iter()
            .map(|key| EntityEvent {
                key,
                change: EntityChange::Evicted,
            })
            .collect();
        self.notify(&events);
        events.len()
    }

    fn notify(&self, events: &[EntityEvent]) {
        for event in events {
            let (by_key, global) = {
                let inner = self.inner.borrow();
                (
                    inner.key_observers.get(&event.key).map(Observers::snapshot),
                    inner.change_observers.snapshot(),
                )
            };
            if let Some(by_key) = by_key {
                by_key.notify(event);
            }
            global.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn store() -> (EntityStore, ManualClock) {
        let clock = ManualClock::new();
        (EntityStore::new(Rc::new(clock.clone())), clock)
    }

    #[test]
    fn put_merges_fields_shallowly() {
        let (store, _) = store();
        let kind = EntityKind::Factories;
        store.put_one(&kind, 1, fields(json!({ "name": "A", "level": 2 })));
        store.put_one(&kind, 1, fields(json!({ "level": 3 })));

        let entity = store.get(&kind, &EntityId::Int(1)).unwrap();
        assert_eq!(entity.to_value(), json!({ "id": 1, "name": "A", "level": 3 }));
    }

    #[test]
    fn nested_values_are_replaced_not_merged() {
        let (store, _) = store();
        let kind = EntityKind::Cities;
        store.put_one(&kind, 1, fields(json!({ "stock": { "iron": 1, "coal": 2 } })));
        store.put_one(&kind, 1, fields(json!({ "stock": { "iron": 5 } })));

        let entity = store.get(&kind, &EntityId::Int(1)).unwrap();
        assert_eq!(entity.get("stock"), Some(&json!({ "iron": 5 })));
    }

    #[test]
    fn identical_write_is_silent() {
        let (store, _) = store();
        let kind = EntityKind::Bases;
        let events = Rc::new(RefCell::new(Vec::new()));
        {
            let events = events.clone();
            store.subscribe(&kind, &EntityId::Int(7), move |event| {
                events.borrow_mut().push(event.change.clone())
            });
        }

        store.put_one(&kind, 7, fields(json!({ "name": "Outpost" })));
        assert!(!store.put_one(&kind, 7, fields(json!({ "name": "Outpost" }))));
        store.put_one(&kind, 7, fields(json!({ "name": "Harbor" })));

        assert_eq!(
            *events.borrow(),
            vec![
                EntityChange::Inserted,
                EntityChange::Updated {
                    fields: vec!["name".to_string()]
                },
            ]
        );
    }

    #[test]
    fn snapshots_held_by_readers_are_not_mutated() {
        let (store, _) = store();
        let kind = EntityKind::Worlds;
        store.put_one(&kind, 1, fields(json!({ "seed": 1 })));
        let before = store.get(&kind, &EntityId::Int(1)).unwrap();

        store.put_one(&kind, 1, fields(json!({ "seed": 2 })));

        assert_eq!(before.get("seed"), Some(&json!(1)));
        let after = store.get(&kind, &EntityId::Int(1)).unwrap();
        assert_eq!(after.get("seed"), Some(&json!(2)));
    }

    #[test]
    fn garbage_collection_spares_retained_and_recent_entities() {
        let (store, clock) = store();
        let kind = EntityKind::Companies;
        store.put(
            &kind,
            [1, 2, 3].map(|id| (EntityId::Int(id), fields(json!({ "n": id })))),
        );
        let pinned = EntityKey::new(kind.clone(), 1);
        store.retain(&pinned);

        clock.advance(Duration::from_secs(20));
        store.put_one(&kind, 3, fields(json!({ "n": 30 })));
        clock.advance(Duration::from_secs(10));

        let evicted = store.collect_garbage(clock.now(), Duration::from_secs(30));
        assert_eq!(evicted, 1);
        assert!(store.contains(&pinned));
        assert!(!store.contains(&EntityKey::new(kind.clone(), 2)));
        assert!(store.contains(&EntityKey::new(kind.clone(), 3)));

        store.release(&pinned);
        assert_eq!(store.retain_count(&pinned), 0);
        store.collect_garbage(clock.now(), Duration::from_secs(30));
        assert!(!store.contains(&pinned));
    }

    #[test]
    fn decode_reads_typed_view() {
        #[derive(serde::Deserialize)]
        struct City {
            id: EntityId,
            name: String,
        }

        let entity = Entity::new("ny", fields(json!({ "name": "New York", "id": "ignored" })));
        let city: City = entity.decode().unwrap();
        assert_eq!(city.id, EntityId::Text("ny".to_string()));
        assert_eq!(city.name, "New York");
    }
}
