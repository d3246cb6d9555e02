use datafront_common::Push;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::observers::ObserverId;
use crate::query::QueryRegistry;
use crate::store::EntityStore;

/// Applies server pushes to the entity store and tells the query registry
/// which listings they may affect.
///
/// Pushes are applied one at a time in the order the connection received
/// them, so the last update of a field wins.
#[derive(Clone, Debug)]
pub struct Reconciler {
    store: EntityStore,
    queries: QueryRegistry,
    connection: Connection,
}

impl Reconciler {
    pub fn new(store: EntityStore, queries: QueryRegistry, connection: Connection) -> Self {
        Self {
            store,
            queries,
            connection,
        }
    }

    /// Register on the connection's push channel.
    pub fn install(&self) -> ObserverId {
        let reconciler = self.clone();
        self.connection.on_push(move |push| reconciler.apply(push.clone()))
    }

    pub fn apply(&self, push: Push) {
        match push {
            Push::EntityUpdate {
                entity_type,
                id,
                fields,
            } => {
                trace!("Push: update {}/{}", entity_type, id);
                let events = self.store.put(&entity_type, [(id, fields)]);
                self.queries.reconcile(&events);
            }
            Push::EntityRemoved { entity_type, id } => {
                trace!("Push: remove {}/{}", entity_type, id);
                self.store.remove(&entity_type, &id);
            }
            Push::QueryInvalidated { endpoint, params } => {
                self.queries.invalidate(&endpoint, params.as_ref());
            }
            Push::ActionResult(response) => {
                if !self.connection.resolve(response) {
                    debug!("Action result for an unknown or expired request");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DatafrontSettings;
    use crate::query::QueryDescriptor;
    use datafront_common::{EntityId, EntityKind};
    use serde_json::json;
    use std::rc::Rc;

    fn reconciler() -> (Reconciler, EntityStore, QueryRegistry) {
        let clock: Rc<ManualClock> = Rc::new(ManualClock::new());
        let settings = Rc::new(DatafrontSettings::default());
        let connection = Connection::new(settings.clone(), clock.clone());
        let store = EntityStore::new(clock.clone());
        let queries = QueryRegistry::new(store.clone(), connection.clone(), settings, clock);
        (
            Reconciler::new(store.clone(), queries.clone(), connection),
            store,
            queries,
        )
    }

    fn update(id: i64, fields: serde_json::Value) -> Push {
        Push::EntityUpdate {
            entity_type: EntityKind::Factories,
            id: EntityId::Int(id),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn later_push_wins() {
        let (reconciler, store, _) = reconciler();
        reconciler.apply(update(1, json!({ "name": "A", "level": 2 })));
        reconciler.apply(update(1, json!({ "level": 3 })));

        let entity = store.get(&EntityKind::Factories, &EntityId::Int(1)).unwrap();
        assert_eq!(entity.to_value(), json!({ "id": 1, "name": "A", "level": 3 }));
    }

    #[test]
    fn removal_empties_single_query() {
        let (reconciler, _, queries) = reconciler();
        reconciler.apply(update(5, json!({ "level": 1 })));

        let handle = queries.use_query(Some(QueryDescriptor::single(EntityKind::Factories, 5)));
        assert!(handle.result().single().is_some());

        reconciler.apply(Push::EntityRemoved {
            entity_type: EntityKind::Factories,
            id: EntityId::Int(5),
        });
        assert!(handle.result().single().is_none());
        assert!(!handle.is_loading());
    }
}
