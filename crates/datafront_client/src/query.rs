//! Query registry: deduplicated, ref-counted live views over the entity store.
//!
//! A query is identified by its endpoint and its parameters compared by
//! value. Every [`QueryHandle`] for the same key shares one registry entry, so
//! concurrent equal descriptors cost exactly one request. The entry only
//! records entity ids; results are resolved against the [`EntityStore`] on
//! every read, which keeps them coherent with the latest reconciled pushes.
//!
//! Entries outlive their last handle by
//! [`query_gc_grace`](crate::DatafrontSettings::query_gc_grace) so that
//! quick unmount/remount cycles reuse the cached result.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

use datafront_common::{EntityId, EntityKind, ErrorInfo, ErrorKind, Fields};
use indexmap::IndexMap;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::config::DatafrontSettings;
use crate::connection::{Connection, Request, RequestResult};
use crate::observers::{ObserverId, Observers};
use crate::store::{Entity, EntityChange, EntityEvent, EntityKey, EntityStore};

/// How a query's ids are chosen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryShape {
    /// One entity by id.
    Single { kind: EntityKind, id: EntityId },
    /// A fixed set of entities by id.
    Many { kind: EntityKind, ids: Vec<EntityId> },
    /// A server-side listing; the server decides membership and order.
    Listing {
        kind: EntityKind,
        /// Fields whose change may alter membership or order.
        sensitive_to: BTreeSet<String>,
    },
}

impl QueryShape {
    pub fn kind(&self) -> &EntityKind {
        match self {
            QueryShape::Single { kind, .. }
            | QueryShape::Many { kind, .. }
            | QueryShape::Listing { kind, .. } => kind,
        }
    }
}

/// What to fetch. Two descriptors with the same endpoint and equal
/// parameters address the same query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryDescriptor {
    endpoint: String,
    params: Value,
    shape: QueryShape,
}

impl QueryDescriptor {
    /// One entity, fetched from the endpoint named after its kind.
    pub fn single(kind: impl Into<EntityKind>, id: impl Into<EntityId>) -> Self {
        let kind = kind.into();
        let id = id.into();
        Self {
            endpoint: kind.as_str().to_string(),
            params: json!({ "id": id.to_value() }),
            shape: QueryShape::Single { kind, id },
        }
    }

    /// Several entities of one kind. Only the ids missing from the store are
    /// requested.
    pub fn many<I>(kind: impl Into<EntityKind>, ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<EntityId>,
    {
        let kind = kind.into();
        let mut seen = HashSet::new();
        let ids: Vec<EntityId> = ids
            .into_iter()
            .map(Into::into)
            .filter(|id| seen.insert(id.clone()))
            .collect();
        Self {
            endpoint: kind.as_str().to_string(),
            params: json!({ "ids": ids_to_value(&ids) }),
            shape: QueryShape::Many { kind, ids },
        }
    }

    /// A parameterized listing whose results are entities of `kind`, kept in
    /// server order.
    pub fn listing(endpoint: impl Into<String>, kind: impl Into<EntityKind>, params: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            params,
            shape: QueryShape::Listing {
                kind: kind.into(),
                sensitive_to: BTreeSet::new(),
            },
        }
    }

    /// Declare the fields a listing filters or sorts on. An update touching
    /// one of them makes the listing refetch. No effect on other shapes.
    pub fn sensitive_to<I>(mut self, fields: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        if let QueryShape::Listing { sensitive_to, .. } = &mut self.shape {
            sensitive_to.extend(fields.into_iter().map(Into::into));
        }
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn shape(&self) -> &QueryShape {
        &self.shape
    }

    pub fn kind(&self) -> &EntityKind {
        self.shape.kind()
    }

    pub fn key(&self) -> QueryKey {
        QueryKey::new(&self.endpoint, &self.params)
    }
}

fn ids_to_value(ids: &[EntityId]) -> Value {
    Value::Array(ids.iter().map(EntityId::to_value).collect())
}

/// Registry key: endpoint plus the canonical serialization of the params.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    endpoint: String,
    params: String,
}

impl QueryKey {
    pub fn new(endpoint: &str, params: &Value) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            params: canonicalize(params).to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.endpoint, self.params)
    }
}

/// Rebuild `value` with object keys in sorted order at every level.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(name, value)| (name.clone(), canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    Loading,
    Loaded,
    Error,
}

/// Entities a query currently resolves to.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum QueryResult {
    /// No descriptor.
    #[default]
    Empty,
    /// `None` when the entity does not exist, was removed or evicted.
    Single(Option<Rc<Entity>>),
    /// Present entities, in query order.
    Collection(IndexMap<EntityId, Rc<Entity>>),
}

impl QueryResult {
    pub fn single(&self) -> Option<&Rc<Entity>> {
        match self {
            QueryResult::Single(entity) => entity.as_ref(),
            _ => None,
        }
    }

    pub fn collection(&self) -> Option<&IndexMap<EntityId, Rc<Entity>>> {
        match self {
            QueryResult::Collection(entities) => Some(entities),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            QueryResult::Empty | QueryResult::Single(None) => 0,
            QueryResult::Single(Some(_)) => 1,
            QueryResult::Collection(entities) => entities.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Snapshot of a query as seen by a view.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState {
    pub status: QueryStatus,
    pub result: QueryResult,
    /// True only until the first response. Background refetches never set it.
    pub is_loading: bool,
    /// A request for this query is queued or in flight.
    pub is_fetching: bool,
    /// The cached result may be out of date.
    pub is_stale: bool,
    pub error: Option<ErrorInfo>,
}

impl QueryState {
    pub fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            result: QueryResult::Empty,
            is_loading: false,
            is_fetching: false,
            is_stale: false,
            error: None,
        }
    }
}

struct QueryEntry {
    descriptor: QueryDescriptor,
    status: QueryStatus,
    /// Members in query order. Fixed for single/many, server-provided for
    /// listings.
    ids: Vec<EntityId>,
    /// Keys this entry holds a store retain on.
    retained: Vec<EntityKey>,
    responded: bool,
    error: Option<ErrorInfo>,
    stale: bool,
    /// Generation of the outstanding fetch, if any.
    in_flight: Option<u64>,
    refetch_pending: bool,
    observers: usize,
    released_at: Option<Instant>,
    listeners: Observers<QueryState>,
}

impl QueryEntry {
    fn references(&self, key: &EntityKey) -> bool {
        self.descriptor.kind() == &key.kind && self.ids.contains(&key.id)
    }
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<QueryKey, QueryEntry>,
    next_generation: u64,
}

struct Shared {
    inner: RefCell<RegistryInner>,
    store: EntityStore,
    connection: Connection,
    settings: Rc<DatafrontSettings>,
    clock: Rc<dyn Clock>,
}

/// All live queries of a client.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct QueryRegistry {
    shared: Rc<Shared>,
}

impl fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryRegistry [{} queries]", self.len())
    }
}

impl QueryRegistry {
    /// Create a registry and hook it to store changes and reconnects.
    pub fn new(
        store: EntityStore,
        connection: Connection,
        settings: Rc<DatafrontSettings>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let registry = Self {
            shared: Rc::new(Shared {
                inner: RefCell::new(RegistryInner::default()),
                store,
                connection,
                settings,
                clock,
            }),
        };

        let weak = Rc::downgrade(&registry.shared);
        registry.shared.store.on_change(move |event| {
            if let Some(registry) = upgrade(&weak) {
                registry.entity_changed(event);
            }
        });

        let weak = Rc::downgrade(&registry.shared);
        registry.shared.connection.on_online_change(move |online| {
            if *online && let Some(registry) = upgrade(&weak) {
                registry.refetch_stale();
            }
        });

        registry
    }

    pub fn len(&self) -> usize {
        self.shared.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.shared.inner.borrow().entries.contains_key(key)
    }

    /// Number of live handles on `key`.
    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.shared
            .inner
            .borrow()
            .entries
            .get(key)
            .map_or(0, |entry| entry.observers)
    }

    /// Observe a query. `None` yields a handle that stays idle and never
    /// touches the network.
    ///
    /// The first handle for a key creates the entry and fetches unless every
    /// requested id is already cached; later handles share the entry and
    /// only refetch when it went stale or failed.
    pub fn use_query(&self, descriptor: Option<QueryDescriptor>) -> QueryHandle {
        let Some(descriptor) = descriptor else {
            return QueryHandle {
                registry: self.clone(),
                key: None,
                listeners: RefCell::new(Vec::new()),
            };
        };

        let key = descriptor.key();
        let needs_fetch = {
            let mut inner = self.shared.inner.borrow_mut();
            match inner.entries.get_mut(&key) {
                Some(entry) => {
                    entry.observers += 1;
                    entry.released_at = None;
                    trace!("Query {} now has {} observers", key, entry.observers);
                    entry.in_flight.is_none() && (entry.stale || entry.status == QueryStatus::Error)
                }
                None => {
                    let entry = self.create_entry(descriptor);
                    let needs_fetch = entry.status == QueryStatus::Loading;
                    inner.entries.insert(key.clone(), entry);
                    needs_fetch
                }
            }
        };

        if needs_fetch {
            self.fetch(&key);
        }

        QueryHandle {
            registry: self.clone(),
            key: Some(key),
            listeners: RefCell::new(Vec::new()),
        }
    }

    fn create_entry(&self, descriptor: QueryDescriptor) -> QueryEntry {
        let store = &self.shared.store;
        let ids = match descriptor.shape() {
            QueryShape::Single { id, .. } => vec![id.clone()],
            QueryShape::Many { ids, .. } => ids.clone(),
            QueryShape::Listing { .. } => Vec::new(),
        };
        let retained: Vec<EntityKey> = ids
            .iter()
            .map(|id| EntityKey::new(descriptor.kind().clone(), id.clone()))
            .collect();
        for key in &retained {
            store.retain(key);
        }

        let cached = !matches!(descriptor.shape(), QueryShape::Listing { .. })
            && retained.iter().all(|key| store.contains(key));
        if cached {
            debug!("Query {} served from the store", descriptor.key());
        }

        QueryEntry {
            descriptor,
            status: if cached {
                QueryStatus::Loaded
            } else {
                QueryStatus::Loading
            },
            ids,
            retained,
            responded: cached,
            error: None,
            stale: false,
            in_flight: None,
            refetch_pending: false,
            observers: 1,
            released_at: None,
            listeners: Observers::new(),
        }
    }

    /// Current state of `key`, idle if the registry has no such query.
    pub fn state(&self, key: &QueryKey) -> QueryState {
        let inner = self.shared.inner.borrow();
        match inner.entries.get(key) {
            Some(entry) => self.resolve_state(entry),
            None => QueryState::idle(),
        }
    }

    fn resolve_state(&self, entry: &QueryEntry) -> QueryState {
        let store = &self.shared.store;
        let kind = entry.descriptor.kind();
        let result = match entry.descriptor.shape() {
            QueryShape::Single { id, .. } => QueryResult::Single(store.get(kind, id)),
            QueryShape::Many { .. } | QueryShape::Listing { .. } => QueryResult::Collection(
                entry
                    .ids
                    .iter()
                    .filter_map(|id| store.get(kind, id).map(|entity| (id.clone(), entity)))
                    .collect(),
            ),
        };

        QueryState {
            status: entry.status,
            result,
            is_loading: entry.status == QueryStatus::Loading,
            is_fetching: entry.in_flight.is_some(),
            is_stale: entry.stale,
            error: entry.error.clone(),
        }
    }

    /// Fetch `key` now, or right after the outstanding fetch completes.
    pub fn refetch(&self, key: &QueryKey) {
        self.fetch(key);
    }

    fn fetch(&self, key: &QueryKey) {
        let (request, descriptor, generation) = {
            let mut inner = self.shared.inner.borrow_mut();
            let inner = &mut *inner;
            let Some(entry) = inner.entries.get_mut(key) else {
                return;
            };
            if entry.in_flight.is_some() {
                entry.refetch_pending = true;
                return;
            }

            let params = match entry.descriptor.shape() {
                QueryShape::Many { kind, ids } if !entry.responded => {
                    let missing: Vec<EntityId> = ids
                        .iter()
                        .filter(|id| self.shared.store.get(kind, id).is_none())
                        .cloned()
                        .collect();
                    json!({ "ids": ids_to_value(&missing) })
                }
                _ => entry.descriptor.params().clone(),
            };

            inner.next_generation += 1;
            let generation = inner.next_generation;
            entry.in_flight = Some(generation);
            entry.refetch_pending = false;
            debug!("Fetching query {}", key);

            let request = Request::Query {
                endpoint: entry.descriptor.endpoint().to_string(),
                params,
            };
            (request, entry.descriptor.clone(), generation)
        };

        let registry = self.clone();
        let response_key = key.clone();
        self.shared.connection.send_with(
            request,
            Box::new(move |result| {
                registry.complete_fetch(&response_key, &descriptor, generation, result)
            }),
        );
        self.notify(key);
    }

    fn complete_fetch(
        &self,
        key: &QueryKey,
        descriptor: &QueryDescriptor,
        generation: u64,
        result: RequestResult,
    ) {
        let outcome = match result.and_then(parse_entities) {
            Err(error) if error.kind == ErrorKind::NotFound => Ok(Vec::new()),
            outcome => outcome,
        };

        match outcome {
            Ok(entities) => self.apply_response(key, descriptor, generation, entities),
            Err(error) => self.apply_failure(key, generation, error),
        }
    }

    fn apply_response(
        &self,
        key: &QueryKey,
        descriptor: &QueryDescriptor,
        generation: u64,
        entities: Vec<(EntityId, Fields)>,
    ) {
        let store = &self.shared.store;
        let kind = descriptor.kind();
        let ids: Vec<EntityId> = entities.iter().map(|(id, _)| id.clone()).collect();

        // Applied even when the query was evicted in the meantime.
        store.put(kind, entities);
        if let QueryShape::Single { id, .. } = descriptor.shape()
            && ids.is_empty()
        {
            store.remove(kind, id);
        }

        let refetch = {
            let mut inner = self.shared.inner.borrow_mut();
            let Some(entry) = inner.entries.get_mut(key) else {
                debug!("Query {} was evicted before its response arrived", key);
                return;
            };
            if entry.in_flight != Some(generation) {
                debug!("Ignoring superseded response for query {}", key);
                return;
            }

            entry.in_flight = None;
            entry.responded = true;
            entry.status = QueryStatus::Loaded;
            entry.error = None;
            entry.stale = false;

            if let QueryShape::Listing { .. } = descriptor.shape() {
                let members: Vec<EntityKey> = ids
                    .iter()
                    .map(|id| EntityKey::new(kind.clone(), id.clone()))
                    .collect();
                for member in &members {
                    store.retain(member);
                }
                for previous in std::mem::replace(&mut entry.retained, members) {
                    store.release(&previous);
                }
                entry.ids = ids;
            }

            trace!("Query {} loaded {} entities", key, entry.ids.len());
            std::mem::take(&mut entry.refetch_pending) && entry.observers > 0
        };

        self.notify(key);
        if refetch {
            self.fetch(key);
        }
    }

    fn apply_failure(&self, key: &QueryKey, generation: u64, error: ErrorInfo) {
        // Network failures wait for a reconnect only while the link is down.
        let offline = !self.shared.connection.is_online();
        let refetch = {
            let mut inner = self.shared.inner.borrow_mut();
            let Some(entry) = inner.entries.get_mut(key) else {
                return;
            };
            if entry.in_flight != Some(generation) {
                return;
            }
            entry.in_flight = None;

            let keep_last_good = match error.kind {
                ErrorKind::Network if offline => true,
                ErrorKind::Network | ErrorKind::Timeout => entry.responded,
                _ => false,
            };
            if keep_last_good {
                debug!("Query {} kept its last result after: {}", key, error);
                entry.stale = true;
            } else {
                warn!("Query {} failed: {}", key, error);
                entry.status = QueryStatus::Error;
                entry.error = Some(error.clone());
            }

            std::mem::take(&mut entry.refetch_pending)
                && entry.observers > 0
                && error.kind != ErrorKind::Network
        };

        self.notify(key);
        if refetch {
            self.fetch(key);
        }
    }

    /// Mark queries of `endpoint` stale, all of them when `params` is `None`,
    /// and refetch the observed ones. Returns the number of matching queries.
    pub fn invalidate(&self, endpoint: &str, params: Option<&Value>) -> usize {
        let wanted = params.map(|params| QueryKey::new(endpoint, params));
        let (matched, to_fetch) = {
            let mut inner = self.shared.inner.borrow_mut();
            let mut matched = 0;
            let mut to_fetch = Vec::new();
            for (key, entry) in inner.entries.iter_mut() {
                let hit = match &wanted {
                    Some(wanted) => key == wanted,
                    None => key.endpoint == endpoint,
                };
                if !hit {
                    continue;
                }
                matched += 1;
                entry.stale = true;
                if entry.observers > 0 {
                    to_fetch.push(key.clone());
                }
            }
            (matched, to_fetch)
        };

        debug!("Invalidated {} queries of {}", matched, endpoint);
        self.refetch_all(to_fetch);
        matched
    }

    /// Mark listings affected by pushed entity changes stale and refetch the
    /// observed ones. A new entity of a listing's kind always affects it, an
    /// update only when it touches one of the listing's declared fields.
    pub fn reconcile(&self, events: &[EntityEvent]) {
        let to_fetch = {
            let mut inner = self.shared.inner.borrow_mut();
            let mut to_fetch = BTreeSet::new();
            for event in events {
                for (key, entry) in inner.entries.iter_mut() {
                    let QueryShape::Listing { kind, sensitive_to } = entry.descriptor.shape()
                    else {
                        continue;
                    };
                    if kind != &event.key.kind {
                        continue;
                    }
                    let affected = match &event.change {
                        EntityChange::Inserted => true,
                        EntityChange::Updated { fields } => {
                            fields.iter().any(|field| sensitive_to.contains(field))
                        }
                        EntityChange::Removed | EntityChange::Evicted => false,
                    };
                    if affected {
                        entry.stale = true;
                        if entry.observers > 0 {
                            to_fetch.insert(key.clone());
                        }
                    }
                }
            }
            to_fetch
        };

        self.refetch_all(to_fetch);
    }

    /// Refetch observed queries that went stale or failed, e.g. after a
    /// reconnect.
    pub fn refetch_stale(&self) {
        let to_fetch: Vec<QueryKey> = self
            .shared
            .inner
            .borrow()
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.observers > 0
                    && entry.in_flight.is_none()
                    && (entry.stale || entry.status == QueryStatus::Error)
            })
            .map(|(key, _)| key.clone())
            .collect();

        if !to_fetch.is_empty() {
            debug!("Refetching {} stale queries", to_fetch.len());
        }
        self.refetch_all(to_fetch);
    }

    fn refetch_all(&self, keys: impl IntoIterator<Item = QueryKey>) {
        for key in keys {
            self.fetch(&key);
        }
    }

    /// Evict queries that have had no observers for the grace period and
    /// drop their entity retains. Returns the number evicted.
    pub fn collect_garbage(&self, now: Instant) -> usize {
        let grace = self.shared.settings.query_gc_grace;
        let evicted: Vec<(QueryKey, QueryEntry)> = {
            let mut inner = self.shared.inner.borrow_mut();
            let expired: Vec<QueryKey> = inner
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry.observers == 0
                        && entry
                            .released_at
                            .is_some_and(|released| now.saturating_duration_since(released) >= grace)
                })
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|key| inner.entries.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        for (key, entry) in &evicted {
            debug!("Evicting unobserved query {}", key);
            for retained in &entry.retained {
                self.shared.store.release(retained);
            }
        }
        evicted.len()
    }

    fn entity_changed(&self, event: &EntityEvent) {
        let affected: Vec<QueryKey> = self
            .shared
            .inner
            .borrow()
            .entries
            .iter()
            .filter(|(_, entry)| entry.references(&event.key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in affected {
            self.notify(&key);
        }
    }

    fn notify(&self, key: &QueryKey) {
        let (state, listeners) = {
            let inner = self.shared.inner.borrow();
            let Some(entry) = inner.entries.get(key) else {
                return;
            };
            if entry.listeners.len() == 0 {
                return;
            }
            (self.resolve_state(entry), entry.listeners.snapshot())
        };
        listeners.notify(&state);
    }

    fn subscribe(&self, key: &QueryKey, handler: impl Fn(&QueryState) + 'static) -> Option<ObserverId> {
        self.shared
            .inner
            .borrow_mut()
            .entries
            .get_mut(key)
            .map(|entry| entry.listeners.insert(Rc::new(handler)))
    }

    fn release(&self, key: &QueryKey, listeners: &[ObserverId]) {
        let now = self.shared.clock.now();
        let mut inner = self.shared.inner.borrow_mut();
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        for listener in listeners {
            entry.listeners.remove(*listener);
        }
        entry.observers = entry.observers.saturating_sub(1);
        if entry.observers == 0 {
            trace!("Query {} has no observers left", key);
            entry.released_at = Some(now);
        }
    }
}

fn upgrade(weak: &Weak<Shared>) -> Option<QueryRegistry> {
    weak.upgrade().map(|shared| QueryRegistry { shared })
}

/// Read entities out of a query response.
///
/// Accepted shapes: `null` (nothing found), one entity object carrying an
/// `id`, an array of such objects, or an object mapping ids to field sets.
fn parse_entities(data: Option<Value>) -> Result<Vec<(EntityId, Fields)>, ErrorInfo> {
    match data {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.into_iter().map(parse_entity).collect(),
        Some(Value::Object(object)) if object.contains_key("id") => {
            Ok(vec![parse_entity(Value::Object(object))?])
        }
        Some(Value::Object(object)) => object
            .into_iter()
            .map(|(id, fields)| match fields {
                Value::Object(fields) => Ok((EntityId::from_key(&id), fields)),
                other => Err(malformed(format!("entity {} is not an object: {}", id, other))),
            })
            .collect(),
        Some(other) => Err(malformed(format!("unexpected query data: {}", other))),
    }
}

fn parse_entity(value: Value) -> Result<(EntityId, Fields), ErrorInfo> {
    let Value::Object(fields) = value else {
        return Err(malformed(format!("entity is not an object: {}", value)));
    };
    let id = fields
        .get("id")
        .and_then(EntityId::from_value)
        .ok_or_else(|| malformed("entity without a usable id"))?;
    Ok((id, fields))
}

fn malformed(message: impl Into<String>) -> ErrorInfo {
    ErrorInfo::internal(message)
}

/// A view's hold on one query. Dropping the handle releases it.
pub struct QueryHandle {
    registry: QueryRegistry,
    key: Option<QueryKey>,
    listeners: RefCell<Vec<ObserverId>>,
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "QueryHandle [{}]", key),
            None => f.write_str("QueryHandle [idle]"),
        }
    }
}

impl QueryHandle {
    /// `None` for the handle of a null descriptor.
    pub fn key(&self) -> Option<&QueryKey> {
        self.key.as_ref()
    }

    pub fn state(&self) -> QueryState {
        match &self.key {
            Some(key) => self.registry.state(key),
            None => QueryState::idle(),
        }
    }

    pub fn result(&self) -> QueryResult {
        self.state().result
    }

    pub fn is_loading(&self) -> bool {
        self.state().is_loading
    }

    pub fn error(&self) -> Option<ErrorInfo> {
        self.state().error
    }

    /// Call `handler` with the new state whenever the query or one of its
    /// entities changes. Removed automatically when the handle drops.
    pub fn subscribe(&self, handler: impl Fn(&QueryState) + 'static) -> Option<ObserverId> {
        let key = self.key.as_ref()?;
        let id = self.registry.subscribe(key, handler)?;
        self.listeners.borrow_mut().push(id);
        Some(id)
    }

    pub fn refetch(&self) {
        if let Some(key) = &self.key {
            self.registry.refetch(key);
        }
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        if let Some(key) = &self.key {
            self.registry.release(key, &self.listeners.borrow());
        }
    }
}
