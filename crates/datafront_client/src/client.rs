use std::rc::Rc;

use datafront_common::{EntityId, EntityKind};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::action::{Action, ActionCall, ActionDispatcher, RunOptions};
use crate::clock::{Clock, SystemClock};
use crate::config::DatafrontSettings;
use crate::connection::{Connection, ReadyState};
use crate::error::DatafrontError;
use crate::observers::ObserverId;
use crate::query::{QueryDescriptor, QueryHandle, QueryRegistry};
use crate::reconciler::Reconciler;
use crate::store::EntityStore;
use crate::transport::{Transport, TransportLink};

/// Builder for [`DatafrontClient`].
///
/// ```rust
/// use datafront_client::{DatafrontClient, DatafrontSettings, ManualClock, MemoryTransport};
/// use std::time::Duration;
///
/// let client = DatafrontClient::builder()
///     .settings(DatafrontSettings {
///         request_timeout: Duration::from_secs(5),
///         ..Default::default()
///     })
///     .clock(ManualClock::new())
///     .transport(MemoryTransport::new())
///     .build();
/// assert!(!client.is_online());
/// ```
#[derive(Default)]
pub struct DatafrontClientBuilder {
    settings: DatafrontSettings,
    clock: Option<Rc<dyn Clock>>,
    transport: Option<Rc<dyn Transport>>,
}

impl DatafrontClientBuilder {
    pub fn settings(mut self, settings: DatafrontSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Rc::new(clock));
        self
    }

    /// Transport used by [`DatafrontClient::connect`]. Without one the host
    /// attaches links itself through [`DatafrontClient::attach`].
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Rc::new(transport));
        self
    }

    pub fn build(self) -> DatafrontClient {
        let settings = Rc::new(self.settings);
        let clock = self.clock.unwrap_or_else(|| Rc::new(SystemClock));

        let connection = Connection::new(settings.clone(), clock.clone());
        let store = EntityStore::new(clock.clone());
        let queries = QueryRegistry::new(store.clone(), connection.clone(), settings.clone(), clock.clone());
        let actions = ActionDispatcher::new(connection.clone());
        let reconciler = Reconciler::new(store.clone(), queries.clone(), connection.clone());
        reconciler.install();

        DatafrontClient {
            settings,
            clock,
            transport: self.transport,
            connection,
            store,
            queries,
            actions,
        }
    }
}

/// The data layer of one session: a connection, the entity store, the query
/// registry and the action dispatcher, wired together.
///
/// The client does no work on its own. The host calls [`tick`](Self::tick)
/// from its scheduler to drain the transport, expire overdue requests and
/// collect garbage. Dropping the client shuts it down.
pub struct DatafrontClient {
    settings: Rc<DatafrontSettings>,
    clock: Rc<dyn Clock>,
    transport: Option<Rc<dyn Transport>>,
    connection: Connection,
    store: EntityStore,
    queries: QueryRegistry,
    actions: ActionDispatcher,
}

impl std::fmt::Debug for DatafrontClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatafrontClient")
            .field("connection", &self.connection)
            .field("store", &self.store)
            .field("queries", &self.queries)
            .field("actions", &self.actions)
            .finish()
    }
}

impl DatafrontClient {
    pub fn builder() -> DatafrontClientBuilder {
        DatafrontClientBuilder::default()
    }

    /// Open a link through the configured transport. Queued messages are
    /// replayed and stale queries refetched once it is up.
    pub async fn connect(&self) -> Result<(), DatafrontError> {
        let transport = self.transport.as_ref().ok_or(DatafrontError::NotConnected)?;
        self.connection.connect(transport.as_ref()).await
    }

    /// Adopt a link the host connected itself.
    pub fn attach(&self, link: TransportLink) {
        self.connection.attach(link);
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Handle everything the transport delivered. Returns the packet count.
    pub fn poll(&self) -> usize {
        self.connection.poll()
    }

    pub fn expire_requests(&self) -> usize {
        self.connection.expire_requests()
    }

    /// Evict unobserved queries past their grace period, then entities no
    /// query references any more. Returns the number of evicted entities.
    pub fn collect_garbage(&self) -> usize {
        let now = self.clock.now();
        self.queries.collect_garbage(now);
        self.store.collect_garbage(now, self.settings.entity_gc_grace)
    }

    /// One scheduler turn: [`poll`](Self::poll),
    /// [`expire_requests`](Self::expire_requests) and
    /// [`collect_garbage`](Self::collect_garbage).
    pub fn tick(&self) {
        self.poll();
        self.expire_requests();
        self.collect_garbage();
    }

    /// Close the transport and fail every queued and in-flight request. The
    /// client accepts no further traffic.
    pub fn shutdown(&self) {
        info!("Shutting datafront client down");
        self.connection.shutdown();
    }

    pub fn use_query(&self, descriptor: Option<QueryDescriptor>) -> QueryHandle {
        self.queries.use_query(descriptor)
    }

    pub fn use_single(&self, kind: impl Into<EntityKind>, id: impl Into<EntityId>) -> QueryHandle {
        self.use_query(Some(QueryDescriptor::single(kind, id)))
    }

    pub fn use_many<I>(&self, kind: impl Into<EntityKind>, ids: I) -> QueryHandle
    where
        I: IntoIterator,
        I::Item: Into<EntityId>,
    {
        self.use_query(Some(QueryDescriptor::many(kind, ids)))
    }

    pub fn use_listing(&self, endpoint: &str, kind: impl Into<EntityKind>, params: Value) -> QueryHandle {
        self.use_query(Some(QueryDescriptor::listing(endpoint, kind, params)))
    }

    pub fn action(&self, name: impl Into<String>) -> Action {
        self.actions.action(name)
    }

    pub fn action_scoped(&self, name: impl Into<String>, scope: impl Into<String>) -> Action {
        self.actions.action_scoped(name, scope)
    }

    pub fn run<P: Serialize>(&self, name: impl Into<String>, payload: &P, options: RunOptions) -> ActionCall {
        self.actions.run(name, payload, options)
    }

    pub fn is_online(&self) -> bool {
        self.connection.is_online()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.connection.ready_state()
    }

    pub fn on_online_change(&self, handler: impl Fn(&bool) + 'static) -> ObserverId {
        self.connection.on_online_change(handler)
    }

    pub fn off_online_change(&self, id: ObserverId) -> bool {
        self.connection.off_online_change(id)
    }

    pub fn settings(&self) -> &DatafrontSettings {
        &self.settings
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn queries(&self) -> &QueryRegistry {
        &self.queries
    }

    pub fn actions(&self) -> &ActionDispatcher {
        &self.actions
    }
}

impl Drop for DatafrontClient {
    fn drop(&mut self) {
        self.connection.shutdown();
    }
}
