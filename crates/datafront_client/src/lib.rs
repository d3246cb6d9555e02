//! # Datafront Client
//!
//! Client-side data layer for game entities held by a server: companies,
//! bases, factories, cities and worlds.
//!
//! This library keeps a normalized cache of server entities live over one
//! connection and lets views read through it and mutate through it.
//!
//! ## Features
//!
//! - **Query Deduplication**: equal descriptors share one entry and one fetch
//! - **Entity Store**: one canonical copy per entity, merged field by field
//! - **Live Updates**: server pushes are reconciled in receipt order
//! - **Stale-While-Revalidate**: cached results stay visible during refetches
//! - **Idempotent Actions**: tokens reused across retries of the same payload
//! - **Offline Queue**: sends made while offline are replayed in order
//!
//! ## Quick Start
//!
//! ```rust
//! use datafront_client::{DatafrontClient, ManualClock, Response, memory_link};
//! use serde_json::json;
//!
//! let client = DatafrontClient::builder().clock(ManualClock::new()).build();
//! let (link, server) = memory_link(16);
//! client.attach(link);
//!
//! let factory = client.use_single("factories", 42);
//! assert!(factory.is_loading());
//!
//! // Answer the one request the query produced.
//! let request = server.drain().remove(0);
//! server
//!     .send(&Response::success(request.correlation_id(), json!({ "id": 42, "level": 2 })))
//!     .unwrap();
//! client.tick();
//!
//! let state = factory.state();
//! assert!(!state.is_loading);
//! assert_eq!(state.result.single().unwrap().get("level"), Some(&json!(2)));
//! ```
//!
//! ## Driving the client
//!
//! Everything runs on the host's thread. The host calls
//! [`DatafrontClient::tick`] from its scheduler; between ticks nothing
//! happens on its own. Observers registered on queries, actions and the
//! connection are invoked synchronously from within these calls.

// Module declarations
mod action;
mod client;
mod clock;
mod config;
mod connection;
mod error;
mod observers;
mod query;
mod reconciler;
mod store;
mod transport;

// Re-exports
pub use action::{
    Action, ActionCall, ActionDispatcher, ActionError, ActionKey, ActionState, ActionStatus,
    Idempotency, RunOptions,
};
pub use client::{DatafrontClient, DatafrontClientBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DatafrontSettings;
pub use connection::{Connection, PendingResponse, ReadyState, Request, RequestResult, Responder};
pub use error::DatafrontError;
pub use observers::ObserverId;
pub use query::{
    QueryDescriptor, QueryHandle, QueryKey, QueryRegistry, QueryResult, QueryShape, QueryState,
    QueryStatus,
};
pub use reconciler::Reconciler;
pub use store::{Entity, EntityChange, EntityEvent, EntityKey, EntityStore};
pub use transport::{
    MemoryPeer, MemoryTransport, Transport, TransportEvent, TransportLink, memory_link,
};

// Re-export wire and addressing types from datafront_common for convenience
pub use datafront_common::{
    EntityId, EntityKind, ErrorInfo, ErrorKind, Fields, OutboundMessage, Push, Response,
};
