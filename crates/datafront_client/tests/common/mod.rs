#![allow(dead_code)]

use datafront_client::{
    DatafrontClient, EntityId, EntityKind, ErrorInfo, Fields, ManualClock, MemoryPeer,
    OutboundMessage, Push, Response, memory_link,
};
use datafront_common::{ActionRequest, CorrelationId, QueryRequest};
use serde_json::Value;
use std::time::Duration;

/// A client wired to an in-memory server end and a manual clock.
pub struct Harness {
    pub client: DatafrontClient,
    pub clock: ManualClock,
    pub server: MemoryPeer,
}

impl Harness {
    /// Client with a live link.
    pub fn online() -> Self {
        let mut harness = Self::offline();
        harness.reconnect();
        harness
    }

    /// Client that has never been connected. Its `server` is a detached end
    /// that sees nothing until [`Harness::reconnect`].
    pub fn offline() -> Self {
        let clock = ManualClock::new();
        let client = DatafrontClient::builder().clock(clock.clone()).build();
        let (_, server) = memory_link(64);
        Self {
            client,
            clock,
            server,
        }
    }

    /// Attach a fresh link and make its server end current.
    pub fn reconnect(&mut self) {
        let (link, server) = memory_link(64);
        self.server = server;
        self.client.attach(link);
    }

    /// Drop the current link as a network failure would and let the client
    /// notice.
    pub fn drop_link(&self) {
        self.server.close(Some("network down"));
        self.client.tick();
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
        self.client.tick();
    }

    /// Everything the client sent since the last call.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.server.drain()
    }

    pub fn sent_queries(&self) -> Vec<QueryRequest> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Query(query) => Some(query),
                OutboundMessage::Action(_) => None,
            })
            .collect()
    }

    pub fn sent_actions(&self) -> Vec<ActionRequest> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Action(action) => Some(action),
                OutboundMessage::Query(_) => None,
            })
            .collect()
    }

    pub fn respond(&self, correlation_id: CorrelationId, data: Value) {
        self.server
            .send(&Response::success(correlation_id, data))
            .unwrap();
        self.client.tick();
    }

    pub fn fail(&self, correlation_id: CorrelationId, error: ErrorInfo) {
        self.server
            .send(&Response::failure(correlation_id, error))
            .unwrap();
        self.client.tick();
    }

    pub fn push(&self, push: Push) {
        self.server.send(&push).unwrap();
        self.client.tick();
    }

    pub fn push_update(&self, kind: EntityKind, id: i64, fields: Value) {
        self.push(Push::EntityUpdate {
            entity_type: kind,
            id: EntityId::Int(id),
            fields: as_fields(fields),
        });
    }

    pub fn push_removed(&self, kind: EntityKind, id: i64) {
        self.push(Push::EntityRemoved {
            entity_type: kind,
            id: EntityId::Int(id),
        });
    }
}

pub fn as_fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}
