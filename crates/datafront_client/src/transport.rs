//! The raw duplex channel underneath a [`Connection`](crate::Connection).
//!
//! A transport implementation owns the socket (WebSocket, in-process pipe,
//! ...) and bridges it to a [`TransportLink`]: a pair of async channels the
//! connection drains and fills from the client's single thread. Reconnect
//! policy and keepalive belong to the transport, not to the cache.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use async_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use async_trait::async_trait;
use codee::Encoder;
use datafront_common::codec::{FramedJsonCodec, split_frames};
use datafront_common::OutboundMessage;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::DatafrontSettings;
use crate::error::DatafrontError;

/// Something that happened on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A packet of one or more length-prefixed frames.
    Packet(Vec<u8>),
    /// The peer or the network closed the channel.
    Closed(Option<String>),
}

/// The client's side of one live transport.
#[derive(Debug)]
pub struct TransportLink {
    pub(crate) outbound: Sender<Vec<u8>>,
    pub(crate) inbound: Receiver<TransportEvent>,
}

impl TransportLink {
    pub fn new(outbound: Sender<Vec<u8>>, inbound: Receiver<TransportEvent>) -> Self {
        Self { outbound, inbound }
    }

    pub(crate) fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }
}

/// Factory for transport links, invoked on every (re)connect.
#[async_trait(?Send)]
pub trait Transport {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    async fn connect(&self, settings: &DatafrontSettings) -> Result<TransportLink, DatafrontError>;
}

/// Create a connected in-memory link and the peer end that plays the server.
pub fn memory_link(capacity: usize) -> (TransportLink, MemoryPeer) {
    let (to_server, from_client) = bounded(capacity.max(1));
    let (to_client, from_server) = unbounded();
    (
        TransportLink::new(to_server, from_server),
        MemoryPeer {
            from_client,
            to_client,
        },
    )
}

/// Server side of an in-memory link.
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    from_client: Receiver<Vec<u8>>,
    to_client: Sender<TransportEvent>,
}

impl MemoryPeer {
    /// Next raw packet the client wrote, if any.
    pub fn try_recv_packet(&self) -> Option<Vec<u8>> {
        self.from_client.try_recv().ok()
    }

    /// Drain and decode everything the client has written so far.
    pub fn drain(&self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Some(packet) = self.try_recv_packet() {
            let frames = match split_frames(&packet) {
                Ok(frames) => frames,
                Err(err) => {
                    warn!("MemoryPeer dropping malformed packet: {}", err);
                    continue;
                }
            };
            for frame in frames {
                match serde_json::from_slice(frame) {
                    Ok(message) => messages.push(message),
                    Err(err) => warn!("MemoryPeer dropping undecodable frame: {}", err),
                }
            }
        }
        messages
    }

    /// Frame and deliver one message to the client.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), DatafrontError> {
        let packet = FramedJsonCodec::encode(message)?;
        self.send_packet(packet)
    }

    /// Deliver a raw packet, e.g. several frames batched together.
    pub fn send_packet(&self, packet: Vec<u8>) -> Result<(), DatafrontError> {
        self.to_client
            .try_send(TransportEvent::Packet(packet))
            .map_err(|_| DatafrontError::Transport("client end is closed".to_string()))
    }

    /// Drop the link as a network failure would.
    pub fn close(&self, reason: Option<&str>) {
        let _ = self
            .to_client
            .try_send(TransportEvent::Closed(reason.map(str::to_string)));
        self.to_client.close();
        self.from_client.close();
    }

    pub fn is_closed(&self) -> bool {
        self.from_client.is_closed()
    }

    pub fn pending_packets(&self) -> usize {
        self.from_client.len()
    }
}

/// A [`Transport`] whose links are in-memory pipes. Every successful
/// [`connect`](Transport::connect) hands the new server end to
/// [`MemoryTransport::accept`].
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Rc<RefCell<MemoryTransportState>>,
}

#[derive(Default)]
struct MemoryTransportState {
    accepted: VecDeque<MemoryPeer>,
    refusing: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connects fail, as an unreachable server would.
    pub fn set_refusing(&self, refusing: bool) {
        self.state.borrow_mut().refusing = refusing;
    }

    /// Oldest server end not yet taken.
    pub fn accept(&self) -> Option<MemoryPeer> {
        self.state.borrow_mut().accepted.pop_front()
    }
}

#[async_trait(?Send)]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, settings: &DatafrontSettings) -> Result<TransportLink, DatafrontError> {
        if self.state.borrow().refusing {
            return Err(DatafrontError::Transport("connection refused".to_string()));
        }
        let (link, peer) = memory_link(settings.transport_channel_capacity);
        self.state.borrow_mut().accepted.push_back(peer);
        debug!("MemoryTransport accepted a new link");
        Ok(link)
    }
}

pub(crate) fn try_next_event(link: &TransportLink) -> Result<TransportEvent, TryRecvError> {
    link.inbound.try_recv()
}
