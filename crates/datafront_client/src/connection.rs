use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use async_channel::{TryRecvError, TrySendError};
use codee::Encoder;
use datafront_common::codec::{FramedJsonCodec, split_frames};
use datafront_common::{
    ActionRequest, CorrelationId, ErrorInfo, InboundMessage, OutboundMessage, Push, QueryRequest,
    Response,
};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::config::DatafrontSettings;
use crate::error::DatafrontError;
use crate::observers::{ObserverId, Observers};
use crate::transport::{Transport, TransportEvent, TransportLink, try_next_event};

/// Outcome of one request: the response `data` on success.
pub type RequestResult = Result<Option<Value>, ErrorInfo>;

/// Callback receiving a request's outcome exactly once.
pub type Responder = Box<dyn FnOnce(RequestResult)>;

/// Connection lifecycle, as exposed to views.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}

/// A request before the connection assigns its correlation id.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Query {
        endpoint: String,
        params: Value,
    },
    Action {
        action: String,
        payload: Value,
        idempotency_token: Option<String>,
    },
}

impl Request {
    fn into_message(self, correlation_id: CorrelationId) -> OutboundMessage {
        match self {
            Request::Query { endpoint, params } => OutboundMessage::Query(QueryRequest {
                correlation_id,
                endpoint,
                params,
            }),
            Request::Action {
                action,
                payload,
                idempotency_token,
            } => OutboundMessage::Action(ActionRequest {
                correlation_id,
                action,
                payload,
                idempotency_token,
            }),
        }
    }
}

/// Handle to the eventual response of a [`Connection::send`].
#[derive(Debug)]
pub struct PendingResponse {
    correlation_id: CorrelationId,
    receiver: async_channel::Receiver<RequestResult>,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// The outcome, if it has arrived.
    pub fn try_take(&self) -> Option<RequestResult> {
        self.receiver.try_recv().ok()
    }

    /// Wait for the outcome. Resolves with a network error if the connection
    /// is dropped without ever answering.
    pub async fn response(self) -> RequestResult {
        self.receiver
            .recv()
            .await
            .unwrap_or_else(|_| Err(ErrorInfo::network("connection dropped the request")))
    }
}

struct Queued {
    message: OutboundMessage,
    responder: Responder,
}

struct InFlight {
    name: String,
    responder: Responder,
    sent_at: Instant,
}

struct ConnectionInner {
    state: ReadyState,
    link: Option<TransportLink>,
    next_correlation_id: CorrelationId,
    /// Messages not yet handed to a transport, in submission order.
    queue: VecDeque<Queued>,
    /// Messages written to the transport and awaiting a response.
    in_flight: BTreeMap<CorrelationId, InFlight>,
    push_handlers: Observers<Push>,
    online_handlers: Observers<bool>,
    shut_down: bool,
}

/// The one logical duplex channel to the backend.
///
/// Outbound messages go through a FIFO queue: while a transport is attached
/// the queue is flushed as soon as the transport accepts writes, while
/// offline it keeps growing and is replayed in order on the next
/// [`attach`](Connection::attach). A new message never overtakes a queued
/// one, so the server observes requests in the order they were issued.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<ConnectionInner>>,
    settings: Rc<DatafrontSettings>,
    clock: Rc<dyn Clock>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        write!(
            f,
            "Connection [{:?}, {} queued, {} in flight]",
            inner.state,
            inner.queue.len(),
            inner.in_flight.len()
        )
    }
}

impl Connection {
    pub fn new(settings: Rc<DatafrontSettings>, clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ConnectionInner {
                state: ReadyState::Closed,
                link: None,
                next_correlation_id: 1,
                queue: VecDeque::new(),
                in_flight: BTreeMap::new(),
                push_handlers: Observers::new(),
                online_handlers: Observers::new(),
                shut_down: false,
            })),
            settings,
            clock,
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.borrow().state
    }

    pub fn is_online(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Messages waiting for a transport.
    pub fn queued_len(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Messages sent and awaiting their response.
    pub fn in_flight_len(&self) -> usize {
        self.inner.borrow().in_flight.len()
    }

    /// Register a handler for unsolicited server pushes.
    pub fn on_push(&self, handler: impl Fn(&Push) + 'static) -> ObserverId {
        self.inner.borrow_mut().push_handlers.insert(Rc::new(handler))
    }

    pub fn off_push(&self, id: ObserverId) -> bool {
        self.inner.borrow_mut().push_handlers.remove(id)
    }

    /// Register a handler called with the new online flag on every change.
    pub fn on_online_change(&self, handler: impl Fn(&bool) + 'static) -> ObserverId {
        self.inner.borrow_mut().online_handlers.insert(Rc::new(handler))
    }

    pub fn off_online_change(&self, id: ObserverId) -> bool {
        self.inner.borrow_mut().online_handlers.remove(id)
    }

    /// Send a request and get a handle to its response.
    pub fn send(&self, request: Request) -> PendingResponse {
        let (sender, receiver) = async_channel::bounded(1);
        let correlation_id = self.send_with(
            request,
            Box::new(move |result| {
                let _ = sender.try_send(result);
            }),
        );
        PendingResponse {
            correlation_id,
            receiver,
        }
    }

    /// Send a request; `responder` is called exactly once with its outcome.
    ///
    /// The responder may run before this returns if the request is rejected
    /// locally (shut down, full queue).
    pub fn send_with(&self, request: Request, responder: Responder) -> CorrelationId {
        let mut inner = self.inner.borrow_mut();
        let correlation_id = inner.next_correlation_id;
        inner.next_correlation_id += 1;

        if inner.shut_down {
            drop(inner);
            responder(Err(ErrorInfo::network("client has been shut down")));
            return correlation_id;
        }

        if inner.queue.len() >= self.settings.outbound_capacity {
            error!(
                "Outbound queue is full ({} messages), rejecting request {}",
                inner.queue.len(),
                correlation_id
            );
            drop(inner);
            responder(Err(ErrorInfo::network("outbound queue is full")));
            return correlation_id;
        }

        let message = request.into_message(correlation_id);
        trace!("Queueing '{}' as request {}", message.name(), correlation_id);
        inner.queue.push_back(Queued { message, responder });

        let depth = inner.queue.len();
        if depth > self.settings.outbound_warning_depth() {
            warn!(
                "Outbound queue depth {} exceeds {}% of capacity {}",
                depth, self.settings.outbound_warning_threshold, self.settings.outbound_capacity
            );
        }
        drop(inner);

        self.flush();
        correlation_id
    }

    /// Write queued messages to the transport, oldest first, until the queue
    /// is empty or the transport stops accepting.
    fn flush(&self) {
        let mut failed = Vec::new();
        let mut lost = false;

        {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let Some(link) = inner.link.as_ref() else {
                return;
            };

            while let Some(front) = inner.queue.front() {
                let packet = match FramedJsonCodec::encode(&front.message) {
                    Ok(packet) => packet,
                    Err(err) => {
                        error!("Failed to encode request {}: {}", front.message.correlation_id(), err);
                        if let Some(queued) = inner.queue.pop_front() {
                            failed.push((queued.responder, ErrorInfo::internal(err.to_string())));
                        }
                        continue;
                    }
                };

                match link.outbound.try_send(packet) {
                    Ok(()) => {
                        let Some(queued) = inner.queue.pop_front() else {
                            break;
                        };
                        let correlation_id = queued.message.correlation_id();
                        trace!("Sent '{}' as request {}", queued.message.name(), correlation_id);
                        inner.in_flight.insert(
                            correlation_id,
                            InFlight {
                                name: queued.message.name().to_string(),
                                responder: queued.responder,
                                sent_at: self.clock.now(),
                            },
                        );
                    }
                    Err(TrySendError::Full(_)) => {
                        debug!("Transport is busy, {} messages wait for the next flush", inner.queue.len());
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        lost = true;
                        break;
                    }
                }
            }
        }

        for (responder, error) in failed {
            responder(Err(error));
        }
        if lost {
            self.transport_lost(Some("transport write side closed".to_string()));
        }
    }

    /// Connect through `transport` unless a transport is already attached.
    pub async fn connect(&self, transport: &dyn Transport) -> Result<(), DatafrontError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.shut_down {
                return Err(DatafrontError::ShutDown);
            }
            if inner.state == ReadyState::Open {
                return Ok(());
            }
            inner.state = ReadyState::Connecting;
        }

        info!("Connecting through the {} transport", transport.name());
        match transport.connect(&self.settings).await {
            Ok(link) => {
                self.attach(link);
                Ok(())
            }
            Err(err) => {
                warn!("Connecting through the {} transport failed: {}", transport.name(), err);
                let mut inner = self.inner.borrow_mut();
                if inner.state == ReadyState::Connecting {
                    inner.state = ReadyState::Closed;
                }
                Err(err)
            }
        }
    }

    /// Adopt a freshly connected transport: replay the queue in submission
    /// order, then announce that the connection is online.
    pub fn attach(&self, link: TransportLink) {
        if self.inner.borrow().shut_down {
            link.close();
            return;
        }

        // Answers to requests sent on a replaced link can no longer arrive.
        self.transport_lost(Some("replaced by a new link".to_string()));

        let was_online = {
            let mut inner = self.inner.borrow_mut();
            inner.link = Some(link);
            let was_online = inner.state == ReadyState::Open;
            inner.state = ReadyState::Open;
            info!("Connection open, replaying {} queued messages", inner.queue.len());
            was_online
        };

        self.flush();

        if !was_online && self.is_online() {
            self.notify_online(true);
        }
    }

    /// Close the transport on purpose. Queued messages are kept.
    pub fn disconnect(&self) {
        self.transport_lost(Some("closed by client".to_string()));
    }

    /// Drain everything the transport delivered since the last call: resolve
    /// responses, dispatch pushes in receipt order, and notice a closed
    /// transport. Returns the number of packets handled.
    pub fn poll(&self) -> usize {
        let mut handled = 0;
        loop {
            let event = {
                let inner = self.inner.borrow();
                match inner.link.as_ref() {
                    Some(link) => try_next_event(link),
                    None => break,
                }
            };

            match event {
                Ok(TransportEvent::Packet(packet)) => {
                    handled += 1;
                    self.handle_packet(&packet);
                }
                Ok(TransportEvent::Closed(reason)) => {
                    self.transport_lost(reason);
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    self.transport_lost(None);
                    break;
                }
            }
        }

        // The transport may have drained since a write last hit a full channel.
        self.flush();
        handled
    }

    fn handle_packet(&self, packet: &[u8]) {
        let frames = match split_frames(packet) {
            Ok(frames) => frames,
            Err(err) => {
                warn!("Dropping malformed packet of {} bytes: {}", packet.len(), err);
                return;
            }
        };

        for frame in frames {
            match serde_json::from_slice::<InboundMessage>(frame) {
                Ok(InboundMessage::Response(response)) => {
                    self.resolve(response);
                }
                Ok(InboundMessage::Push(push)) => {
                    let handlers = self.inner.borrow().push_handlers.snapshot();
                    handlers.notify(&push);
                }
                Err(err) => warn!("Dropping undecodable frame: {}", err),
            }
        }
    }

    /// Hand a response to the request it answers. Returns false, and drops the
    /// response, when no request with its correlation id is outstanding.
    pub fn resolve(&self, response: Response) -> bool {
        let entry = self.inner.borrow_mut().in_flight.remove(&response.correlation_id);
        match entry {
            Some(in_flight) => {
                trace!("Response for '{}' ({})", in_flight.name, response.correlation_id);
                (in_flight.responder)(response.into_result());
                true
            }
            None => {
                debug!("Discarding unmatched response {}", response.correlation_id);
                false
            }
        }
    }

    /// Fail requests that waited longer than the request timeout.
    pub fn expire_requests(&self) -> usize {
        let now = self.clock.now();
        let timeout = self.settings.request_timeout;
        let expired: Vec<InFlight> = {
            let mut inner = self.inner.borrow_mut();
            let ids: Vec<CorrelationId> = inner
                .in_flight
                .iter()
                .filter(|(_, request)| now.duration_since(request.sent_at) >= timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.in_flight.remove(&id))
                .collect()
        };

        let count = expired.len();
        for request in expired {
            warn!("Request '{}' timed out after {:?}", request.name, timeout);
            (request.responder)(Err(ErrorInfo::timeout(format!(
                "no response to '{}' within {:?}",
                request.name, timeout
            ))));
        }
        count
    }

    fn transport_lost(&self, reason: Option<String>) {
        let (was_online, in_flight) = {
            let mut inner = self.inner.borrow_mut();
            let Some(link) = inner.link.take() else {
                return;
            };
            link.close();
            let was_online = inner.state == ReadyState::Open;
            inner.state = ReadyState::Closed;
            (was_online, std::mem::take(&mut inner.in_flight))
        };

        warn!(
            "Connection lost ({}), failing {} in-flight requests",
            reason.as_deref().unwrap_or("no reason given"),
            in_flight.len()
        );
        if was_online {
            self.notify_online(false);
        }
        for (_, request) in in_flight {
            (request.responder)(Err(ErrorInfo::network(format!(
                "connection lost before '{}' was answered",
                request.name
            ))));
        }
    }

    /// Tear the connection down for good: close the transport and fail every
    /// queued and in-flight request.
    pub fn shutdown(&self) {
        let (was_online, queue, in_flight) = {
            let mut inner = self.inner.borrow_mut();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            if let Some(link) = inner.link.take() {
                link.close();
            }
            let was_online = inner.state == ReadyState::Open;
            inner.state = ReadyState::Closed;
            (
                was_online,
                std::mem::take(&mut inner.queue),
                std::mem::take(&mut inner.in_flight),
            )
        };

        info!("Shutting connection down");
        if was_online {
            self.notify_online(false);
        }
        let responders = queue
            .into_iter()
            .map(|queued| queued.responder)
            .chain(in_flight.into_values().map(|request| request.responder));
        for responder in responders {
            responder(Err(ErrorInfo::network("client has been shut down")));
        }

        let mut inner = self.inner.borrow_mut();
        inner.push_handlers.clear();
        inner.online_handlers.clear();
    }

    fn notify_online(&self, online: bool) {
        let handlers = self.inner.borrow().online_handlers.snapshot();
        handlers.notify(&online);
    }
}
