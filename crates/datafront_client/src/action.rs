//! Named mutations with correlated responses and idempotency tokens.
//!
//! Every action name (optionally narrowed by a scope such as the target
//! entity id) owns one slot. All [`Action`] handles for the same slot share
//! its lifecycle, `idle -> running -> success | error`, so two views driving
//! one mutation agree on whether it is running and how it ended.
//!
//! A successful action never writes the entity store. The server reports its
//! effect through entity pushes, which the reconciler applies.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use datafront_common::{ErrorInfo, ErrorKind};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::connection::{Connection, Request, RequestResult};
use crate::observers::{ObserverId, Observers};

/// Identity of an action slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionKey {
    pub name: String,
    pub scope: Option<String>,
}

impl ActionKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: None,
        }
    }

    pub fn scoped(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Some(scope.into()),
        }
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}[{}]", self.name, scope),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionStatus {
    Idle,
    Running,
    Success,
    Error,
}

/// Failure of an action invocation as delivered to views.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{info}")]
pub struct ActionError {
    pub info: ErrorInfo,
    /// Sending the same payload again may succeed.
    pub retry: bool,
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        self.info.kind
    }
}

impl From<ErrorInfo> for ActionError {
    fn from(info: ErrorInfo) -> Self {
        let retry = info.is_retryable();
        Self { info, retry }
    }
}

/// Where the idempotency token of a run comes from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Idempotency {
    /// Mint a token, reusing the held one when retrying the same payload
    /// after a retryable failure.
    #[default]
    Auto,
    /// Use this token.
    Token(String),
    /// Send without a token.
    Disabled,
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub idempotency: Idempotency,
}

impl RunOptions {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            idempotency: Idempotency::Token(token.into()),
        }
    }

    pub fn without_token() -> Self {
        Self {
            idempotency: Idempotency::Disabled,
        }
    }
}

/// Observable state of an action slot.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionState {
    pub status: ActionStatus,
    pub error: Option<ActionError>,
    /// Data of the last successful response.
    pub result: Option<Value>,
    /// Token currently held for the slot.
    pub token: Option<String>,
}

impl ActionState {
    pub fn is_loading(&self) -> bool {
        self.status == ActionStatus::Running
    }
}

type Outcome = Result<Option<Value>, ActionError>;

#[derive(Default)]
struct CallInner {
    outcome: Option<Outcome>,
    on_success: Vec<Box<dyn FnOnce(Option<&Value>)>>,
    on_error: Vec<Box<dyn FnOnce(&ActionError)>>,
}

/// One invocation. Callbacks registered after it resolved run immediately.
///
/// Clones refer to the same invocation; a run that joined a running one
/// returns a clone of it.
#[derive(Clone, Default)]
pub struct ActionCall {
    inner: Rc<RefCell<CallInner>>,
}

impl fmt::Debug for ActionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionCall")
            .field("outcome", &self.inner.borrow().outcome)
            .finish()
    }
}

impl ActionCall {
    fn failed(error: ActionError) -> Self {
        let call = Self::default();
        call.resolve(Err(error));
        call
    }

    pub fn on_success(&self, callback: impl FnOnce(Option<&Value>) + 'static) -> &Self {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            if inner.outcome.is_none() {
                inner.on_success.push(Box::new(callback));
                return self;
            }
            inner.outcome.clone()
        };
        if let Some(Ok(data)) = outcome {
            callback(data.as_ref());
        }
        self
    }

    pub fn on_error(&self, callback: impl FnOnce(&ActionError) + 'static) -> &Self {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            if inner.outcome.is_none() {
                inner.on_error.push(Box::new(callback));
                return self;
            }
            inner.outcome.clone()
        };
        if let Some(Err(error)) = outcome {
            callback(&error);
        }
        self
    }

    /// `None` while the invocation is running.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.borrow().outcome.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.borrow().outcome.is_none()
    }

    fn same_call(&self, other: &ActionCall) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn resolve(&self, outcome: Outcome) {
        let (on_success, on_error) = {
            let mut inner = self.inner.borrow_mut();
            if inner.outcome.is_some() {
                return;
            }
            inner.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut inner.on_success),
                std::mem::take(&mut inner.on_error),
            )
        };
        match outcome {
            Ok(data) => on_success.into_iter().for_each(|callback| callback(data.as_ref())),
            Err(error) => on_error.into_iter().for_each(|callback| callback(&error)),
        }
    }
}

struct Running {
    call: ActionCall,
    payload: Value,
}

struct ActionSlot {
    status: ActionStatus,
    error: Option<ActionError>,
    result: Option<Value>,
    token: Option<String>,
    /// Payload the held token was minted for.
    token_payload: Option<Value>,
    running: Option<Running>,
    listeners: Observers<ActionState>,
}

impl ActionSlot {
    fn new() -> Self {
        Self {
            status: ActionStatus::Idle,
            error: None,
            result: None,
            token: None,
            token_payload: None,
            running: None,
            listeners: Observers::new(),
        }
    }

    fn state(&self) -> ActionState {
        ActionState {
            status: self.status,
            error: self.error.clone(),
            result: self.result.clone(),
            token: self.token.clone(),
        }
    }

    fn release_token(&mut self) {
        if let Some(token) = self.token.take() {
            trace!("Released idempotency token {}", token);
        }
        self.token_payload = None;
    }
}

struct Shared {
    slots: RefCell<HashMap<ActionKey, ActionSlot>>,
    connection: Connection,
}

/// Sends actions and tracks their lifecycle per slot.
///
/// Cloning yields another handle to the same dispatcher.
#[derive(Clone)]
pub struct ActionDispatcher {
    shared: Rc<Shared>,
}

impl fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionDispatcher [{} slots]", self.shared.slots.borrow().len())
    }
}

impl ActionDispatcher {
    pub fn new(connection: Connection) -> Self {
        Self {
            shared: Rc::new(Shared {
                slots: RefCell::new(HashMap::new()),
                connection,
            }),
        }
    }

    /// Handle to the unscoped slot of `name`.
    pub fn action(&self, name: impl Into<String>) -> Action {
        self.handle(ActionKey::new(name))
    }

    /// Handle to the slot of `name` narrowed to `scope`.
    pub fn action_scoped(&self, name: impl Into<String>, scope: impl Into<String>) -> Action {
        self.handle(ActionKey::scoped(name, scope))
    }

    fn handle(&self, key: ActionKey) -> Action {
        self.shared
            .slots
            .borrow_mut()
            .entry(key.clone())
            .or_insert_with(ActionSlot::new);
        Action {
            dispatcher: self.clone(),
            key,
        }
    }

    /// Shorthand for `action(name).run(payload, options)`.
    pub fn run<P: Serialize>(&self, name: impl Into<String>, payload: &P, options: RunOptions) -> ActionCall {
        self.action(name).run(payload, options)
    }

    pub fn state(&self, key: &ActionKey) -> ActionState {
        self.shared
            .slots
            .borrow()
            .get(key)
            .map_or_else(|| ActionSlot::new().state(), ActionSlot::state)
    }

    fn start(&self, key: &ActionKey, payload: Value, options: RunOptions) -> ActionCall {
        let (call, request) = {
            let mut slots = self.shared.slots.borrow_mut();
            let slot = slots.entry(key.clone()).or_insert_with(ActionSlot::new);

            if let Some(running) = &slot.running {
                if running.payload == payload {
                    debug!("Action {} is already running with this payload, joining it", key);
                    return running.call.clone();
                }
                warn!("Action {} is already running with a different payload", key);
                return ActionCall::failed(ActionError::from(ErrorInfo::new(
                    ErrorKind::Conflict,
                    format!("action {} is already running", key),
                )));
            }

            let token = match options.idempotency {
                Idempotency::Token(token) => Some(token),
                Idempotency::Disabled => None,
                Idempotency::Auto => match (&slot.token, &slot.token_payload) {
                    (Some(token), Some(previous)) if *previous == payload => {
                        debug!("Retrying action {} with token {}", key, token);
                        Some(token.clone())
                    }
                    _ => Some(Uuid::new_v4().to_string()),
                },
            };
            if token != slot.token {
                slot.release_token();
            }
            slot.token = token.clone();
            slot.token_payload = token.as_ref().map(|_| payload.clone());

            let call = ActionCall::default();
            slot.status = ActionStatus::Running;
            slot.error = None;
            slot.running = Some(Running {
                call: call.clone(),
                payload: payload.clone(),
            });
            info!("Running action {}", key);

            let request = Request::Action {
                action: key.name.clone(),
                payload,
                idempotency_token: token,
            };
            (call, request)
        };

        self.notify(key);

        let dispatcher = self.clone();
        let response_key = key.clone();
        let response_call = call.clone();
        self.shared.connection.send_with(
            request,
            Box::new(move |result| dispatcher.complete(&response_key, &response_call, result)),
        );
        call
    }

    fn complete(&self, key: &ActionKey, call: &ActionCall, result: RequestResult) {
        let outcome: Outcome = result.map_err(ActionError::from);
        {
            let mut slots = self.shared.slots.borrow_mut();
            if let Some(slot) = slots.get_mut(key)
                && slot
                    .running
                    .as_ref()
                    .is_some_and(|running| running.call.same_call(call))
            {
                slot.running = None;
                match &outcome {
                    Ok(data) => {
                        info!("Action {} succeeded", key);
                        slot.status = ActionStatus::Success;
                        slot.result = data.clone();
                        slot.error = None;
                        slot.release_token();
                    }
                    Err(error) => {
                        warn!("Action {} failed: {}", key, error);
                        slot.status = ActionStatus::Error;
                        slot.error = Some(error.clone());
                        if !error.retry {
                            slot.release_token();
                        }
                    }
                }
            }
        }

        self.notify(key);
        call.resolve(outcome);
    }

    /// Return an idle slot to `Idle`, forgetting its error, result and token.
    fn reset(&self, key: &ActionKey) -> bool {
        let reset = {
            let mut slots = self.shared.slots.borrow_mut();
            match slots.get_mut(key) {
                Some(slot) if slot.running.is_none() => {
                    slot.status = ActionStatus::Idle;
                    slot.error = None;
                    slot.result = None;
                    slot.release_token();
                    true
                }
                _ => false,
            }
        };
        if reset {
            self.notify(key);
        }
        reset
    }

    fn subscribe(&self, key: &ActionKey, handler: impl Fn(&ActionState) + 'static) -> ObserverId {
        self.shared
            .slots
            .borrow_mut()
            .entry(key.clone())
            .or_insert_with(ActionSlot::new)
            .listeners
            .insert(Rc::new(handler))
    }

    fn unsubscribe(&self, key: &ActionKey, id: ObserverId) -> bool {
        self.shared
            .slots
            .borrow_mut()
            .get_mut(key)
            .is_some_and(|slot| slot.listeners.remove(id))
    }

    fn notify(&self, key: &ActionKey) {
        let (state, listeners) = {
            let slots = self.shared.slots.borrow();
            let Some(slot) = slots.get(key) else {
                return;
            };
            (slot.state(), slot.listeners.snapshot())
        };
        listeners.notify(&state);
    }
}

/// Handle to one action slot.
#[derive(Clone)]
pub struct Action {
    dispatcher: ActionDispatcher,
    key: ActionKey,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action [{}]", self.key)
    }
}

impl Action {
    pub fn key(&self) -> &ActionKey {
        &self.key
    }

    /// Send the action. While the slot is running, an equal payload joins the
    /// running invocation and a different one fails with a conflict.
    pub fn run<P: Serialize>(&self, payload: &P, options: RunOptions) -> ActionCall {
        match serde_json::to_value(payload) {
            Ok(payload) => self.dispatcher.start(&self.key, payload, options),
            Err(err) => ActionCall::failed(ActionError::from(ErrorInfo::internal(format!(
                "payload of {} is not serializable: {}",
                self.key, err
            )))),
        }
    }

    pub fn state(&self) -> ActionState {
        self.dispatcher.state(&self.key)
    }

    pub fn status(&self) -> ActionStatus {
        self.state().status
    }

    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    pub fn error(&self) -> Option<ActionError> {
        self.state().error
    }

    pub fn subscribe(&self, handler: impl Fn(&ActionState) + 'static) -> ObserverId {
        self.dispatcher.subscribe(&self.key, handler)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.dispatcher.unsubscribe(&self.key, id)
    }

    /// Back to idle. Refused, returning false, while the action is running.
    pub fn reset(&self) -> bool {
        self.dispatcher.reset(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DatafrontSettings;
    use crate::transport::{MemoryPeer, memory_link};
    use datafront_common::{OutboundMessage, Response};
    use serde_json::json;
    use std::cell::Cell;

    fn dispatcher() -> (ActionDispatcher, Connection, MemoryPeer) {
        let connection = Connection::new(
            Rc::new(DatafrontSettings::default()),
            Rc::new(ManualClock::new()),
        );
        let (link, peer) = memory_link(16);
        connection.attach(link);
        (ActionDispatcher::new(connection.clone()), connection, peer)
    }

    fn sent_tokens(peer: &MemoryPeer) -> Vec<(u64, Option<String>)> {
        peer.drain()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Action(action) => Some((action.correlation_id, action.idempotency_token)),
                OutboundMessage::Query(_) => None,
            })
            .collect()
    }

    fn respond(connection: &Connection, response: Response) {
        assert!(connection.resolve(response));
    }

    #[test]
    fn lifecycle_runs_to_success() {
        let (dispatcher, connection, peer) = dispatcher();
        let rename = dispatcher.action("renameCompany");
        let statuses = Rc::new(RefCell::new(Vec::new()));
        {
            let statuses = statuses.clone();
            rename.subscribe(move |state| statuses.borrow_mut().push(state.status));
        }

        let succeeded = Rc::new(Cell::new(false));
        {
            let succeeded = succeeded.clone();
            rename
                .run(&json!({ "id": 1, "name": "Acme" }), RunOptions::default())
                .on_success(move |_| succeeded.set(true));
        }
        assert!(rename.is_loading());

        let (id, token) = sent_tokens(&peer).remove(0);
        assert!(token.is_some());
        respond(&connection, Response::success(id, None));

        assert!(succeeded.get());
        assert_eq!(
            *statuses.borrow(),
            vec![ActionStatus::Running, ActionStatus::Success]
        );
        assert_eq!(rename.state().token, None);
    }

    #[test]
    fn retryable_failure_keeps_token_for_same_payload() {
        let (dispatcher, connection, peer) = dispatcher();
        let demolish = dispatcher.action_scoped("demolish", "factories/42");
        let payload = json!({ "id": 42 });

        demolish.run(&payload, RunOptions::default());
        let (id, first) = sent_tokens(&peer).remove(0);
        respond(
            &connection,
            Response::failure(id, ErrorInfo::new(ErrorKind::Transient, "busy")),
        );

        let error = demolish.error().unwrap();
        assert!(error.retry);
        assert_eq!(demolish.state().token, first);

        demolish.run(&payload, RunOptions::default());
        let (_, second) = sent_tokens(&peer).remove(0);
        assert_eq!(first, second);
    }

    #[test]
    fn terminal_failure_releases_token() {
        let (dispatcher, connection, peer) = dispatcher();
        let rename = dispatcher.action("renameCompany");
        let payload = json!({ "id": 1, "name": "" });

        let errors = Rc::new(RefCell::new(Vec::new()));
        {
            let errors = errors.clone();
            rename
                .run(&payload, RunOptions::default())
                .on_error(move |error| errors.borrow_mut().push(error.clone()));
        }
        let (id, first) = sent_tokens(&peer).remove(0);
        respond(
            &connection,
            Response::failure(
                id,
                ErrorInfo::new(ErrorKind::Validation, "name required")
                    .with_details(json!({ "name": "required" })),
            ),
        );

        assert_eq!(errors.borrow().len(), 1);
        assert!(!errors.borrow()[0].retry);
        assert_eq!(errors.borrow()[0].info.details, Some(json!({ "name": "required" })));
        assert_eq!(rename.state().token, None);

        rename.run(&payload, RunOptions::default());
        let (_, second) = sent_tokens(&peer).remove(0);
        assert_ne!(first, second);
    }

    #[test]
    fn changed_payload_mints_a_new_token() {
        let (dispatcher, connection, peer) = dispatcher();
        let rebalance = dispatcher.action("rebalance");

        rebalance.run(&json!({ "ratio": 1 }), RunOptions::default());
        let (id, first) = sent_tokens(&peer).remove(0);
        respond(&connection, Response::failure(id, ErrorInfo::network("lost")));

        rebalance.run(&json!({ "ratio": 2 }), RunOptions::default());
        let (_, second) = sent_tokens(&peer).remove(0);
        assert_ne!(first, second);
    }

    #[test]
    fn different_payload_while_running_conflicts() {
        let (dispatcher, _connection, peer) = dispatcher();
        let rename = dispatcher.action("renameCompany");

        rename.run(&json!({ "name": "A" }), RunOptions::default());
        let second = rename.run(&json!({ "name": "B" }), RunOptions::default());

        let error = second.outcome().unwrap().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Conflict);
        assert!(rename.is_loading());
        assert_eq!(sent_tokens(&peer).len(), 1);
    }

    #[test]
    fn explicit_tokens_and_disabled_tokens_are_honoured() {
        let (dispatcher, _connection, peer) = dispatcher();

        dispatcher.run("create", &json!({ "kind": "base" }), RunOptions::with_token("mine"));
        dispatcher.run("ping", &json!({}), RunOptions::without_token());

        let tokens: Vec<_> = sent_tokens(&peer).into_iter().map(|(_, token)| token).collect();
        assert_eq!(tokens, vec![Some("mine".to_string()), None]);
    }

    #[test]
    fn reset_is_refused_while_running() {
        let (dispatcher, connection, peer) = dispatcher();
        let create = dispatcher.action("createBase");

        create.run(&json!({ "world": 1 }), RunOptions::default());
        assert!(!create.reset());

        let (id, _) = sent_tokens(&peer).remove(0);
        respond(&connection, Response::success(id, json!({ "id": 9 })));
        assert_eq!(create.state().result, Some(json!({ "id": 9 })));

        assert!(create.reset());
        assert_eq!(create.status(), ActionStatus::Idle);
        assert_eq!(create.state().result, None);
    }
}
