use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{EntityId, EntityKind, Fields};
use crate::error::ErrorInfo;

/// Per-connection request number echoed back by the server in its response.
///
/// Allocated from a monotonically increasing counter, so comparing two ids
/// tells which request was issued first.
pub type CorrelationId = u64;

/// Client -> server: run a named mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub correlation_id: CorrelationId,
    pub action: String,
    pub payload: Value,
    /// Deduplication key; replaying it must not repeat the mutation's effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
}

/// Client -> server: fetch the result of a query endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub correlation_id: CorrelationId,
    pub endpoint: String,
    pub params: Value,
}

/// Every message a client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Action(ActionRequest),
    Query(QueryRequest),
}

impl OutboundMessage {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            OutboundMessage::Action(action) => action.correlation_id,
            OutboundMessage::Query(query) => query.correlation_id,
        }
    }

    /// Short description for logs: the action or endpoint name.
    pub fn name(&self) -> &str {
        match self {
            OutboundMessage::Action(action) => &action.action,
            OutboundMessage::Query(query) => &query.endpoint,
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(self, OutboundMessage::Action(_))
    }
}

/// Server -> client: the answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub correlation_id: CorrelationId,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Response {
    pub fn success(correlation_id: CorrelationId, data: impl Into<Option<Value>>) -> Self {
        Self {
            correlation_id,
            ok: true,
            data: data.into(),
            error: None,
        }
    }

    pub fn failure(correlation_id: CorrelationId, error: ErrorInfo) -> Self {
        Self {
            correlation_id,
            ok: false,
            data: None,
            error: Some(error),
        }
    }

    /// `Ok(data)` for a successful response, the carried error otherwise.
    ///
    /// A failed response without an error body is reported as
    /// [`ErrorKind::Internal`](crate::ErrorKind::Internal).
    pub fn into_result(self) -> Result<Option<Value>, ErrorInfo> {
        if self.ok {
            Ok(self.data)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| ErrorInfo::internal("failed response without an error body")))
        }
    }
}

/// Server -> client: unsolicited state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Push {
    /// Partial field update; creates the entity when it is not cached yet.
    EntityUpdate {
        entity_type: EntityKind,
        id: EntityId,
        #[serde(default)]
        fields: Fields,
    },
    EntityRemoved {
        entity_type: EntityKind,
        id: EntityId,
    },
    /// Results of `endpoint` may be out of date. Without `params` every
    /// parameter set of the endpoint is affected.
    QueryInvalidated {
        endpoint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    /// An action response delivered through the push channel.
    ActionResult(Response),
}

/// Every message a client receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    Push(Push),
    Response(Response),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    #[test]
    fn action_request_matches_wire_contract() {
        let message = OutboundMessage::Action(ActionRequest {
            correlation_id: 7,
            action: "renameCompany".to_string(),
            payload: json!({ "id": 1, "name": "Acme" }),
            idempotency_token: Some("tok-1".to_string()),
        });
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "correlationId": 7,
                "action": "renameCompany",
                "payload": { "id": 1, "name": "Acme" },
                "idempotencyToken": "tok-1"
            })
        );
    }

    #[test]
    fn outbound_messages_are_told_apart_by_shape() {
        let query: OutboundMessage = serde_json::from_value(json!({
            "correlationId": 3,
            "endpoint": "factories",
            "params": { "id": 42 }
        }))
        .unwrap();
        assert!(matches!(query, OutboundMessage::Query(ref q) if q.endpoint == "factories"));

        let action: OutboundMessage = serde_json::from_value(json!({
            "correlationId": 4,
            "action": "demolish",
            "payload": { "id": 42 }
        }))
        .unwrap();
        assert!(action.is_action());
        assert_eq!(action.correlation_id(), 4);
    }

    #[test]
    fn inbound_pushes_and_responses_parse() {
        let push: InboundMessage = serde_json::from_value(json!({
            "type": "entityUpdate",
            "entityType": "factories",
            "id": 42,
            "fields": { "level": 3 }
        }))
        .unwrap();
        match push {
            InboundMessage::Push(Push::EntityUpdate { entity_type, id, fields }) => {
                assert_eq!(entity_type, EntityKind::Factories);
                assert_eq!(id, EntityId::Int(42));
                assert_eq!(fields.get("level"), Some(&json!(3)));
            }
            other => panic!("unexpected message {:?}", other),
        }

        let response: InboundMessage = serde_json::from_value(json!({
            "correlationId": 9,
            "ok": false,
            "error": { "kind": "conflict", "message": "already renamed" }
        }))
        .unwrap();
        match response {
            InboundMessage::Response(response) => {
                let error = response.into_result().unwrap_err();
                assert_eq!(error.kind, ErrorKind::Conflict);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn action_result_push_carries_a_response() {
        let push: InboundMessage = serde_json::from_value(json!({
            "type": "actionResult",
            "correlationId": 5,
            "ok": true,
            "data": { "created": 12 }
        }))
        .unwrap();
        assert_eq!(
            push,
            InboundMessage::Push(Push::ActionResult(Response::success(5, json!({ "created": 12 }))))
        );
    }
}
