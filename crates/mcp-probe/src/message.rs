use common::{RpcId, RpcNotification, RpcRequest, RpcResponse};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum OutboundMessage {
    Request(RpcRequest),
    Notification(RpcNotification),
}

impl OutboundMessage {
    pub fn request(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(RpcRequest::new(id, method, params))
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(RpcNotification::new(method, params))
    }

    pub fn method(&self) -> &str {
        match self {
            Self::Request(req) => &req.method,
            Self::Notification(note) => &note.method,
        }
    }

    pub const fn id(&self) -> Option<&RpcId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Notification(_) => None,
        }
    }
}

/// An inbound JSON value sorted into one of the JSON-RPC shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Request(RpcRequest),
    Response(RpcResponse),
    Notification(RpcNotification),
    Other(Value),
}

impl InboundMessage {
    pub fn classify(value: Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::Other(value);
        };
        let has_method = object.contains_key("method");
        let has_id = object.get("id").is_some_and(|id| !id.is_null());
        let has_outcome = object.contains_key("result") || object.contains_key("error");

        let parsed = if has_method && has_id {
            serde_json::from_value(value.clone()).ok().map(Self::Request)
        } else if has_method {
            serde_json::from_value(value.clone())
                .ok()
                .map(Self::Notification)
        } else if has_outcome {
            serde_json::from_value(value.clone()).ok().map(Self::Response)
        } else {
            None
        };
        parsed.unwrap_or(Self::Other(value))
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Notification(_) => "notification",
            Self::Other(_) => "other",
        }
    }

    pub const fn response_id(&self) -> Option<&RpcId> {
        match self {
            Self::Response(resp) => resp.id.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn classifies_all_shapes() {
        let response = InboundMessage::classify(json!({"jsonrpc":"2.0","id":1,"result":{}}));
        assert_eq!(response.kind(), "response");
        assert_eq!(response.response_id(), Some(&RpcId::Number(1)));

        let note = InboundMessage::classify(
            json!({"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}),
        );
        assert_eq!(note.kind(), "notification");

        let request = InboundMessage::classify(json!({"jsonrpc":"2.0","id":"r1","method":"ping"}));
        assert_eq!(request.kind(), "request");

        let other = InboundMessage::classify(json!([1, 2, 3]));
        assert_eq!(other.kind(), "other");
    }

    #[test]
    fn error_response_with_null_id_is_a_response() {
        let msg = InboundMessage::classify(
            json!({"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"parse error"}}),
        );
        match msg {
            InboundMessage::Response(resp) => {
                assert!(resp.id.is_none());
                assert!(resp.is_error());
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn outbound_request_serializes_flat() {
        let msg = OutboundMessage::request(7, "tools/list", None);
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value, json!({"jsonrpc":"2.0","id":7,"method":"tools/list"}));
        assert_eq!(msg.method(), "tools/list");
        assert_eq!(msg.id(), Some(&RpcId::Number(7)));
    }
}
