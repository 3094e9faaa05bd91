use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{CoreError, InvocationId, RequestId};

/// Everything a broker carries between two nodes. Encoding is up to the broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", content = "body", rename_all = "snake_case")]
pub enum Message {
    Invocation(InvocationMessage),
    Result(ResultMessage),
}

/// Client to server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvocationMessage {
    Invoke {
        invocation_id: InvocationId,
        method: String,
        parameter: Value,
    },
    Cancel {
        invocation_id: InvocationId,
    },
    Response {
        invocation_id: InvocationId,
        request_id: RequestId,
        response: Value,
    },
}

/// Server to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultMessage {
    Finished {
        invocation_id: InvocationId,
        result: Value,
    },
    Exception {
        invocation_id: InvocationId,
        error: CoreError,
    },
    InterimResponse {
        invocation_id: InvocationId,
        response: Value,
    },
    InterimRequest {
        invocation_id: InvocationId,
        request_id: RequestId,
        request: Value,
    },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{InvocationMessage, Message};
    use crate::models::InvocationId;

    #[test]
    fn invoke_message_is_tagged_by_direction_and_type() {
        let message = Message::Invocation(InvocationMessage::Invoke {
            invocation_id: InvocationId("abc".to_string()),
            method: "echo".to_string(),
            parameter: json!(42),
        });

        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded["direction"], "invocation");
        assert_eq!(encoded["body"]["type"], "invoke");
        assert_eq!(encoded["body"]["invocation_id"], "abc");
    }
}
