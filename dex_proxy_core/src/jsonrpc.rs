//! JSON-RPC 2.0 envelope types used by the WebSocket transport (spec §6).
//!
//! REST handlers speak plain JSON bodies; only the WebSocket surface
//! (subscribe/unsubscribe/subscription push) is framed as JSON-RPC.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Box<RawValue>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorData {
    pub code: i64,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Either a successful result or an error, matching JSON-RPC's mutually
/// exclusive `result`/`error` members.
#[derive(Debug, Clone)]
pub enum JsonRpcResponseEnum<R> {
    Result(R),
    Error(JsonRpcErrorData),
}

impl<R> From<JsonRpcErrorData> for JsonRpcResponseEnum<R> {
    fn from(err: JsonRpcErrorData) -> Self {
        Self::Error(err)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcForwardedResponse {
    pub jsonrpc: &'static str,
    pub id: Box<RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorData>,
}

impl JsonRpcForwardedResponse {
    pub fn from_response_data<R: Serialize>(data: JsonRpcResponseEnum<R>, id: Box<RawValue>) -> Self {
        match data {
            JsonRpcResponseEnum::Result(r) => Self {
                jsonrpc: "2.0",
                id,
                result: Some(serde_json::to_value(r).expect("result must serialize")),
                error: None,
            },
            JsonRpcResponseEnum::Error(err) => Self {
                jsonrpc: "2.0",
                id,
                result: None,
                error: Some(err),
            },
        }
    }
}

/// A subscription push: not a reply to any particular request, so it's
/// framed as a JSON-RPC notification (no `id`) with `method: "subscription"`.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: SubscriptionParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionParams {
    pub subscription: String,
    pub result: serde_json::Value,
}

impl JsonRpcNotification {
    pub fn subscription(subscription_id: String, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: "subscription",
            params: SubscriptionParams {
                subscription: subscription_id,
                result,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_omits_result_field() {
        let resp = JsonRpcForwardedResponse::from_response_data::<()>(
            JsonRpcResponseEnum::Error(JsonRpcErrorData {
                code: -32000,
                message: "boom".into(),
                data: None,
            }),
            RawValue::from_string("1".into()).unwrap(),
        );

        let encoded = serde_json::to_string(&resp).unwrap();
        assert!(!encoded.contains("\"result\""));
        assert!(encoded.contains("\"error\""));
    }
}
