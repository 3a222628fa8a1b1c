//! The JSON-RPC WebSocket transport (spec §4.1, §6): `/private/ws`.
//!
//! Grounded on the teacher's `eth_subscribe` push loop (`app.rs`, serializing
//! a notification into `Message::Text` per event) and the Subscription
//! Registry's per-connection `flume` queue; here the inbound half also
//! dispatches `subscribe`/`unsubscribe` JSON-RPC calls instead of only
//! pushing events outward.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Extension;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::value::RawValue;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::app::DexProxyApp;
use crate::jsonrpc::{JsonRpcErrorData, JsonRpcForwardedResponse, JsonRpcRequest, JsonRpcResponseEnum};
use crate::subscriptions::{ConnectionHandle, SubscribeOutcome};

/// Outbound queue depth per connection before it's considered a slow
/// subscriber and disconnected (spec §5 "per-WS send queues are bounded").
const OUTBOUND_QUEUE_DEPTH: usize = 1024;

/// Broadcast shutdown signal shared by every open connection (spec §5:
/// "closes... all WS connections with a 'server shutdown' reason").
#[derive(Clone)]
pub struct ShutdownSignal(pub broadcast::Sender<()>);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(app): Extension<Arc<DexProxyApp>>,
    Extension(shutdown): Extension<ShutdownSignal>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app, shutdown.0.subscribe()))
}

async fn handle_socket(socket: WebSocket, app: Arc<DexProxyApp>, mut shutdown_rx: broadcast::Receiver<()>) {
    let conn_id = Uuid::new_v4();
    app.subscriptions.register_connection(conn_id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, outbound_rx) = flume::bounded::<Message>(OUTBOUND_QUEUE_DEPTH);
    let handle = ConnectionHandle::new(conn_id, outbound_tx);

    let mut forward_task = tokio::spawn(async move {
        while let Ok(msg) = outbound_rx.recv_async().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = dispatch_frame(&app, &handle, &text) {
                            if !handle.send_text(reply) {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(?err, %conn_id, "websocket read error");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                handle.send_close(1001, "server shutdown");
                break;
            }
            _ = &mut forward_task => break,
        }
    }

    app.subscriptions.drop_connection(conn_id);
    forward_task.abort();
    debug!(%conn_id, "websocket connection closed");
}

/// Parses one inbound frame and dispatches `subscribe`/`unsubscribe`.
/// Returns the JSON text to send back, if any (malformed frames that can't
/// even be parsed enough to recover an `id` are dropped rather than closing
/// the connection, per spec §4.1 "unknown route -> 400" being a REST-only
/// concept; the WS transport stays in-band per spec §7 "unknown method ...
/// the connection is not closed").
fn dispatch_frame(app: &DexProxyApp, handle: &ConnectionHandle, text: &str) -> Option<String> {
    let request: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(err) => {
            trace!(?err, "malformed json-rpc frame");
            return Some(encode(
                JsonRpcResponseEnum::Error(JsonRpcErrorData {
                    code: -32700,
                    message: "parse error".into(),
                    data: None,
                }),
                null_id(),
            ));
        }
    };

    let response = match request.method.as_str() {
        "subscribe" => handle_subscribe(app, handle, &request.params),
        "unsubscribe" => handle_unsubscribe(app, handle, &request.params),
        other => {
            trace!(method = other, "unknown json-rpc method");
            JsonRpcResponseEnum::Error(JsonRpcErrorData {
                code: -32601,
                message: format!("unknown method {other}").into(),
                data: None,
            })
        }
    };

    Some(encode(response, request.id))
}

#[derive(serde::Deserialize)]
struct ChannelParams {
    channel: String,
}

fn handle_subscribe(app: &DexProxyApp, handle: &ConnectionHandle, params: &serde_json::Value) -> JsonRpcResponseEnum<Vec<String>> {
    let Ok(params) = serde_json::from_value::<ChannelParams>(params.clone()) else {
        return JsonRpcResponseEnum::Error(JsonRpcErrorData {
            code: -32602,
            message: "expected {\"channel\": string}".into(),
            data: None,
        });
    };

    match app.subscriptions.subscribe(handle.clone(), &params.channel) {
        Ok(SubscribeOutcome::Ack | SubscribeOutcome::AlreadySubscribed) => JsonRpcResponseEnum::Result(vec![params.channel]),
        Err(reason) => JsonRpcResponseEnum::Error(JsonRpcErrorData {
            code: -32602,
            message: reason.into(),
            data: None,
        }),
    }
}

fn handle_unsubscribe(app: &DexProxyApp, handle: &ConnectionHandle, params: &serde_json::Value) -> JsonRpcResponseEnum<Vec<String>> {
    let Ok(params) = serde_json::from_value::<ChannelParams>(params.clone()) else {
        return JsonRpcResponseEnum::Error(JsonRpcErrorData {
            code: -32602,
            message: "expected {\"channel\": string}".into(),
            data: None,
        });
    };

    app.subscriptions.unsubscribe(handle.id, &params.channel);
    JsonRpcResponseEnum::Result(vec![params.channel])
}

fn null_id() -> Box<RawValue> {
    RawValue::from_string("null".to_string()).expect("valid raw json")
}

fn encode<R: serde::Serialize>(data: JsonRpcResponseEnum<R>, id: Box<RawValue>) -> String {
    let response = JsonRpcForwardedResponse::from_response_data(data, id);
    serde_json::to_string(&response).expect("response always serializes")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::adapter::mock::MockAdapter;
    use crate::app::DexProxyApp;
    use crate::config::{AppConfig, PollerConfig};

    fn app() -> Arc<DexProxyApp> {
        let mock = Arc::new(MockAdapter::new("drift", vec!["ORDER".into(), "TRADE".into()]));
        let mut adapters: std::collections::HashMap<String, Arc<dyn crate::adapter::DexAdapter>> = std::collections::HashMap::new();
        adapters.insert("drift".into(), mock);

        Arc::new(DexProxyApp::new(
            AppConfig {
                listen_addr: "127.0.0.1:0".into(),
                redis: None,
                poller: PollerConfig::default(),
                venues: std::collections::HashMap::new(),
            },
            adapters,
            None,
        ))
    }

    fn handle() -> (ConnectionHandle, flume::Receiver<Message>) {
        let (tx, rx) = flume::bounded(8);
        (ConnectionHandle::new(Uuid::new_v4(), tx), rx)
    }

    #[test]
    fn malformed_frame_returns_parse_error() {
        let app = app();
        let (handle, _rx) = handle();

        let reply = dispatch_frame(&app, &handle, "not json").unwrap();
        assert!(reply.contains("-32700"));
    }

    #[test]
    fn unknown_method_returns_method_not_found_without_dropping_the_connection() {
        let app = app();
        let (handle, _rx) = handle();
        app.subscriptions.register_connection(handle.id);

        let frame = r#"{"jsonrpc":"2.0","id":1,"method":"do_a_flip","params":{}}"#;
        let reply = dispatch_frame(&app, &handle, frame).unwrap();
        assert!(reply.contains("-32601"));
    }

    #[test]
    fn subscribe_to_known_channel_acks_with_channel_name() {
        let app = app();
        let (handle, _rx) = handle();
        app.subscriptions.register_connection(handle.id);

        let frame = r#"{"jsonrpc":"2.0","id":1,"method":"subscribe","params":{"channel":"ORDER"}}"#;
        let reply = dispatch_frame(&app, &handle, frame).unwrap();
        assert!(reply.contains("\"result\":[\"ORDER\"]"));
    }

    #[test]
    fn subscribe_to_unknown_channel_is_an_invalid_params_error() {
        let app = app();
        let (handle, _rx) = handle();
        app.subscriptions.register_connection(handle.id);

        let frame = r#"{"jsonrpc":"2.0","id":1,"method":"subscribe","params":{"channel":"BOGUS"}}"#;
        let reply = dispatch_frame(&app, &handle, frame).unwrap();
        assert!(reply.contains("-32602"));
        assert!(reply.contains("Channel BOGUS does not exist"));
    }

    #[test]
    fn unsubscribe_is_idempotent_and_acks() {
        let app = app();
        let (handle, _rx) = handle();
        app.subscriptions.register_connection(handle.id);

        let frame = r#"{"jsonrpc":"2.0","id":1,"method":"unsubscribe","params":{"channel":"ORDER"}}"#;
        let reply = dispatch_frame(&app, &handle, frame).unwrap();
        assert!(reply.contains("\"result\":[\"ORDER\"]"));
    }
}
