//! WebSocket control plane: request/response RPC plus the event pump.
//!
//! Framing is one JSON object per text frame.  Requests are
//! `{type:"req:<method>", id, ts, payload}`; responses echo the id as
//! `res:<method>` with `ok`/`err`; server-pushed events are `evt:<type>`
//! frames carrying `{run_id, seq, …}` payloads.
//!
//! A new connection receives all events.  Once the client requests
//! `runs.tail` with a run id, the connection's live stream narrows to the
//! subscribed run ids (the historical events in the response payload are
//! independent of this filter).

use std::collections::HashSet;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{domain::Event, gateway::Gateway, security::verify_client_key};

use super::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

// ─── Frame shapes ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsRequest {
    #[serde(rename = "type")]
    request_type: String,
    id: Option<String>,
    #[allow(dead_code)]
    ts: Option<Value>,
    #[serde(default)]
    payload: Value,
}

/// A structured RPC failure: `{code, message}`.
struct WsError {
    code: &'static str,
    message: String,
}

impl WsError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new("bad_request", message)
    }
}

fn ws_msg(frame_type: &str, id: Option<String>, payload: Value, err: Option<&WsError>) -> Value {
    let mut msg = json!({
        "type": frame_type,
        "id": id.unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
        "ts": Utc::now().to_rfc3339(),
        "payload": payload,
    });
    if frame_type.starts_with("res:") {
        msg["ok"] = json!(err.is_none());
        msg["err"] = match err {
            Some(e) => json!({ "code": e.code, "message": e.message }),
            None => Value::Null,
        };
    }
    msg
}

fn event_frame(event: &Event) -> Value {
    let mut payload = json!({ "run_id": event.run_id, "seq": event.seq });
    if let (Value::Object(target), Value::Object(extra)) = (&mut payload, event.payload.clone()) {
        target.extend(extra);
    }
    json!({
        "type": format!("evt:{}", event.event_type.as_str()),
        "id": format!("evt_{}", event.seq),
        "ts": event.ts.to_rfc3339(),
        "payload": payload,
    })
}

// ─── Connection state ─────────────────────────────────────────────────────────

/// Per-connection subscription filter.  Empty set → all events.
#[derive(Default)]
struct ClientState {
    subscribed_run_ids: HashSet<String>,
}

impl ClientState {
    fn wants(&self, event: &Event) -> bool {
        if self.subscribed_run_ids.is_empty() {
            return true;
        }
        event
            .run_id
            .as_ref()
            .is_some_and(|id| self.subscribed_run_ids.contains(id))
    }
}

// ─── Upgrade handler ──────────────────────────────────────────────────────────

/// WebSocket upgrade at the configured ws path; rejects bad credentials
/// before the upgrade completes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let provided = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if !verify_client_key(state.gateway.settings(), provided) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_connection(socket, state.gateway))
        .into_response()
}

async fn serve_connection(mut socket: WebSocket, gateway: std::sync::Arc<Gateway>) {
    gateway.metrics().ws_connections.inc();
    let sub = gateway.bus().subscribe();
    let mut client = ClientState::default();

    loop {
        tokio::select! {
            // Event pump: forward filtered bus events.
            event = sub.recv() => {
                let Some(event) = event else { break };
                if !client.wants(&event) {
                    continue;
                }
                let frame = event_frame(&event);
                if socket.send(Message::Text(frame.to_string())).await.is_err() {
                    break; // client disconnected
                }
            }
            // RPC: parse and dispatch client frames.
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let response = handle_frame(&gateway, &mut client, &text).await;
                        if socket.send(Message::Text(response.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    gateway.bus().unsubscribe(&sub);
    gateway.metrics().ws_connections.dec();
}

// ─── Request handling ─────────────────────────────────────────────────────────

async fn handle_frame(
    gateway: &std::sync::Arc<Gateway>,
    client: &mut ClientState,
    raw: &str,
) -> Value {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => {
            return ws_msg(
                "res:error",
                None,
                json!({}),
                Some(&WsError::new("bad_json", "invalid json")),
            );
        }
    };

    let request: WsRequest = match serde_json::from_value(parsed.clone()) {
        Ok(r) => r,
        Err(e) => {
            let id = parsed
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_owned);
            return ws_msg(
                "res:error",
                id,
                json!({}),
                Some(&WsError::bad_request(e.to_string())),
            );
        }
    };

    let Some(method) = request.request_type.strip_prefix("req:") else {
        return ws_msg(
            "res:error",
            request.id,
            json!({}),
            Some(&WsError::bad_request(format!(
                "expected req:* frame, got {}",
                request.request_type
            ))),
        );
    };

    // Side effect: tailing a specific run also narrows this connection's
    // live event stream to the subscribed runs.
    if method == "runs.tail"
        && let Some(run_id) = request.payload.get("run_id").and_then(Value::as_str)
    {
        client.subscribed_run_ids.insert(run_id.to_owned());
    }

    gateway
        .metrics()
        .rpc_requests
        .with_label_values(&[method])
        .inc();

    let response_type = format!("res:{method}");
    match dispatch(gateway, method, &request.payload).await {
        Ok(payload) => ws_msg(&response_type, request.id, payload, None),
        Err(err) => {
            gateway
                .metrics()
                .rpc_errors
                .with_label_values(&[method, err.code])
                .inc();
            tracing::warn!(method, code = err.code, message = %err.message, "rpc failed");
            ws_msg(&response_type, request.id, json!({}), Some(&err))
        }
    }
}

async fn dispatch(
    gateway: &std::sync::Arc<Gateway>,
    method: &str,
    payload: &Value,
) -> Result<Value, WsError> {
    match method {
        "hello" => {
            let settings = gateway.settings();
            Ok(json!({
                "server": "agent-gateway",
                "version": env!("CARGO_PKG_VERSION"),
                "instance_id": settings.instance_id,
                "features": ["rpc_ws", "event_stream", "plugins", "sqlite", "deny_by_default"],
            }))
        }
        "channels.list" => {
            let channels = gateway.list_channels().await.map_err(internal)?;
            Ok(json!({ "channels": channels }))
        }
        "chat.list" => {
            let channel_id = payload.get("channel_id").and_then(Value::as_str);
            let chats = gateway.list_chats(channel_id).await.map_err(internal)?;
            Ok(json!({ "chats": chats }))
        }
        "chat.messages" => {
            let chat_id = require_str(payload, "chat_id")?;
            let limit = payload
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(50) as usize;
            let messages = gateway
                .list_messages(chat_id, limit)
                .await
                .map_err(internal)?;
            Ok(json!({ "messages": messages }))
        }
        "agent.run" => {
            let chat_id = require_str(payload, "chat_id")?;
            let channel_id = require_str(payload, "channel_id")?;
            let prompt = require_str(payload, "prompt")?;
            let requested_by = payload
                .get("requested_by")
                .and_then(Value::as_str)
                .unwrap_or("client");

            let run = gateway
                .start_run(chat_id, channel_id, requested_by, prompt)
                .await
                .map_err(internal)?;
            Ok(json!({ "run": run }))
        }
        "runs.tail" => {
            let run_id = payload.get("run_id").and_then(Value::as_str);
            let after_seq = payload.get("after_seq").and_then(Value::as_u64);
            let events = gateway
                .tail_events(run_id, after_seq)
                .await
                .map_err(internal)?;
            Ok(json!({ "events": events }))
        }
        "config.get" => Ok(gateway.config_snapshot()),
        "config.set" => {
            if let Some(policy) = payload.get("policy") {
                gateway.apply_policy_update(policy);
            }
            Ok(json!({ "ok": true }))
        }
        "doctor.audit" => Ok(gateway.doctor_audit()),
        "approval.grant" => {
            let run_id = require_str(payload, "run_id")?;
            Ok(json!({ "ok": gateway.grant_approval(run_id) }))
        }
        other => Err(WsError::new("no_such_method", format!("req:{other}"))),
    }
}

fn require_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, WsError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| WsError::bad_request(format!("missing required field: {key}")))
}

fn internal(err: impl std::fmt::Display) -> WsError {
    tracing::error!(error = %err, "rpc handler failed");
    WsError::new("internal", "rpc_failed")
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Settings,
        domain::EventType,
        persistence::{Repository, SqliteRepository},
    };
    use std::sync::Arc;

    fn gateway() -> Arc<Gateway> {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::in_memory().unwrap());
        let settings = Settings {
            require_client_auth: false,
            ..Settings::default()
        };
        Gateway::new(settings, repo)
    }

    fn frame(method: &str, payload: Value) -> String {
        json!({
            "type": format!("req:{method}"),
            "id": "req-1",
            "ts": Utc::now().to_rfc3339(),
            "payload": payload,
        })
        .to_string()
    }

    #[tokio::test]
    async fn hello_responds_ok() {
        let gw = gateway();
        let mut client = ClientState::default();
        let res = handle_frame(&gw, &mut client, &frame("hello", json!({}))).await;
        assert_eq!(res["type"], "res:hello");
        assert_eq!(res["ok"], true);
        assert_eq!(res["id"], "req-1");
        assert_eq!(res["payload"]["server"], "agent-gateway");
    }

    #[tokio::test]
    async fn unknown_method_is_no_such_method() {
        let gw = gateway();
        let mut client = ClientState::default();
        let res = handle_frame(&gw, &mut client, &frame("bogus.method", json!({}))).await;
        assert_eq!(res["ok"], false);
        assert_eq!(res["err"]["code"], "no_such_method");
    }

    #[tokio::test]
    async fn invalid_json_is_bad_json() {
        let gw = gateway();
        let mut client = ClientState::default();
        let res = handle_frame(&gw, &mut client, "{not json").await;
        assert_eq!(res["type"], "res:error");
        assert_eq!(res["err"]["code"], "bad_json");
    }

    #[tokio::test]
    async fn missing_required_field_is_bad_request() {
        let gw = gateway();
        let mut client = ClientState::default();
        let res = handle_frame(&gw, &mut client, &frame("chat.messages", json!({}))).await;
        assert_eq!(res["ok"], false);
        assert_eq!(res["err"]["code"], "bad_request");
        assert!(
            res["err"]["message"]
                .as_str()
                .unwrap()
                .contains("chat_id")
        );
    }

    #[tokio::test]
    async fn non_request_frame_is_rejected() {
        let gw = gateway();
        let mut client = ClientState::default();
        let raw = json!({ "type": "evt:run.output", "id": "x", "payload": {} }).to_string();
        let res = handle_frame(&gw, &mut client, &raw).await;
        assert_eq!(res["ok"], false);
        assert_eq!(res["err"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn runs_tail_narrows_subscription() {
        let gw = gateway();
        let mut client = ClientState::default();
        let res = handle_frame(
            &gw,
            &mut client,
            &frame("runs.tail", json!({ "run_id": "run_42" })),
        )
        .await;
        assert_eq!(res["ok"], true);
        assert!(client.subscribed_run_ids.contains("run_42"));
    }

    #[tokio::test]
    async fn config_set_then_get_round_trips() {
        let gw = gateway();
        let mut client = ClientState::default();
        let set = frame(
            "config.set",
            json!({ "policy": { "tool_allow": { "core.echo": "read" } } }),
        );
        assert_eq!(handle_frame(&gw, &mut client, &set).await["ok"], true);

        let get = handle_frame(&gw, &mut client, &frame("config.get", json!({}))).await;
        assert_eq!(get["payload"]["policy"]["tool_allow"]["core.echo"], "read");
    }

    #[test]
    fn client_filter_defaults_to_all_events() {
        let client = ClientState::default();
        let event = Event {
            run_id: Some("run_1".into()),
            seq: 1,
            event_type: EventType::RunOutput,
            payload: json!({}),
            ts: Utc::now(),
        };
        assert!(client.wants(&event));
    }

    #[test]
    fn client_filter_scopes_to_subscribed_runs() {
        let mut client = ClientState::default();
        client.subscribed_run_ids.insert("run_1".to_owned());

        let mine = Event {
            run_id: Some("run_1".into()),
            seq: 1,
            event_type: EventType::RunOutput,
            payload: json!({}),
            ts: Utc::now(),
        };
        let other = Event {
            run_id: Some("run_2".into()),
            seq: 2,
            event_type: EventType::RunOutput,
            payload: json!({}),
            ts: Utc::now(),
        };
        let global = Event {
            run_id: None,
            seq: 3,
            event_type: EventType::MessageInbound,
            payload: json!({}),
            ts: Utc::now(),
        };
        assert!(client.wants(&mine));
        assert!(!client.wants(&other));
        assert!(!client.wants(&global));
    }

    #[test]
    fn event_frame_has_protocol_shape() {
        let event = Event {
            run_id: Some("run_9".into()),
            seq: 17,
            event_type: EventType::RunToolCall,
            payload: json!({ "tool": "core.echo" }),
            ts: Utc::now(),
        };
        let frame = event_frame(&event);
        assert_eq!(frame["type"], "evt:run.tool_call");
        assert_eq!(frame["id"], "evt_17");
        assert_eq!(frame["payload"]["run_id"], "run_9");
        assert_eq!(frame["payload"]["seq"], 17);
        assert_eq!(frame["payload"]["tool"], "core.echo");
    }
}
