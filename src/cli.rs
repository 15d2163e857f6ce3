//! `agw` — control-plane CLI client.
//!
//! Each subcommand opens the gateway WebSocket, sends a single `req:*`
//! frame, and prints the response.  `run` additionally tails the run's
//! events until the terminal `evt:run.completed` arrives.  The process
//! exits 0 when the response carries `ok:true`, non-zero otherwise.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "agw",
    about = "Agent gateway control-plane client",
    version,
    long_about = "Client for the agent gateway WebSocket control plane.\n\
                  Point it at a running agwd with --host/--port and an API key."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Gateway host.
    #[arg(long, global = true, default_value = "127.0.0.1")]
    host: String,

    /// Gateway port.
    #[arg(long, global = true, default_value_t = 8787)]
    port: u16,

    /// Control-plane API key.
    #[arg(long, global = true, env = "AGW_CLIENT_KEY", default_value = "")]
    api_key: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a configuration audit.
    Doctor,
    /// List all channels.
    Channels,
    /// List chats, optionally filtered by channel.
    Chats {
        #[arg(long)]
        channel_id: Option<String>,
    },
    /// Start an agent run and tail its events.
    Run {
        chat_id: String,
        #[arg(long, default_value = "webchat-1")]
        channel_id: String,
        #[arg(long, default_value = "hello")]
        prompt: String,
        /// Print only the response; skip tailing events.
        #[arg(long)]
        no_tail: bool,
    },
    /// Grant approval for a pending tool execution.
    Approve { run_id: String },
    /// Tail recent events, optionally filtered by run.
    Events {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        after_seq: Option<u64>,
    },
    /// Get the current policy and tool configuration.
    ConfigGet,
    /// Update the policy configuration.
    ConfigSet {
        /// JSON map channel_id → [sender_id, …].
        #[arg(long, default_value = "{}")]
        allowlist_json: String,
        /// JSON map tool_name → permission.
        #[arg(long, default_value = "{}")]
        tool_allow_json: String,
        #[arg(long, default_value = "")]
        dm_policy: String,
        #[arg(long, default_value = "")]
        group_policy: String,
    },
}

// ---------------------------------------------------------------------------
// WebSocket plumbing
// ---------------------------------------------------------------------------

async fn connect(cli: &Cli) -> Result<WsStream, String> {
    let url = format!("ws://{}:{}/ws", cli.host, cli.port);
    let mut request = url
        .clone()
        .into_client_request()
        .map_err(|e| format!("bad url {url}: {e}"))?;
    if !cli.api_key.is_empty() {
        let value = HeaderValue::from_str(&cli.api_key)
            .map_err(|e| format!("invalid api key: {e}"))?;
        request.headers_mut().insert("x-api-key", value);
    }
    let (stream, _) = connect_async(request)
        .await
        .map_err(|e| format!("connect to {url} failed: {e}"))?;
    Ok(stream)
}

fn request_frame(method: &str, payload: Value) -> String {
    json!({
        "type": format!("req:{method}"),
        "id": Uuid::new_v4().simple().to_string(),
        "ts": chrono::Utc::now().to_rfc3339(),
        "payload": payload,
    })
    .to_string()
}

/// Send one request and return the first `res:*` frame.
async fn round_trip(ws: &mut WsStream, method: &str, payload: Value) -> Result<Value, String> {
    ws.send(Message::Text(request_frame(method, payload)))
        .await
        .map_err(|e| format!("send failed: {e}"))?;

    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| format!("receive failed: {e}"))?;
        if let Message::Text(text) = frame {
            let value: Value =
                serde_json::from_str(&text).map_err(|e| format!("bad frame: {e}"))?;
            let frame_type = value["type"].as_str().unwrap_or("");
            // Events may interleave before the response arrives.
            if frame_type.starts_with("res:") {
                return Ok(value);
            }
        }
    }
    Err("connection closed before response".to_owned())
}

fn print_response(value: &Value) -> bool {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
    value["ok"].as_bool().unwrap_or(false)
}

/// Stream `evt:*` frames for `run_id` until its `run.completed` arrives.
async fn tail_run(ws: &mut WsStream, run_id: &str) -> Result<(), String> {
    eprintln!("tailing events for {run_id} (Ctrl+C to stop)");
    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| format!("receive failed: {e}"))?;
        let Message::Text(text) = frame else { continue };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let frame_type = value["type"].as_str().unwrap_or("");
        if !frame_type.starts_with("evt:") {
            continue;
        }
        let event_run = value["payload"]["run_id"].as_str();
        if event_run.is_some_and(|id| id != run_id) {
            continue;
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
        );
        if frame_type == "evt:run.completed" && event_run == Some(run_id) {
            break;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

async fn execute(cli: &Cli) -> Result<bool, String> {
    let mut ws = connect(cli).await?;

    let ok = match &cli.command {
        Commands::Doctor => {
            let res = round_trip(&mut ws, "doctor.audit", json!({})).await?;
            print_response(&res)
        }
        Commands::Channels => {
            let res = round_trip(&mut ws, "channels.list", json!({})).await?;
            print_response(&res)
        }
        Commands::Chats { channel_id } => {
            let payload = match channel_id {
                Some(id) => json!({ "channel_id": id }),
                None => json!({}),
            };
            let res = round_trip(&mut ws, "chat.list", payload).await?;
            print_response(&res)
        }
        Commands::Run {
            chat_id,
            channel_id,
            prompt,
            no_tail,
        } => {
            let res = round_trip(
                &mut ws,
                "agent.run",
                json!({
                    "chat_id": chat_id,
                    "channel_id": channel_id,
                    "prompt": prompt,
                    "requested_by": "cli",
                }),
            )
            .await?;
            let ok = print_response(&res);
            let run_id = res["payload"]["run"]["run_id"].as_str().map(str::to_owned);
            // Tail on the same connection; events are filtered client-side
            // so none arriving mid-handshake are lost.
            if ok && !no_tail
                && let Some(run_id) = run_id
            {
                tail_run(&mut ws, &run_id).await?;
            }
            ok
        }
        Commands::Approve { run_id } => {
            let res = round_trip(&mut ws, "approval.grant", json!({ "run_id": run_id })).await?;
            print_response(&res)
        }
        Commands::Events { run_id, after_seq } => {
            let res = round_trip(
                &mut ws,
                "runs.tail",
                json!({ "run_id": run_id, "after_seq": after_seq }),
            )
            .await?;
            print_response(&res)
        }
        Commands::ConfigGet => {
            let res = round_trip(&mut ws, "config.get", json!({})).await?;
            print_response(&res)
        }
        Commands::ConfigSet {
            allowlist_json,
            tool_allow_json,
            dm_policy,
            group_policy,
        } => {
            let mut policy = serde_json::Map::new();
            if allowlist_json != "{}" {
                policy.insert(
                    "allowlist".to_owned(),
                    serde_json::from_str(allowlist_json)
                        .map_err(|e| format!("bad --allowlist-json: {e}"))?,
                );
            }
            if tool_allow_json != "{}" {
                policy.insert(
                    "tool_allow".to_owned(),
                    serde_json::from_str(tool_allow_json)
                        .map_err(|e| format!("bad --tool-allow-json: {e}"))?,
                );
            }
            if !dm_policy.is_empty() {
                policy.insert("dm_policy".to_owned(), json!(dm_policy));
            }
            if !group_policy.is_empty() {
                policy.insert("group_policy".to_owned(), json!(group_policy));
            }
            let res = round_trip(&mut ws, "config.set", json!({ "policy": policy })).await?;
            print_response(&res)
        }
    };

    let _ = ws.close(None).await;
    Ok(ok)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(&cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("\x1b[31merror\x1b[0m: {err}");
            ExitCode::FAILURE
        }
    }
}
