//! Event/approval bus (C5), grounded on
//! `original_source/proxy/client.go`'s `Manager`. The original rewrites a
//! shared subscriber slice inside its send loop; this crate instead runs
//! the subscriber set inside one actor task that owns it exclusively, so
//! a slow or gone subscriber never blocks (or corrupts bookkeeping for)
//! anyone else.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::BusError;
use crate::wire::Headers;

/// Subscriber outgoing queues hold at least this many pending messages
/// before a slow subscriber is detached.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    Approved,
    Canceled,
}

#[derive(Debug, Clone, Default)]
pub struct RequestMutation {
    pub method: Option<String>,
    pub path: Option<String>,
    pub query: Option<String>,
    pub headers: Option<Headers>,
    pub host: Option<String>,
    pub secure: Option<bool>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub enum ClientMessage {
    ApprovalApprove { id: String },
    ApprovalCancel { id: String },
    UpdateRequest { id: String, mutation: RequestMutation },
}

/// Parses one subscriber-to-bus message of the form `TOKEN {json}`.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, BusError> {
    let (token, json) = raw
        .split_once(' ')
        .ok_or_else(|| BusError::ProtocolViolation(raw.to_string()))?;
    let value: Value = serde_json::from_str(json).map_err(|e| BusError::ProtocolViolation(e.to_string()))?;
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| BusError::ProtocolViolation("missing id".to_string()))?
        .to_string();

    match token {
        "APPROVAL-APPROVE" => Ok(ClientMessage::ApprovalApprove { id }),
        "APPROVAL-CANCEL" => Ok(ClientMessage::ApprovalCancel { id }),
        "UPDATE-REQUEST" => {
            let request = value.get("request").cloned().unwrap_or(Value::Null);
            let mutation = RequestMutation {
                method: request.get("method").and_then(Value::as_str).map(String::from),
                path: request.get("path").and_then(Value::as_str).map(String::from),
                query: request.get("query").and_then(Value::as_str).map(String::from),
                headers: request
                    .get("headers")
                    .and_then(|h| serde_json::from_value::<Headers>(h.clone()).ok()),
                host: request.get("host").and_then(Value::as_str).map(String::from),
                secure: request.get("secure").and_then(Value::as_bool),
                body: request
                    .get("body")
                    .and_then(Value::as_str)
                    .map(|s| s.as_bytes().to_vec()),
            };
            Ok(ClientMessage::UpdateRequest { id, mutation })
        }
        other => Err(BusError::ProtocolViolation(format!("unknown token {other}"))),
    }
}

pub struct ApprovalHandle {
    pub mutations: mpsc::UnboundedReceiver<RequestMutation>,
    pub outcome: oneshot::Receiver<ApprovalOutcome>,
}

struct Waiter {
    outcome: oneshot::Sender<ApprovalOutcome>,
    mutations: mpsc::UnboundedSender<RequestMutation>,
}

enum Command {
    Subscribe {
        reply: oneshot::Sender<mpsc::Receiver<String>>,
    },
    Broadcast(String),
    Dispatch(ClientMessage),
    RegisterWaiter {
        id: String,
        reply: oneshot::Sender<ApprovalHandle>,
    },
}

#[derive(Clone)]
pub struct EventBus {
    cmd_tx: mpsc::Sender<Command>,
}

impl EventBus {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        tokio::spawn(run_actor(cmd_rx));
        Self { cmd_tx }
    }

    /// Joins the bus as a new subscriber; returns the receiving half of
    /// this subscriber's outgoing queue.
    pub async fn subscribe(&self) -> mpsc::Receiver<String> {
        let (reply, reply_rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Subscribe { reply }).await;
        reply_rx.await.expect("bus actor gone")
    }

    pub async fn publish(&self, event: &str, payload: impl Serialize) {
        let json = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
        let _ = self.cmd_tx.send(Command::Broadcast(format!("{event} {json}"))).await;
    }

    pub async fn dispatch(&self, message: ClientMessage) {
        let _ = self.cmd_tx.send(Command::Dispatch(message)).await;
    }

    /// Blocks (from the caller's perspective) until a subscriber answers
    /// `APPROVAL-APPROVE`/`APPROVAL-CANCEL` for `id`. Emits
    /// `APPROVAL-WAIT` before registering the waiter so no subscriber can
    /// race ahead of it.
    pub async fn await_approval(&self, id: &str) -> ApprovalHandle {
        self.publish("APPROVAL-WAIT", serde_json::json!({ "id": id })).await;
        let (reply, reply_rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::RegisterWaiter {
                id: id.to_string(),
                reply,
            })
            .await;
        reply_rx.await.expect("bus actor gone")
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_actor(mut cmd_rx: mpsc::Receiver<Command>) {
    let mut subscribers: Vec<mpsc::Sender<String>> = Vec::new();
    let mut waiters: HashMap<String, Waiter> = HashMap::new();

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Subscribe { reply } => {
                let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
                subscribers.push(tx);
                let _ = reply.send(rx);
            }
            Command::Broadcast(message) => {
                broadcast(&mut subscribers, &message);
            }
            Command::Dispatch(message) => match message {
                ClientMessage::ApprovalApprove { id } => {
                    if let Some(waiter) = waiters.remove(&id) {
                        let _ = waiter.outcome.send(ApprovalOutcome::Approved);
                        broadcast(&mut subscribers, &format!("APPROVAL-RECEIVED {}", serde_json::json!({"id": id})));
                    }
                }
                ClientMessage::ApprovalCancel { id } => {
                    if let Some(waiter) = waiters.remove(&id) {
                        let _ = waiter.outcome.send(ApprovalOutcome::Canceled);
                        broadcast(&mut subscribers, &format!("APPROVAL-CANCELED {}", serde_json::json!({"id": id})));
                    }
                }
                ClientMessage::UpdateRequest { id, mutation } => {
                    if let Some(waiter) = waiters.get(&id) {
                        let _ = waiter.mutations.send(mutation);
                    }
                    // An UPDATE-REQUEST for an id with no pending waiter
                    // is stale (approval already resolved) and ignored.
                }
            },
            Command::RegisterWaiter { id, reply } => {
                let (outcome_tx, outcome_rx) = oneshot::channel();
                let (mutations_tx, mutations_rx) = mpsc::unbounded_channel();
                waiters.insert(
                    id,
                    Waiter {
                        outcome: outcome_tx,
                        mutations: mutations_tx,
                    },
                );
                let _ = reply.send(ApprovalHandle {
                    mutations: mutations_rx,
                    outcome: outcome_rx,
                });
            }
        }
    }
}

fn broadcast(subscribers: &mut Vec<mpsc::Sender<String>>, message: &str) {
    subscribers.retain(|tx| tx.try_send(message.to_string()).is_ok());
}
