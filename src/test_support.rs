//! In-memory agents for tests.
//!
//! `spawn_agent` wires a scripted fake agent to a pair of `tokio::io::duplex`
//! pipes and returns the host ends. `InMemoryLauncher` does the same for
//! every launch requested by a `SessionManager`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::sync::{mpsc, Notify};

use crate::api::types::{ApiError, METHOD_NOT_FOUND};
use crate::protocols::codec::{decode, encode, Message, Response, ResponseError};
use crate::protocols::framing::{FrameReader, FrameWriter, Framing};
use crate::protocols::rpc::{BoxedReader, BoxedWriter};
use crate::runtime::launcher::{AgentLauncher, AgentStreams};

const PIPE_CAPACITY: usize = 64 * 1024;
const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// How the fake agent answers requests.
///
/// `initialize` answers with capabilities, `shutdown` and `logout` with
/// `null`, anything else unscripted with a -32601 error.
#[derive(Clone, Default)]
pub struct AgentScript {
    responses: HashMap<String, Result<Value, ResponseError>>,
    silent: HashSet<String>,
    delays: HashMap<String, Duration>,
    close_after: HashSet<String>,
}

impl AgentScript {
    pub fn respond(mut self, method: &str, result: Value) -> Self {
        self.responses.insert(method.to_string(), Ok(result));
        self
    }

    pub fn fail(mut self, method: &str, code: i64, message: &str) -> Self {
        self.responses
            .insert(method.to_string(), Err(ResponseError::new(code, message)));
        self
    }

    /// Never answer `method`.
    pub fn silent(mut self, method: &str) -> Self {
        self.silent.insert(method.to_string());
        self
    }

    /// Wait before answering `method`.
    pub fn delay(mut self, method: &str, delay: Duration) -> Self {
        self.delays.insert(method.to_string(), delay);
        self
    }

    /// Close both pipes right after answering `method`.
    pub fn close_after(mut self, method: &str) -> Self {
        self.close_after.insert(method.to_string());
        self
    }

    fn reply(&self, message: &Message) -> Option<Response> {
        let Message::Request(request) = message else {
            return None;
        };
        if self.silent.contains(&request.method) {
            return None;
        }
        let id = request.id.clone();
        let response = match self.responses.get(&request.method) {
            Some(Ok(result)) => Response::ok(id, result.clone()),
            Some(Err(error)) => Response::error(id, error.clone()),
            None => match request.method.as_str() {
                "initialize" => Response::ok(
                    id,
                    json!({"capabilities": {"agent": "fake", "version": "1.0.0"}}),
                ),
                "shutdown" | "logout" => Response::ok(id, Value::Null),
                other => Response::error(
                    id,
                    ResponseError::new(METHOD_NOT_FOUND, format!("Unhandled method {other}")),
                ),
            },
        };
        Some(response)
    }
}

enum Control {
    Write(Vec<u8>),
    Kill,
}

struct AgentState {
    received: Mutex<Vec<Message>>,
    changed: Notify,
}

/// Test-side handle to a running fake agent.
#[derive(Clone)]
pub struct AgentHandle {
    control: mpsc::UnboundedSender<Control>,
    state: Arc<AgentState>,
}

impl AgentHandle {
    /// Send a message to the host.
    pub fn push(&self, message: Message) {
        let bytes = encode(&message).unwrap();
        let _ = self.control.send(Control::Write(bytes));
    }

    /// Send raw bytes to the host as one frame.
    pub fn push_raw(&self, bytes: Vec<u8>) {
        let _ = self.control.send(Control::Write(bytes));
    }

    /// Close both pipes, as if the process died.
    pub fn kill(&self) {
        let _ = self.control.send(Control::Kill);
    }

    pub fn received(&self) -> Vec<Message> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|message| message.method().map(str::to_string))
            .collect()
    }

    pub async fn wait_until(&self, what: &str, predicate: impl Fn(&[Message]) -> bool) {
        let wait = async {
            loop {
                let notified = self.state.changed.notified();
                if predicate(&self.state.received.lock().unwrap()) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(WAIT_LIMIT, wait)
            .await
            .unwrap_or_else(|_| panic!("agent never saw {what}: {:?}", self.received_methods()));
    }

    pub async fn wait_for_count(&self, method: &str, count: usize) {
        self.wait_until(method, |messages| {
            messages
                .iter()
                .filter(|message| message.method() == Some(method))
                .count()
                >= count
        })
        .await;
    }

    pub async fn wait_for_method(&self, method: &str) {
        self.wait_for_count(method, 1).await;
    }

    /// Wait until the host has answered `count` agent-initiated requests.
    pub async fn wait_for_responses(&self, count: usize) -> Vec<Response> {
        self.wait_until("responses", |messages| {
            messages
                .iter()
                .filter(|message| matches!(message, Message::Response(_)))
                .count()
                >= count
        })
        .await;
        self.received()
            .into_iter()
            .filter_map(|message| match message {
                Message::Response(response) => Some(response),
                _ => None,
            })
            .collect()
    }
}

/// Start a fake agent and return the host ends of its pipes.
pub fn spawn_agent(script: AgentScript, framing: Framing) -> (BoxedReader, BoxedWriter, AgentHandle) {
    let (host_reader, agent_writer) = tokio::io::duplex(PIPE_CAPACITY);
    let (agent_reader, host_writer) = tokio::io::duplex(PIPE_CAPACITY);
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let state = Arc::new(AgentState {
        received: Mutex::new(Vec::new()),
        changed: Notify::new(),
    });

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(async move {
        let mut reader = FrameReader::new(BufReader::new(agent_reader), framing, 1 << 20);
        while let Ok(Some(frame)) = reader.read_frame().await {
            if inbound_tx.send(frame).is_err() {
                break;
            }
        }
    });

    let agent_state = state.clone();
    tokio::spawn(async move {
        let mut writer = FrameWriter::new(agent_writer, framing);
        let mut control_open = true;
        loop {
            tokio::select! {
                frame = inbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let message = decode(&frame).unwrap();
                    let reply = script.reply(&message);
                    let exit = message
                        .method()
                        .is_some_and(|method| method == "exit" || script.close_after.contains(method));
                    agent_state.received.lock().unwrap().push(message.clone());
                    agent_state.changed.notify_waiters();
                    if let Some(response) = reply {
                        let method = message.method().unwrap_or_default();
                        if let Some(delay) = script.delays.get(method) {
                            tokio::time::sleep(*delay).await;
                        }
                        let bytes = encode(&Message::Response(response)).unwrap();
                        if writer.write_frame(&bytes).await.is_err() {
                            break;
                        }
                    }
                    if exit {
                        break;
                    }
                }
                control = control_rx.recv(), if control_open => match control {
                    Some(Control::Write(bytes)) => {
                        if writer.write_frame(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Control::Kill) => break,
                    None => control_open = false,
                }
            }
        }
        reader_task.abort();
    });

    let handle = AgentHandle {
        control: control_tx,
        state,
    };
    (Box::new(host_reader), Box::new(host_writer), handle)
}

/// Launcher producing a fresh fake agent per launch.
pub struct InMemoryLauncher {
    script: Mutex<AgentScript>,
    framing: Framing,
    agents: Mutex<Vec<AgentHandle>>,
    failures: AtomicUsize,
}

impl InMemoryLauncher {
    pub fn new(script: AgentScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            framing: Framing::Newline,
            agents: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
        })
    }

    /// Make the next `count` launches fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Script used by later launches.
    pub fn set_script(&self, script: AgentScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn launches(&self) -> usize {
        self.agents.lock().unwrap().len()
    }

    pub fn agent(&self, index: usize) -> AgentHandle {
        self.agents.lock().unwrap()[index].clone()
    }

    pub fn latest(&self) -> AgentHandle {
        self.agents.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl AgentLauncher for InMemoryLauncher {
    async fn launch(&self) -> Result<AgentStreams, ApiError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ApiError::IoError {
                message: "agent failed to start".to_string(),
            });
        }
        let script = self.script.lock().unwrap().clone();
        let (reader, writer, handle) = spawn_agent(script, self.framing);
        self.agents.lock().unwrap().push(handle);
        Ok(AgentStreams {
            reader,
            writer,
            child: None,
        })
    }
}
