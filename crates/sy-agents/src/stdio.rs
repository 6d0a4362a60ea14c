//! Agent endpoint over a child process's stdin/stdout.
//!
//! Requests are written as one JSON object per line; every line the agent
//! prints on stdout is parsed as a reply. The process is started on first
//! use and restarted on the next request after it exits.

use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sy_core::types::AgentKind;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::endpoint::{AgentEndpoint, EndpointError, EndpointKind, Inbound, InboundSink};
use crate::protocol::{parse_reply_line, RpcRequest};

pub struct StdioEndpoint {
    kind: AgentKind,
    command: String,
    args: Vec<String>,
    sink: InboundSink,
    link: Mutex<Option<ChildLink>>,
}

/// Handle on the IO task of one running child.
struct ChildLink {
    write_tx: flume::Sender<(u64, String)>,
    shutdown_tx: flume::Sender<()>,
    alive: Arc<AtomicBool>,
}

impl ChildLink {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl StdioEndpoint {
    pub fn new(kind: AgentKind, command: impl Into<String>, args: Vec<String>, sink: InboundSink) -> Self {
        Self {
            kind,
            command: command.into(),
            args,
            sink,
            link: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.link.lock().await.as_ref().is_some_and(ChildLink::is_alive)
    }

    fn spawn_child(&self) -> Result<ChildLink, EndpointError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EndpointError::Spawn(format!("{}: {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EndpointError::Spawn("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EndpointError::Spawn("stdout not captured".into()))?;
        let stderr = child.stderr.take();

        info!(kind = %self.kind, pid = ?child.id(), command = %self.command, "agent process started");

        let (write_tx, write_rx) = flume::unbounded();
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        let alive = Arc::new(AtomicBool::new(true));

        if let Some(stderr) = stderr {
            tokio::spawn(log_stderr(self.kind.clone(), stderr));
        }
        tokio::spawn(
            ChildIo {
                kind: self.kind.clone(),
                child,
                stdin,
                stdout,
                write_rx,
                shutdown_rx,
                sink: self.sink.clone(),
                alive: alive.clone(),
            }
            .run(),
        );

        Ok(ChildLink {
            write_tx,
            shutdown_tx,
            alive,
        })
    }
}

#[async_trait]
impl AgentEndpoint for StdioEndpoint {
    fn transport(&self) -> EndpointKind {
        EndpointKind::Stdio
    }

    async fn dispatch(&self, request: RpcRequest) -> Result<(), EndpointError> {
        let line = request
            .to_line()
            .map_err(|e| EndpointError::Serialization(e.to_string()))?;

        let mut link = self.link.lock().await;
        if !link.as_ref().is_some_and(ChildLink::is_alive) {
            *link = Some(self.spawn_child()?);
        }
        let running = link.as_ref().ok_or(EndpointError::NotConnected)?;
        running
            .write_tx
            .send((request.id, line))
            .map_err(|_| EndpointError::SendFailed("agent io task ended".into()))
    }

    async fn shutdown(&self) {
        if let Some(link) = self.link.lock().await.take() {
            let _ = link.shutdown_tx.try_send(());
            info!(kind = %self.kind, "agent process stopping");
        }
    }
}

// ---------------------------------------------------------------------------
// IO task
// ---------------------------------------------------------------------------

struct ChildIo {
    kind: AgentKind,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    write_rx: flume::Receiver<(u64, String)>,
    shutdown_rx: flume::Receiver<()>,
    sink: InboundSink,
    alive: Arc<AtomicBool>,
}

impl ChildIo {
    async fn run(mut self) {
        let mut lines = BufReader::new(self.stdout).lines();
        // Ids written to the child and not yet answered.
        let mut in_flight: BTreeSet<u64> = BTreeSet::new();

        let reason = loop {
            tokio::select! {
                msg = self.write_rx.recv_async() => match msg {
                    Ok((id, line)) => {
                        if let Err(e) = write_line(&mut self.stdin, &line).await {
                            let _ = self.sink.send(Inbound::Undeliverable {
                                id,
                                reason: format!("write to agent failed: {e}"),
                            });
                            break format!("agent stdin closed: {e}");
                        }
                        in_flight.insert(id);
                    }
                    Err(_) => break "endpoint dropped".to_string(),
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match parse_reply_line(&line) {
                        Some(Ok(reply)) => {
                            if let Some(id) = reply.correlation_id() {
                                in_flight.remove(&id);
                            }
                            let _ = self.sink.send(Inbound::Reply(reply));
                        }
                        Some(Err(e)) => {
                            debug!(kind = %self.kind, error = %e, "ignoring non-JSON line from agent");
                        }
                        None => {}
                    },
                    Ok(None) => break "agent process closed its output".to_string(),
                    Err(e) => break format!("read from agent failed: {e}"),
                },
                _ = self.shutdown_rx.recv_async() => {
                    self.alive.store(false, Ordering::Release);
                    let _ = self.child.kill().await;
                    debug!(kind = %self.kind, "agent io task stopped");
                    return;
                }
            }
        };

        self.alive.store(false, Ordering::Release);
        let _ = self.child.start_kill();
        let status = self.child.wait().await.ok();
        warn!(kind = %self.kind, %reason, ?status, outstanding = in_flight.len(), "agent process ended");

        let queued = self.write_rx.drain().map(|(id, _)| id);
        for id in in_flight.into_iter().chain(queued) {
            let _ = self.sink.send(Inbound::Undeliverable {
                id,
                reason: reason.clone(),
            });
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

async fn log_stderr(kind: AgentKind, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(%kind, "[agent-stderr] {line}");
    }
}
