use std::fmt::Write as _;
use std::sync::Arc;

use dashmap::DashMap;
use sy_agents::{AgentPool, AgentRoute, KeywordTable};
use sy_core::config::CONTROL_WORDS;
use sy_core::types::{Classification, RecordStatus, SessionId};
use sy_session::{OutputMultiplexer, SessionError, SessionRegistry};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::executor::{ExecOutput, LocalExecutor};

/// ANSI "erase display, cursor home".
pub const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlWord {
    Clear,
    Help,
    Status,
    History,
}

impl ControlWord {
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "clear" => Some(ControlWord::Clear),
            "help" => Some(ControlWord::Help),
            "status" => Some(ControlWord::Status),
            "history" => Some(ControlWord::History),
            _ => None,
        }
    }
}

/// How one input line will be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    Control(ControlWord),
    Agent {
        route: &'a AgentRoute,
        argument: &'a str,
    },
    Local,
}

impl Route<'_> {
    pub fn classification(&self) -> Classification {
        match self {
            Route::Control(_) => Classification::Control,
            Route::Agent { route, .. } => Classification::Agent(route.kind.clone()),
            Route::Local => Classification::Local,
        }
    }
}

/// Classifies input lines and sends each one where it belongs.
///
/// Every line gets its command record before anything else happens, so the
/// transcript shows the command even when dispatch fails straight away.
/// Local commands of one session run one at a time, in input order.
pub struct CommandRouter {
    mux: OutputMultiplexer,
    pool: AgentPool,
    keywords: KeywordTable,
    executor: Option<Arc<dyn LocalExecutor>>,
    local_queues: DashMap<SessionId, flume::Sender<(u64, String)>>,
}

impl CommandRouter {
    pub fn new(
        mux: OutputMultiplexer,
        pool: AgentPool,
        keywords: KeywordTable,
        executor: Option<Arc<dyn LocalExecutor>>,
    ) -> Self {
        Self {
            mux,
            pool,
            keywords,
            executor,
            local_queues: DashMap::new(),
        }
    }

    fn registry(&self) -> &Arc<SessionRegistry> {
        self.mux.registry()
    }

    pub fn keywords(&self) -> &KeywordTable {
        &self.keywords
    }

    /// Control words first, then agent keywords, then the local executor.
    pub fn classify<'a>(&'a self, line: &'a str) -> Route<'a> {
        let line = line.trim();
        if let Some(word) = ControlWord::parse(line) {
            return Route::Control(word);
        }
        match self.keywords.classify(line) {
            Some((route, argument)) => Route::Agent { route, argument },
            None => Route::Local,
        }
    }

    /// Handle one complete input line. Returns the new record's sequence
    /// number, or `None` for a blank line.
    pub async fn route(&self, session_id: SessionId, line: &str) -> Result<Option<u64>, SessionError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let route = self.classify(line);
        let seq = self
            .registry()
            .begin_command(session_id, line, route.classification())?;
        debug!(%session_id, seq, classification = %route.classification(), "routing input line");

        match route {
            Route::Control(word) => {
                let text = self.control_output(session_id, word);
                self.mux.complete(session_id, seq, text)?;
            }
            Route::Agent { route, argument } => {
                self.mux.partial(
                    session_id,
                    seq,
                    format!("[{}] processing: {line}\n", route.display_name),
                )?;
                let deadline = Instant::now() + route.timeout;
                let prompt = route.prompt_for(argument);
                // Failures are already on the record; nothing more to do here.
                if let Err(e) = self
                    .pool
                    .submit(&route.kind, session_id, seq, prompt, deadline)
                    .await
                {
                    debug!(%session_id, seq, error = %e, "agent submit failed");
                }
            }
            Route::Local => self.dispatch_local(session_id, seq, line)?,
        }
        Ok(Some(seq))
    }

    fn dispatch_local(&self, session_id: SessionId, seq: u64, line: &str) -> Result<(), SessionError> {
        let Some(executor) = &self.executor else {
            self.mux
                .fail(session_id, seq, "local command execution is disabled\n")?;
            return Ok(());
        };
        let queue = self
            .local_queues
            .entry(session_id)
            .or_insert_with(|| self.spawn_local_worker(session_id, executor.clone()))
            .clone();
        if queue.send((seq, line.to_string())).is_err() {
            // Worker is gone; start over with a fresh one.
            let queue = self.spawn_local_worker(session_id, executor.clone());
            let _ = queue.send((seq, line.to_string()));
            self.local_queues.insert(session_id, queue);
        }
        Ok(())
    }

    fn spawn_local_worker(
        &self,
        session_id: SessionId,
        executor: Arc<dyn LocalExecutor>,
    ) -> flume::Sender<(u64, String)> {
        let (tx, rx) = flume::unbounded::<(u64, String)>();
        let mux = self.mux.clone();
        tokio::spawn(async move {
            while let Ok((seq, line)) = rx.recv_async().await {
                // Queued lines of a closed session are already cancelled.
                match mux.registry().record_status(session_id, seq) {
                    Ok(RecordStatus::Pending) => {}
                    Ok(status) => {
                        debug!(%session_id, seq, %status, "queued local command skipped");
                        continue;
                    }
                    Err(e) => {
                        debug!(%session_id, seq, error = %e, "queued local command dropped");
                        continue;
                    }
                }
                match executor.execute(session_id, &line).await {
                    Ok(output) => record_exec_output(&mux, session_id, seq, output),
                    Err(e) => {
                        warn!(%session_id, seq, error = %e, "local command failed to run");
                        let _ = mux.fail(session_id, seq, format!("{e}\n"));
                    }
                }
            }
            debug!(%session_id, "local command worker stopped");
        });
        tx
    }

    /// Drop per-session routing state after the session closed.
    pub fn forget(&self, session_id: SessionId) {
        self.local_queues.remove(&session_id);
        if let Some(executor) = &self.executor {
            executor.forget(session_id);
        }
    }

    fn control_output(&self, session_id: SessionId, word: ControlWord) -> String {
        match word {
            ControlWord::Clear => CLEAR_SCREEN.to_string(),
            ControlWord::Help => self.help_text(),
            ControlWord::Status => self.status_text(session_id),
            ControlWord::History => self.history_text(session_id),
        }
    }

    fn help_text(&self) -> String {
        let mut out = String::from("Control words:\n");
        for word in CONTROL_WORDS {
            let _ = writeln!(out, "  {word}");
        }
        out.push_str("Agents:\n");
        for kw in self.keywords.keywords() {
            if let Some(route) = self.keywords.lookup(kw) {
                let _ = writeln!(out, "  {kw} <prompt>    {}", route.display_name);
            }
        }
        let local = if self.executor.is_some() { "run" } else { "are rejected" };
        let _ = writeln!(out, "Anything else: local commands {local}.");
        out
    }

    fn status_text(&self, session_id: SessionId) -> String {
        let mut out = String::new();
        if let Ok(summary) = self.registry().summary(session_id) {
            let _ = writeln!(out, "Session {} ({})", summary.title, summary.id);
            let _ = writeln!(out, "  state: {}", summary.state);
            let _ = writeln!(out, "  commands: {} ({} pending)", summary.records, summary.pending);
        }
        let _ = writeln!(
            out,
            "  agent requests in flight: {}",
            self.pool.outstanding_for_session(session_id)
        );
        for (kind, outstanding) in self.pool.outstanding_by_kind() {
            let name = self.pool.display_name(&kind).unwrap_or(kind.as_str());
            let _ = writeln!(out, "  {name}: {outstanding} outstanding");
        }
        out
    }

    fn history_text(&self, session_id: SessionId) -> String {
        let Ok(session) = self.registry().get(session_id) else {
            return String::new();
        };
        let mut out = String::new();
        // The newest record is this `history` command itself.
        let earlier = session.records.len().saturating_sub(1);
        for record in &session.records[..earlier] {
            let _ = writeln!(out, "{:>4}  {:<9} {}", record.seq, record.status.to_string(), record.input);
        }
        if out.is_empty() {
            out.push_str("(no history)\n");
        }
        out
    }
}

/// Feed an executor result into the record: every chunk but the last as
/// partial output, then the final one with the exit status decided.
fn record_exec_output(mux: &OutputMultiplexer, session_id: SessionId, seq: u64, output: ExecOutput) {
    let success = output.success();
    let mut chunks = output.chunks;
    let last = if success { chunks.pop().unwrap_or_default() } else { String::new() };
    for chunk in chunks {
        if let Err(e) = mux.partial(session_id, seq, chunk) {
            debug!(%session_id, seq, error = %e, "local output not recorded");
            return;
        }
    }
    let result = if success {
        mux.complete(session_id, seq, last)
    } else {
        mux.fail(session_id, seq, format!("[exit {}]\n", output.exit_status))
    };
    match result {
        Ok(_) => info!(%session_id, seq, exit_status = output.exit_status, "local command finished"),
        Err(e) => debug!(%session_id, seq, error = %e, "local result not recorded"),
    }
}
