use std::sync::Arc;
use std::time::Duration;

use sy_agents::{inbound_channel, AgentPeer, AgentPool, AgentRoute, AgentSettings, InProcessEndpoint, KeywordTable};
use sy_bridge::router::{CommandRouter, ControlWord, Route, CLEAR_SCREEN};
use sy_bridge::LocalExecutor;
use sy_core::types::{AgentKind, Classification, RecordStatus, SessionId};
use sy_session::event_bus::TranscriptEvent;
use sy_session::{OutputMultiplexer, SessionError, SessionRegistry};

struct Stack {
    registry: Arc<SessionRegistry>,
    router: CommandRouter,
    peer: AgentPeer,
    events: flume::Receiver<TranscriptEvent>,
}

fn claude_route() -> AgentRoute {
    AgentRoute {
        keyword: "claude".into(),
        kind: AgentKind::new("claude"),
        display_name: "Claude Code".into(),
        default_prompt: Some("Hello Claude".into()),
        timeout: Duration::from_secs(120),
    }
}

fn stack(executor: Option<Arc<dyn LocalExecutor>>) -> Stack {
    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(90)));
    let events = registry.bus().subscribe();
    let mux = OutputMultiplexer::new(registry.clone());

    let (sink, inbound) = inbound_channel();
    let (endpoint, peer) = InProcessEndpoint::pair(sink);
    let pool = AgentPool::builder(mux.clone())
        .register(
            AgentSettings {
                display_name: "Claude Code".into(),
                ..AgentSettings::new("claude")
            },
            Arc::new(endpoint),
            inbound,
        )
        .unwrap()
        .build();

    let mut keywords = KeywordTable::default();
    keywords.insert(claude_route()).unwrap();

    Stack {
        registry,
        router: CommandRouter::new(mux, pool, keywords, executor),
        peer,
        events,
    }
}

impl Stack {
    /// Wait for the chunk that terminates record `seq`.
    async fn finished(&self, seq: u64) -> (String, RecordStatus) {
        let wait = async {
            loop {
                if let TranscriptEvent::Chunk {
                    seq: got,
                    status: Some(status),
                    ..
                } = self.events.recv_async().await.unwrap()
                {
                    if got == seq {
                        return status;
                    }
                }
            }
        };
        let status = tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("record never finished");
        let sid = self.registry.list()[0].id;
        let text = self.registry.get(sid).unwrap().record(seq).unwrap().output_text();
        (text, status)
    }
}

#[tokio::test]
async fn control_words_take_precedence_and_need_the_exact_line() {
    let s = stack(None);
    assert_eq!(s.router.classify("status"), Route::Control(ControlWord::Status));
    assert_eq!(s.router.classify("  help  "), Route::Control(ControlWord::Help));
    assert_eq!(s.router.classify("status now"), Route::Local);
    match s.router.classify("claude refactor foo") {
        Route::Agent { route, argument } => {
            assert_eq!(route.kind, AgentKind::new("claude"));
            assert_eq!(argument, "refactor foo");
        }
        other => panic!("expected agent route, got {other:?}"),
    }
    assert_eq!(s.router.classify("claudette"), Route::Local);
}

#[tokio::test]
async fn blank_lines_create_no_record() {
    let s = stack(None);
    let sid = s.registry.create(None);
    assert_eq!(s.router.route(sid, "   ").await.unwrap(), None);
    assert!(s.registry.get(sid).unwrap().records.is_empty());
}

#[tokio::test]
async fn unknown_session_is_rejected() {
    let s = stack(None);
    let sid = SessionId::new();
    assert_eq!(
        s.router.route(sid, "help").await,
        Err(SessionError::NotFound(sid))
    );
}

#[tokio::test]
async fn control_words_complete_immediately() {
    let s = stack(None);
    let sid = s.registry.create(Some("work".into()));

    let seq = s.router.route(sid, "clear").await.unwrap().unwrap();
    let record = s.registry.get(sid).unwrap().record(seq).unwrap().clone();
    assert_eq!(record.classification, Classification::Control);
    assert_eq!(record.status, RecordStatus::Completed);
    assert_eq!(record.output_text(), CLEAR_SCREEN);

    let seq = s.router.route(sid, "help").await.unwrap().unwrap();
    let help = s.registry.get(sid).unwrap().record(seq).unwrap().output_text();
    assert!(help.contains("claude <prompt>"));
    assert!(help.contains("Claude Code"));
    assert!(help.contains("are rejected"));

    let seq = s.router.route(sid, "status").await.unwrap().unwrap();
    let status = s.registry.get(sid).unwrap().record(seq).unwrap().output_text();
    assert!(status.starts_with("Session work"));
    assert!(status.contains("Claude Code: 0 outstanding"));
}

#[tokio::test]
async fn history_lists_earlier_commands_only() {
    let s = stack(None);
    let sid = s.registry.create(None);

    let seq = s.router.route(sid, "history").await.unwrap().unwrap();
    let text = s.registry.get(sid).unwrap().record(seq).unwrap().output_text();
    assert_eq!(text, "(no history)\n");

    s.router.route(sid, "help").await.unwrap();
    let seq = s.router.route(sid, "history").await.unwrap().unwrap();
    let text = s.registry.get(sid).unwrap().record(seq).unwrap().output_text();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("history"));
    assert!(lines[1].contains("completed"));
    assert!(lines[1].ends_with("help"));
}

#[tokio::test]
async fn agent_line_is_acknowledged_then_completed_by_the_reply() {
    let s = stack(None);
    let sid = s.registry.create(None);

    let seq = s.router.route(sid, "claude refactor foo").await.unwrap().unwrap();
    let record = s.registry.get(sid).unwrap().record(seq).unwrap().clone();
    assert_eq!(record.classification, Classification::Agent(AgentKind::new("claude")));
    assert_eq!(record.status, RecordStatus::Pending);
    assert_eq!(record.output_text(), "[Claude Code] processing: claude refactor foo\n");

    let req = s.peer.next_request().await.unwrap();
    assert_eq!(req.params.prompt, "refactor foo");
    s.peer.reply(req.id, "done");

    let (text, status) = s.finished(seq).await;
    assert_eq!(status, RecordStatus::Completed);
    assert_eq!(text, "[Claude Code] processing: claude refactor foo\ndone");
}

#[tokio::test]
async fn bare_keyword_sends_the_default_prompt() {
    let s = stack(None);
    let sid = s.registry.create(None);
    s.router.route(sid, "claude").await.unwrap();
    let req = s.peer.next_request().await.unwrap();
    assert_eq!(req.params.prompt, "Hello Claude");
}

#[tokio::test]
async fn local_commands_fail_when_execution_is_disabled() {
    let s = stack(None);
    let sid = s.registry.create(None);
    let seq = s.router.route(sid, "ls").await.unwrap().unwrap();
    let record = s.registry.get(sid).unwrap().record(seq).unwrap().clone();
    assert_eq!(record.classification, Classification::Local);
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.output_text(), "local command execution is disabled\n");
}

/// Records every command it is asked to run and holds each one until the
/// test releases it.
struct GatedExecutor {
    started: std::sync::Mutex<Vec<String>>,
    release: flume::Receiver<()>,
}

#[async_trait::async_trait]
impl LocalExecutor for GatedExecutor {
    async fn execute(
        &self,
        _session_id: SessionId,
        command: &str,
    ) -> Result<sy_bridge::ExecOutput, sy_bridge::ExecError> {
        self.started.lock().unwrap().push(command.to_string());
        let _ = self.release.recv_async().await;
        Ok(sy_bridge::ExecOutput::ok("done\n"))
    }
}

#[tokio::test]
async fn closing_a_session_skips_its_queued_local_commands() {
    let (release, gate) = flume::unbounded();
    let exec = Arc::new(GatedExecutor {
        started: std::sync::Mutex::new(Vec::new()),
        release: gate,
    });
    let s = stack(Some(exec.clone()));
    let sid = s.registry.create(None);

    let first = s.router.route(sid, "sleep 1").await.unwrap().unwrap();
    let second = s.router.route(sid, "rm -rf build").await.unwrap().unwrap();
    let third = s.router.route(sid, "make deploy").await.unwrap().unwrap();

    // Wait until the first command is running and the rest are queued.
    tokio::time::timeout(Duration::from_secs(5), async {
        while exec.started.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first command never started");

    let cancelled = s.registry.close(sid).unwrap();
    assert_eq!(cancelled, vec![first, second, third]);
    s.router.forget(sid);
    for _ in 0..3 {
        release.send(()).unwrap();
    }

    // The worker holds the last executor clone besides ours and the router's.
    tokio::time::timeout(Duration::from_secs(5), async {
        while Arc::strong_count(&exec) > 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("local worker never stopped");
    assert_eq!(*exec.started.lock().unwrap(), vec!["sleep 1".to_string()]);
}

#[cfg(unix)]
mod shell {
    use super::*;
    use sy_bridge::ShellExecutor;

    fn shell_stack(dir: &std::path::Path) -> Stack {
        let exec = ShellExecutor::new("/bin/sh", Duration::from_secs(5), dir.to_path_buf());
        stack(Some(Arc::new(exec)))
    }

    #[tokio::test]
    async fn successful_command_completes_with_its_output() {
        let dir = tempfile::tempdir().unwrap();
        let s = shell_stack(dir.path());
        let sid = s.registry.create(None);
        let seq = s.router.route(sid, "echo hi").await.unwrap().unwrap();
        assert_eq!(s.finished(seq).await, ("hi\n".to_string(), RecordStatus::Completed));
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let s = shell_stack(dir.path());
        let sid = s.registry.create(None);
        let seq = s.router.route(sid, "echo oops; exit 3").await.unwrap().unwrap();
        assert_eq!(
            s.finished(seq).await,
            ("oops\n[exit 3]\n".to_string(), RecordStatus::Failed)
        );
    }

    #[tokio::test]
    async fn commands_of_one_session_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let s = shell_stack(dir.path());
        let sid = s.registry.create(None);
        let first = s.router.route(sid, "sleep 0.3; echo first").await.unwrap().unwrap();
        let second = s.router.route(sid, "echo second").await.unwrap().unwrap();

        let mut order = Vec::new();
        while order.len() < 2 {
            if let TranscriptEvent::Chunk {
                seq,
                status: Some(_),
                ..
            } = s.events.recv_async().await.unwrap()
            {
                order.push(seq);
            }
        }
        assert_eq!(order, vec![first, second]);
    }

    #[tokio::test]
    async fn forget_resets_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let s = shell_stack(dir.path());
        let sid = s.registry.create(None);
        let seq = s.router.route(sid, "cd sub").await.unwrap().unwrap();
        assert_eq!(s.finished(seq).await.1, RecordStatus::Completed);

        s.router.forget(sid);
        let seq = s.router.route(sid, "basename \"$PWD\"").await.unwrap().unwrap();
        let (text, _) = s.finished(seq).await;
        let root = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(text.trim(), root.file_name().unwrap().to_str().unwrap());
    }
}
