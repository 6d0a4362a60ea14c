use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sy_agents::{AgentPool, KeywordTable};
use sy_bridge::{api_router, ApiState, CommandRouter, Gateway, LocalExecutor, ShellExecutor};
use sy_core::config::Config;
use sy_session::{OutputMultiplexer, SessionRegistry};
use tracing::{debug, error, info, warn};

use crate::shutdown::ShutdownSignal;

/// How long the server gets to finish after shutdown before it is aborted.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maintenance loop timing.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    /// How often detached sessions are checked against `detached_grace`.
    pub reap_every: Duration,
    pub detached_grace: Duration,
    /// How often connections are checked against `liveness_grace`.
    pub sweep_every: Duration,
    pub liveness_grace: Duration,
}

impl DaemonIntervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reap_every: config.sessions.reap_interval(),
            detached_grace: config.sessions.detached_grace(),
            sweep_every: config.server.heartbeat_interval(),
            liveness_grace: config.server.liveness_grace(),
        }
    }
}

/// The switchyard process: session registry, agent pool, router and gateway,
/// plus the HTTP/WebSocket server and the maintenance loop.
pub struct Daemon {
    config: Config,
    gateway: Arc<Gateway>,
    api_state: Arc<ApiState>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Wire every component from `config`. Must run inside a tokio runtime;
    /// agent reply pumps are spawned here.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(
            SessionRegistry::new(config.server.liveness_grace())
                .with_replay_limit(config.sessions.replay_limit),
        );
        let mux = OutputMultiplexer::new(registry.clone());

        let pool = AgentPool::from_config(&config.agents, mux.clone())
            .context("failed to build agent pool")?;
        let keywords =
            KeywordTable::from_configs(&config.agents).context("invalid agent keywords")?;

        let executor: Option<Arc<dyn LocalExecutor>> = if config.executor.enabled {
            Some(Arc::new(ShellExecutor::from_config(&config.executor)))
        } else {
            info!("local command execution disabled");
            None
        };

        let router = Arc::new(CommandRouter::new(mux, pool.clone(), keywords, executor));
        let gateway = Arc::new(Gateway::new(registry, router, pool));
        let api_state = Arc::new(ApiState::new(
            gateway.clone(),
            config.server.heartbeat_interval(),
        ));

        Ok(Self {
            intervals: DaemonIntervals::from_config(&config),
            config,
            gateway,
            api_state,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Override the default loop intervals.
    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn api_state(&self) -> &Arc<ApiState> {
        &self.api_state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind to the configured host and port and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on a pre-bound listener until shutdown (blocking).
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        let router = api_router(self.api_state.clone());
        let server_shutdown = self.shutdown.clone();
        let mut server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_shutdown.wait().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "API server error");
            }
        });
        info!(%bind_addr, agents = ?self.gateway.pool().kinds(), "switchyard listening");

        run_maintenance(self.gateway.clone(), self.intervals.clone(), self.shutdown.clone()).await;

        // Open WebSockets keep the server busy; give it a moment, then stop it.
        if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut server).await.is_err() {
            warn!("API server did not drain in time, aborting");
            server.abort();
        }
        self.gateway.pool().shutdown().await;
        info!("daemon stopped");
        Ok(())
    }
}

/// Close expired detached sessions and drop silent connections until
/// shutdown is signalled.
pub async fn run_maintenance(gateway: Arc<Gateway>, intervals: DaemonIntervals, shutdown: ShutdownSignal) {
    let mut reap = tokio::time::interval(intervals.reap_every);
    let mut sweep = tokio::time::interval(intervals.sweep_every);

    // Consume the first immediate tick so the loops don't fire at t=0.
    reap.tick().await;
    sweep.tick().await;

    loop {
        tokio::select! {
            _ = reap.tick() => {
                let closed = gateway.reap_detached(intervals.detached_grace);
                if !closed.is_empty() {
                    info!(count = closed.len(), "reaped idle detached sessions");
                }
            }
            _ = sweep.tick() => {
                let dropped = gateway.sweep_stale(intervals.liveness_grace);
                debug!(dropped = dropped.len(), connections = gateway.connection_count(), "liveness sweep");
            }
            _ = shutdown.wait() => {
                info!("shutdown signal received, stopping maintenance loop");
                break;
            }
        }
    }
}
