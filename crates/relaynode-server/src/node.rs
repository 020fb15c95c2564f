use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relaynode_core::config::NodeConfig;
use relaynode_core::events::{DetachReason, EventBus, NodeEvent};
use relaynode_core::node::HealthState;
use relaynode_core::schedule::Scheduler;
use relaynode_core::store::{self, CoordStore};
use relaynode_core::time::now_ms;
use relaynode_monitor::{ControlPlane, HealthMonitor, HostProbe, HttpControlPlane, MetricsCollector, SysinfoProbe};
use relaynode_tunnel::SessionRegistry;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::routes::{self, AppState};

/// A fully wired relay node: registry, monitors, and HTTP surface.
pub struct Node {
    config: Arc<NodeConfig>,
    store: Arc<dyn CoordStore>,
    events: EventBus,
    state: AppState,
}

impl Node {
    /// Connect to the configured store and wire every component.
    pub async fn build(config: NodeConfig) -> Result<Self> {
        let store = store::connect(&config.store.url, config.store_timeout())
            .await
            .with_context(|| format!("Failed to connect to coordination store {}", config.store.url))?;
        Self::with_components(config, store, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_components(
        config: NodeConfig,
        store: Arc<dyn CoordStore>,
        host: Arc<dyn HostProbe>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let events = EventBus::default();

        let control_plane: Option<Arc<dyn ControlPlane>> = if config.backend_enabled() {
            let cp = HttpControlPlane::new(
                &config.backend.url,
                &config.backend.api_key,
                config.backend_timeout(),
            )?;
            Some(Arc::new(cp))
        } else {
            info!("No control plane configured, backend check disabled");
            None
        };

        let registry = SessionRegistry::new(Arc::clone(&config), events.clone());
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&host),
            control_plane,
            events.clone(),
        ));
        let metrics = Arc::new(MetricsCollector::new(
            Arc::clone(&config),
            Arc::clone(&store),
            host,
            registry.clone(),
            events.clone(),
        ));

        let state = AppState {
            config: Arc::clone(&config),
            registry,
            health,
            metrics,
        };
        Ok(Self {
            config,
            store,
            events,
            state,
        })
    }

    pub fn store(&self) -> &Arc<dyn CoordStore> {
        &self.store
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Serve HTTP on `listener` until `shutdown` resolves, then drain.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = listener.local_addr().context("Failed to read listen address")?;
        info!(
            addr = %addr,
            node = %self.config.node.id,
            region = %self.config.node.region,
            version = env!("CARGO_PKG_VERSION"),
            "Relay node listening"
        );

        let scheduler = self.start_schedules();
        let event_log = spawn_event_log(&self.events);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let app = routes::router(self.state.clone());
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.changed().await;
                })
                .await
        });

        let early_exit = tokio::select! {
            _ = shutdown => {
                info!("Shutdown signal received");
                None
            }
            res = &mut server => Some(res),
        };

        self.drain_within_grace(scheduler).await;
        let _ = stop_tx.send(true);
        event_log.abort();

        if let Some(res) = early_exit {
            res.context("HTTP server task panicked")?
                .context("HTTP server failed")?;
            anyhow::bail!("HTTP server exited unexpectedly");
        }
        let grace = self.config.shutdown_grace();
        match tokio::time::timeout(grace, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server error during shutdown"),
            Ok(Err(e)) => warn!(error = %e, "HTTP server task failed"),
            Err(_) => {
                warn!("HTTP server did not stop in time, aborting");
                server.abort();
            }
        }
        info!("Relay node stopped");
        Ok(())
    }

    fn start_schedules(&self) -> Scheduler {
        let mut scheduler = Scheduler::new();

        let registry = self.state.registry.clone();
        scheduler.every("reap_idle", self.config.reap_interval(), false, move || {
            let registry = registry.clone();
            async move {
                let reaped = registry.reap_idle();
                if reaped > 0 {
                    debug!(reaped, "Idle sessions reaped");
                }
                Ok(())
            }
        });

        let health = Arc::clone(&self.state.health);
        scheduler.every("health_check", self.config.health_check_interval(), true, move || {
            let health = Arc::clone(&health);
            async move {
                health.tick().await;
                Ok(())
            }
        });

        let health = Arc::clone(&self.state.health);
        scheduler.every("heartbeat", self.config.heartbeat_interval(), true, move || {
            let health = Arc::clone(&health);
            async move { health.publish_heartbeat().await.map(|_| ()) }
        });

        let health = Arc::clone(&self.state.health);
        scheduler.every("stale_sweep", self.config.stale_sweep_interval(), false, move || {
            let health = Arc::clone(&health);
            async move { health.sweep_stale(now_ms()).await.map(|_| ()) }
        });

        let metrics = Arc::clone(&self.state.metrics);
        scheduler.every("metrics", self.config.metrics_interval(), true, move || {
            let metrics = Arc::clone(&metrics);
            async move { metrics.collect().await.map(|_| ()) }
        });

        info!(tasks = scheduler.len(), "Periodic tasks started");
        scheduler
    }

    /// [`drain`](Self::drain) bounded by the shutdown grace period.
    ///
    /// Returns false if the grace period ran out first.
    async fn drain_within_grace(&self, scheduler: Scheduler) -> bool {
        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, self.drain(scheduler)).await.is_ok();
        if !drained {
            warn!(grace_ms = grace.as_millis() as u64, "Shutdown grace period exceeded, forcing exit");
        }
        drained
    }

    /// Ordered drain: admissions, sessions, schedules, presence, store.
    async fn drain(&self, scheduler: Scheduler) {
        let registry = &self.state.registry;
        registry.close_admissions();
        let detached = registry.detach_all(DetachReason::Shutdown);
        info!(sessions = detached, "Sessions detached");

        scheduler.stop(schedule_stop_budget(self.config.shutdown_grace())).await;

        if let Err(e) = self.state.health.shutdown().await {
            warn!(error = %format!("{:#}", e), "Failed to remove presence records");
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close coordination store");
        }
    }
}

/// Share of the shutdown grace given to in-flight ticks. The rest is left
/// for presence removal and store close.
fn schedule_stop_budget(grace: Duration) -> Duration {
    grace / 2
}

/// Log node events. Health is logged on transitions only.
fn spawn_event_log(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        let mut last_health: Option<HealthState> = None;
        loop {
            match rx.recv().await {
                Ok(NodeEvent::HealthChanged {
                    status,
                    failed_checks,
                }) => {
                    if last_health == Some(status) {
                        continue;
                    }
                    if status == HealthState::Healthy {
                        info!(status = %status, "Node health changed");
                    } else {
                        warn!(status = %status, failed = ?failed_checks, "Node health changed");
                    }
                    last_health = Some(status);
                }
                Ok(NodeEvent::SessionAttached { session_id }) => {
                    debug!(session = %session_id, "event: session attached");
                }
                Ok(NodeEvent::SessionDetached { session_id, reason }) => {
                    debug!(session = %session_id, reason = %reason, "event: session detached");
                }
                Ok(NodeEvent::MetricsCollected(sample)) => {
                    debug!(
                        connections = sample.connections,
                        packets = sample.packets_forwarded,
                        cpu = sample.cpu_usage,
                        memory = sample.memory_usage,
                        "event: metrics collected"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event log lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Bind, build, and serve until a termination signal.
pub async fn run(config: NodeConfig) -> Result<()> {
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let node = Node::build(config).await?;
    node.serve(listener, shutdown_signal()).await
}
