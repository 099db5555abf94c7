//! Core server: accepts connections and hands each one to a relay session.
//!
//! Admission is bounded by `max_sessions`; a connection over the limit is
//! closed before any session exists for it. Shutdown is broadcast over a
//! watch channel so every live session tears down its upstream subscription
//! before the process exits.

use crate::authenticator::Authenticator;
use crate::config::RelayConfig;
use crate::monitor::FailureReporter;
use crate::relay::session::generate_session_id;
use crate::relay::{
    RelaySession, SessionContext, SessionOutcome, SessionRegistry, SessionSettings, SessionState,
};
use crate::transport::{start_listener, WsConnection};
use crate::upstream::UpstreamConnector;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use zone_core::{DownstreamTransport, ZoneError, ZoneResult};

/// How often the live session count is logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// How long live sessions get to tear down after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The relay server instance.
pub struct RelayServer {
    config: RelayConfig,
    ctx: SessionContext,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(
        config: RelayConfig,
        authenticator: Arc<Authenticator>,
        connector: Arc<dyn UpstreamConnector>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        let settings = SessionSettings {
            liveness_interval: config.liveness_interval,
            auth_timeout: config.auth_timeout,
            connect_timeout: config.upstream.connect_timeout,
            ..SessionSettings::default()
        };
        let ctx = SessionContext {
            authenticator,
            connector,
            reporter,
            registry: Arc::new(SessionRegistry::new()),
            settings,
        };
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            ctx,
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.ctx.registry.clone()
    }

    /// Bind the WebSocket listener.
    pub async fn listen(&self) -> ZoneResult<(SocketAddr, mpsc::Receiver<WsConnection>)> {
        let bind_addr: SocketAddr = self
            .config
            .bind_addr()
            .parse()
            .map_err(|e| ZoneError::Config(format!("invalid listen address: {e}")))?;
        start_listener(bind_addr, &self.config.path).await
    }

    /// Serve connections until `shutdown` resolves or the listener goes away,
    /// then close every live session.
    pub async fn run(
        self,
        mut conns: mpsc::Receiver<WsConnection>,
        shutdown: impl Future<Output = ()>,
    ) -> ZoneResult<()> {
        tokio::pin!(shutdown);
        let mut sessions: JoinSet<SessionOutcome> = JoinSet::new();

        let status_registry = self.ctx.registry.clone();
        let status = tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let entries = status_registry.list().await;
                let relaying = entries
                    .iter()
                    .filter(|e| e.state == SessionState::Relaying)
                    .count();
                info!(live = entries.len(), relaying, "relay status");
                for entry in &entries {
                    debug!(
                        session_id = %entry.id,
                        remote = %entry.remote,
                        state = %entry.state,
                        device = entry.device.as_deref().unwrap_or("-"),
                        age_secs = entry.opened_at.elapsed().as_secs(),
                        "live session"
                    );
                }
            }
        });

        info!(
            path = %self.config.path,
            max_sessions = self.config.max_sessions,
            liveness_ms = self.config.liveness_interval.as_millis() as u64,
            "zone-relay ready"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                conn = conns.recv() => match conn {
                    Some(conn) => self.admit(conn, &mut sessions).await,
                    None => {
                        info!("listener closed, shutting down");
                        break;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => match joined {
                    Ok(outcome) => debug!(
                        session_id = %outcome.id,
                        reason = %outcome.reason,
                        reached = %outcome.reached,
                        forwarded = outcome.events_forwarded,
                        "session finished"
                    ),
                    Err(e) => warn!(error = %e, "session task failed"),
                },
            }
        }

        status.abort();
        self.drain(sessions).await;
        Ok(())
    }

    async fn admit(&self, conn: WsConnection, sessions: &mut JoinSet<SessionOutcome>) {
        let WsConnection {
            mut transport,
            remote_addr,
        } = conn;
        let id = generate_session_id();
        let remote = remote_addr.to_string();

        if !self
            .ctx
            .registry
            .try_register(&id, &remote, self.config.max_sessions)
            .await
        {
            warn!(remote = %remote, max = self.config.max_sessions, "session limit reached, refusing connection");
            tokio::spawn(async move { transport.close().await });
            return;
        }

        debug!(id = %id, remote = %remote, "session admitted");
        let session = RelaySession::new(id.clone(), transport, self.ctx.clone(), self.shutdown_tx.subscribe());
        let span = info_span!("session", id = %id, remote = %remote);
        sessions.spawn(session.run().instrument(span));
    }

    async fn drain(&self, mut sessions: JoinSet<SessionOutcome>) {
        let live = sessions.len();
        if live > 0 {
            info!(live, "closing live sessions");
        }
        self.shutdown_tx.send_replace(true);

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(joined) = sessions.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "session task failed during shutdown");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = sessions.len(), "sessions did not close in time, aborting");
            sessions.abort_all();
        }
        info!("all sessions closed");
    }
}
