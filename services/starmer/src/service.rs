//! Service control loop.
//!
//! A single task owns the accept loop and the live configuration. It waits
//! on two things:
//! - connections handed off by the current [`AcceptLoop`], each dispatched
//!   to its own session task with a snapshot of the live config
//! - change notifications from the config watcher, which trigger a reload
//!
//! A reload builds a fresh [`Config`]. If the listen address changed, the new
//! listener is bound first and the old one closed once that succeeded, so at
//! most one listener is live after a rebind. Sessions already running keep
//! the snapshot they started with and are not interrupted.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{Config, ConfigError, ConfigSource};
use crate::proxy::{session, AcceptLoop, Accepted};

/// How often the config file's modification time is checked.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Conditions that stop the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What the config watcher reports.
#[derive(Debug)]
enum ConfigEvent {
    Changed,
    Failed(ConfigError),
}

/// The proxy service: one listener, one live config, many sessions.
pub struct Service {
    source: ConfigSource,
    config: Arc<ArcSwap<Config>>,
    poll_interval: Duration,
    listening: watch::Sender<Option<SocketAddr>>,
}

impl Service {
    /// Create a service around an already loaded config.
    pub fn new(source: ConfigSource, config: Config) -> Self {
        let (listening, _) = watch::channel(None);
        Self {
            source,
            config: Arc::new(ArcSwap::from_pointee(config)),
            poll_interval: POLL_INTERVAL,
            listening,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Handle to the live config.
    pub fn config(&self) -> Arc<ArcSwap<Config>> {
        Arc::clone(&self.config)
    }

    /// Address of the current listener, updated on every bind.
    pub fn listening(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.listening.subscribe()
    }

    /// Serve until a fatal error.
    pub async fn run(self) -> Result<(), ServiceError> {
        let (handoff, mut accepted) = mpsc::unbounded_channel();
        let (events_tx, mut events) = mpsc::channel(1);

        let initial = self.config.load_full();
        let mut accept = bind(&initial, handoff.clone()).await?;
        self.listening.send_replace(Some(accept.local_addr()));

        tokio::spawn(watch_config(
            self.source.clone(),
            initial.modified,
            self.poll_interval,
            events_tx,
        ));

        loop {
            tokio::select! {
                Some((stream, peer)) = accepted.recv() => {
                    self.dispatch(stream, peer);
                }
                Some(event) = events.recv() => match event {
                    ConfigEvent::Changed => {
                        accept = self.reload(accept, &handoff).await?;
                    }
                    ConfigEvent::Failed(e) => {
                        error!(error = %e, "Config watch failed");
                        accept.close().await;
                        return Err(e.into());
                    }
                },
                else => break,
            }
        }

        accept.close().await;
        Ok(())
    }

    /// Load the changed config and move the listener if its address changed.
    async fn reload(
        &self,
        accept: AcceptLoop,
        handoff: &mpsc::UnboundedSender<Accepted>,
    ) -> Result<AcceptLoop, ServiceError> {
        info!(path = %self.source.path().display(), "Config changed, reloading");

        let next = self.source.load().await?;
        let current = self.config.load_full();

        let accept = if next.listen_addr == current.listen_addr {
            debug!(listen_addr = %next.listen_addr, "Listen address unchanged");
            accept
        } else {
            rebind(accept, &next, handoff).await?
        };

        if next.same_settings(&current) {
            // Live snapshot stays as is.
            debug!("Reloaded config is unchanged");
        } else {
            self.config.store(Arc::new(next));
        }

        self.listening.send_replace(Some(accept.local_addr()));
        Ok(accept)
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let config = self.config.load_full();

        tokio::spawn(
            async move {
                match session::run(stream, config).await {
                    Ok(_) => {}
                    Err(e) if e.is_benign() => debug!(error = %e, "Session ended"),
                    Err(e) => warn!(error = %e, "Session failed"),
                }
            }
            .instrument(info_span!("session", peer = %peer)),
        );
    }
}

/// Bind the first of the config's candidate addresses that works.
async fn bind(
    config: &Config,
    handoff: mpsc::UnboundedSender<Accepted>,
) -> Result<AcceptLoop, ServiceError> {
    let mut last_error = None;
    for addr in config.bind_addrs() {
        match AcceptLoop::bind(&addr, handoff.clone()).await {
            Ok(accept) => return Ok(accept),
            Err(e) => {
                debug!(bind_addr = %addr, error = %e, "Bind attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(ServiceError::Bind {
        addr: config.listen_addr.clone(),
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "nothing to bind")),
    })
}

/// Move the listener to `next`'s address.
///
/// The new address is bound while the old listener still accepts. Only if
/// that fails with the address in use, which is what happens when the new
/// address covers the old one (same port, wider host), is the old listener
/// closed first and the bind retried once.
async fn rebind(
    accept: AcceptLoop,
    next: &Config,
    handoff: &mpsc::UnboundedSender<Accepted>,
) -> Result<AcceptLoop, ServiceError> {
    match bind(next, handoff.clone()).await {
        Ok(fresh) => {
            accept.close().await;
            Ok(fresh)
        }
        Err(ServiceError::Bind { source, .. }) if source.kind() == io::ErrorKind::AddrInUse => {
            debug!(
                old = %accept.local_addr(),
                listen_addr = %next.listen_addr,
                "New address overlaps the old listener, closing it first"
            );
            accept.close().await;
            bind(next, handoff.clone()).await
        }
        Err(e) => Err(e),
    }
}

/// Poll the config file and report when its modification time moves.
///
/// Stops after reporting a failure, or once nobody is listening.
async fn watch_config(
    source: ConfigSource,
    mut last: SystemTime,
    interval: Duration,
    events: mpsc::Sender<ConfigEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let event = match source.modified().await {
            Ok(modified) if modified == last => continue,
            Ok(modified) => {
                last = modified;
                ConfigEvent::Changed
            }
            Err(e) => ConfigEvent::Failed(e),
        };

        let failed = matches!(event, ConfigEvent::Failed(_));
        if events.send(event).await.is_err() || failed {
            break;
        }
    }
}
