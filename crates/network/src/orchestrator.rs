//! Wires the transport, behaviour and background tasks together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relay_storage::Storage;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::behaviour::Behaviour;
use crate::config::NetworkConfig;
use crate::connection::ConnectionParams;
use crate::error::NetworkError;
use crate::events::{mailbox, InfoEvent, Mailbox, ProtocolEvent};
use crate::metrics::NetworkMetrics;
use crate::peer::PeerSinks;
use crate::transport::{Dialer, Transport};

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Owns every long-running relay task.
///
/// Construction wires the components; [`Orchestrator::start`] binds the
/// listener and launches the accept loop, periodic tasks and worker pools;
/// [`Orchestrator::stop`] cancels them, waits for them and persists state.
pub struct Orchestrator {
    config: Arc<NetworkConfig>,
    behaviour: Arc<Behaviour>,
    transport: Arc<Transport>,
    info: Mailbox<InfoEvent>,
    protocol_rx: Option<mpsc::Receiver<ProtocolEvent>>,
    info_rx: Option<mpsc::Receiver<InfoEvent>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Orchestrator {
    pub fn new(
        config: NetworkConfig,
        storage: Arc<dyn Storage>,
        cancel: CancellationToken,
    ) -> Result<Self, NetworkError> {
        config.validate().map_err(NetworkError::Config)?;
        let config = Arc::new(config);
        let metrics = Arc::new(NetworkMetrics::new());

        let (protocol, protocol_rx) =
            mailbox("protocol", config.mailbox_capacity, metrics.clone());
        let (info, info_rx) = mailbox("info", config.mailbox_capacity, metrics.clone());

        let sinks = PeerSinks {
            protocol,
            info: info.clone(),
            metrics: metrics.clone(),
            cancel: cancel.clone(),
        };
        let params = ConnectionParams::from_config(&config, metrics.clone());
        let transport = Arc::new(Transport::new(config.clone(), params, sinks));
        let behaviour = Arc::new(Behaviour::new(
            config.clone(),
            storage,
            transport.clone() as Arc<dyn Dialer>,
            metrics,
            cancel.clone(),
        ));

        Ok(Self {
            config,
            behaviour,
            transport,
            info,
            protocol_rx: Some(protocol_rx),
            info_rx: Some(info_rx),
            cancel,
            tasks: Vec::new(),
            local_addr: None,
        })
    }

    pub fn behaviour(&self) -> Arc<Behaviour> {
        self.behaviour.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind (if configured) and launch every task. A bind failure is the
    /// only fatal error.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        let (Some(protocol_rx), Some(info_rx)) = (self.protocol_rx.take(), self.info_rx.take())
        else {
            return Err(NetworkError::Config("orchestrator already started".into()));
        };

        if let Some(bind) = self.config.bind_address {
            let listener = TcpListener::bind(bind)
                .await
                .map_err(|source| NetworkError::Bind { addr: bind, source })?;
            let local = listener.local_addr().unwrap_or(bind);
            self.local_addr = Some(local);
            info!(address = %local, "listening for peers");
            self.spawn_accept_loop(listener);
        } else {
            info!("no bind address configured, inbound connections disabled");
        }

        self.spawn_workers("protocol", protocol_rx, |behaviour, event| {
            behaviour.handle_protocol(event)
        });
        self.spawn_workers("info", info_rx, |behaviour, event| {
            behaviour.handle_info(event)
        });

        let config = self.config.clone();
        self.spawn_periodic(
            "send-known-peers",
            config.send_known_peers_interval,
            |behaviour| behaviour.send_all_my_known_peers(),
        );
        self.spawn_periodic(
            "ask-known-peers",
            config.ask_known_peers_interval,
            |behaviour| behaviour.ask_about_known_peers(),
        );
        self.spawn_periodic(
            "spawn-known-peers",
            config.spawn_known_peers_interval,
            |behaviour| {
                behaviour.spawn_known_peers();
            },
        );
        self.spawn_periodic(
            "save-known-peers",
            config.known_peers_save_interval,
            |behaviour| behaviour.save_known_peers(),
        );

        for seed in &config.seed_peers {
            self.behaviour.address(*seed);
        }

        info!(
            workers = config.worker_count(),
            seeds = config.seed_peers.len(),
            "relay network started"
        );
        Ok(())
    }

    /// Cancel everything, wait for the tasks and persist state.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "relay task panicked");
                }
            }
        }
        self.behaviour.stop();
        info!("relay network stopped");
    }

    /// Start, run until the cancellation token fires, then stop.
    pub async fn run(mut self) -> Result<(), NetworkError> {
        self.start().await?;
        self.cancel.cancelled().await;
        self.stop().await;
        Ok(())
    }

    fn spawn_accept_loop(&mut self, listener: TcpListener) {
        let transport = self.transport.clone();
        let info = self.info.clone();
        let cancel = self.cancel.clone();

        self.tasks.push(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep(ACCEPT_ERROR_PAUSE) => continue,
                        }
                    }
                };
                debug!(remote = %remote, "inbound connection");

                let transport = transport.clone();
                let info = info.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    match transport.accept(stream).await {
                        Ok(peer) => {
                            if let Err(InfoEvent::Connected(peer)) =
                                info.deliver(InfoEvent::Connected(peer), &cancel).await
                            {
                                peer.close();
                            }
                        }
                        Err(e) => debug!(remote = %remote, error = %e, "inbound handshake failed"),
                    }
                });
            }
            debug!("accept loop stopped");
        }));
    }

    fn spawn_workers<T, F>(&mut self, pool: &'static str, rx: mpsc::Receiver<T>, handle: F)
    where
        T: Send + 'static,
        F: Fn(&Behaviour, T) + Send + Sync + Copy + 'static,
    {
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..self.config.worker_count() {
            let rx = rx.clone();
            let behaviour = self.behaviour.clone();
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    let event = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            event = rx.recv() => event,
                        }
                    };
                    match event {
                        Some(event) => handle(&behaviour, event),
                        None => break,
                    }
                }
                debug!(pool, worker, "worker stopped");
            }));
        }
    }

    fn spawn_periodic<F>(&mut self, name: &'static str, period: Duration, tick: F)
    where
        F: Fn(&Arc<Behaviour>) + Send + 'static,
    {
        if period.is_zero() {
            warn!(task = name, "periodic task disabled by zero interval");
            return;
        }
        let behaviour = self.behaviour.clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => tick(&behaviour),
                }
            }
            debug!(task = name, "periodic task stopped");
        }));
    }
}
