use crate::config::ServerConfig;
use crate::server::flow::{run_egress, Flow, FlowTable};
use crate::server::resolver::{resolve_pass, resolve_peer, PassTarget};
use crate::server::MAX_DATAGRAM_SIZE;
use crate::upstream::{HashMode, Upstream};
use crate::utils::error::Result;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Data-path timing knobs. Defaults are the production constants.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Ingress and egress read deadline; bounds shutdown latency.
    pub read_deadline: Duration,
    /// How long a flow may go without client traffic before eviction.
    pub idle_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            read_deadline: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// One bound UDP socket relaying datagrams to its pass target.
///
/// The ingress loop is the only flow creator; egress readers are the
/// only flow removers. Reverse-path traffic from every flow funnels
/// through the shared ingress socket.
pub struct Server {
    socket: Arc<UdpSocket>,
    pass: PassTarget,
    forward_port: u16,
    hash_mode: HashMode,
    flows: Arc<FlowTable>,
    shutdown: broadcast::Sender<()>,
    tracker: TaskTracker,
    ingress_task: Mutex<Option<JoinHandle<()>>>,
    timings: Timings,
}

impl Server {
    /// Bind the ingress socket and resolve the pass target. Failure
    /// here is fatal to startup.
    pub async fn bind(cfg: &ServerConfig, upstreams: &[Arc<Upstream>]) -> Result<Self> {
        Self::bind_with(cfg, upstreams, Timings::default()).await
    }

    pub async fn bind_with(
        cfg: &ServerConfig,
        upstreams: &[Arc<Upstream>],
        timings: Timings,
    ) -> Result<Self> {
        let (pass, forward_port) = resolve_pass(&cfg.pass, cfg.port, upstreams).await?;

        let hash_mode = match &pass {
            PassTarget::Upstream(upstream) => upstream.hash_mode(),
            PassTarget::Fixed(_) => HashMode::None,
        };

        let socket = UdpSocket::bind((cfg.address.as_str(), cfg.port)).await?;

        Ok(Self {
            socket: Arc::new(socket),
            pass,
            forward_port,
            hash_mode,
            flows: Arc::new(FlowTable::new()),
            shutdown: broadcast::channel(1).0,
            tracker: TaskTracker::new(),
            ingress_task: Mutex::new(None),
            timings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Live flow count.
    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Spawn the ingress loop.
    pub fn start(self: Arc<Self>) {
        // Subscribe here so a shutdown issued right after start() is
        // never missed.
        let shutdown = self.shutdown.subscribe();
        let server = self.clone();
        let handle = tokio::spawn(async move { server.run(shutdown).await });
        *self.ingress_task.lock().unwrap() = Some(handle);
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        if let Ok(addr) = self.local_addr() {
            info!(addr = %addr, "listener started");
        }

        loop {
            // Evict flows whose client has gone quiet. Runs every
            // iteration, datagram and deadline alike.
            self.flows.sweep_idle(self.timings.idle_timeout);

            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("listener stopping");
                    return;
                }
                result = timeout(self.timings.read_deadline, self.socket.recv_from(&mut buf)) => {
                    let (len, client) = match result {
                        // Read deadline expired.
                        Err(_) => continue,
                        Ok(Ok(read)) => read,
                        Ok(Err(e)) => {
                            error!("ingress read failed: {e}");
                            return;
                        }
                    };

                    let key = self.flow_key(client);

                    let target = match self.resolve_target(key).await {
                        Ok(target) => target,
                        Err(e) => {
                            warn!(client = %client, "dropping datagram: {e}");
                            continue;
                        }
                    };

                    if let Err(e) = self.handle_client(key, client, target, &buf[..len]).await {
                        warn!(client = %client, target = %target, "dropping datagram: {e}");
                    }
                }
            }
        }
    }

    /// Project the client endpoint onto a flow key per the pool's
    /// hash mode. `None` means fire-and-forget.
    fn flow_key(&self, client: SocketAddr) -> Option<u32> {
        match self.hash_mode {
            HashMode::None => None,
            HashMode::RemoteIp => match client.ip() {
                IpAddr::V4(ip) => Some(u32::from(ip)),
                // No 32-bit projection for IPv6 sources.
                IpAddr::V6(_) => None,
            },
            HashMode::RemotePort => Some(u32::from(client.port())),
        }
    }

    async fn resolve_target(&self, key: Option<u32>) -> Result<SocketAddr> {
        match &self.pass {
            PassTarget::Upstream(upstream) => {
                let peer = upstream.select_peer(key)?;
                resolve_peer(&peer, self.forward_port).await
            }
            PassTarget::Fixed(addr) => Ok(*addr),
        }
    }

    /// Forward one client datagram, creating the flow if needed.
    async fn handle_client(
        &self,
        key: Option<u32>,
        from: SocketAddr,
        to: SocketAddr,
        payload: &[u8],
    ) -> Result<()> {
        let Some(key) = key else {
            // Unhashed traffic: one throwaway socket, no reverse path.
            let throwaway = UdpSocket::bind("0.0.0.0:0").await?;
            throwaway.connect(to).await?;
            throwaway.send(payload).await?;
            return Ok(());
        };

        if let Some(flow) = self.flows.get(key) {
            flow.touch(from);
            flow.backend().send(payload).await?;
            return Ok(());
        }

        let backend = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        backend.connect(to).await?;

        let (terminate_tx, terminate_rx) = mpsc::channel(1);
        let flow = Arc::new(Flow::new(backend, from, terminate_tx));

        // Register before the reader takes its first read.
        self.flows.insert(key, flow.clone());
        self.tracker.spawn(run_egress(
            self.socket.clone(),
            self.flows.clone(),
            key,
            flow.clone(),
            terminate_rx,
            self.timings.read_deadline,
        ));

        debug!(key, client = %from, backend = %to, "flow opened");

        flow.backend().send(payload).await?;
        Ok(())
    }

    /// Graceful teardown: stop the ingress loop, terminate every
    /// flow, and wait for all egress readers to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());

        let ingress = self.ingress_task.lock().unwrap().take();
        if let Some(handle) = ingress {
            let _ = handle.await;
        }

        self.flows.terminate_all();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
