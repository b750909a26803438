use crate::server::MAX_DATAGRAM_SIZE;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// One client flow: an outbound socket connected to the chosen
/// backend plus the client return path.
///
/// The client IP is fixed for the life of the flow; the port follows
/// the client when its source port moves. Only the egress reader
/// removes a flow from the table.
pub struct Flow {
    backend: Arc<UdpSocket>,
    client_ip: IpAddr,
    client_port: AtomicU16,
    last_activity: AtomicI64,
    terminate: mpsc::Sender<()>,
}

impl Flow {
    pub fn new(backend: Arc<UdpSocket>, client: SocketAddr, terminate: mpsc::Sender<()>) -> Self {
        Self {
            backend,
            client_ip: client.ip(),
            client_port: AtomicU16::new(client.port()),
            last_activity: AtomicI64::new(now_millis()),
            terminate,
        }
    }

    pub fn backend(&self) -> &UdpSocket {
        &self.backend
    }

    /// Current client return address, reflecting any port touch-up.
    pub fn client_addr(&self) -> SocketAddr {
        SocketAddr::new(self.client_ip, self.client_port.load(Ordering::Relaxed))
    }

    /// Record client activity, following the source port if it moved.
    pub fn touch(&self, from: SocketAddr) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
        if from.port() != self.client_port.load(Ordering::Relaxed) {
            self.client_port.store(from.port(), Ordering::Relaxed);
        }
    }

    fn idle_for(&self) -> Duration {
        let elapsed = now_millis().saturating_sub(self.last_activity.load(Ordering::Relaxed));
        Duration::from_millis(elapsed.max(0) as u64)
    }

    /// Ask the egress reader to wind down. The channel slot is
    /// single-shot; signaling a flow that is already signaled or
    /// already exiting is fine.
    pub fn signal_terminate(&self) {
        let _ = self.terminate.try_send(());
    }
}

/// Per-listener table of live flows, keyed by flow key.
#[derive(Default)]
pub struct FlowTable {
    flows: DashMap<u32, Arc<Flow>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: u32) -> Option<Arc<Flow>> {
        self.flows.get(&key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: u32, flow: Arc<Flow>) {
        self.flows.insert(key, flow);
    }

    pub fn remove(&self, key: u32) {
        self.flows.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Signal terminate on every flow idle longer than `threshold`.
    /// Deletion is the egress reader's job.
    pub fn sweep_idle(&self, threshold: Duration) {
        for entry in self.flows.iter() {
            if entry.value().idle_for() >= threshold {
                trace!(key = entry.key(), "flow idle, terminating");
                entry.value().signal_terminate();
            }
        }
    }

    /// Signal terminate on every flow (listener shutdown).
    pub fn terminate_all(&self) {
        for entry in self.flows.iter() {
            entry.value().signal_terminate();
        }
    }
}

/// Relay backend replies to the client until terminated.
///
/// One task per flow. The terminate signal is checked whenever a read
/// completes or its deadline expires, so shutdown latency is bounded
/// by `read_deadline`. Every exit path removes the flow from the
/// table; the backend socket closes when the last reference drops.
pub(crate) async fn run_egress(
    ingress: Arc<UdpSocket>,
    flows: Arc<FlowTable>,
    key: u32,
    flow: Arc<Flow>,
    mut terminate: mpsc::Receiver<()>,
    read_deadline: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = terminate.recv() => {
                trace!(key, "flow terminated");
                break;
            }
            result = timeout(read_deadline, flow.backend.recv(&mut buf)) => match result {
                Ok(Ok(len)) => {
                    let client = flow.client_addr();
                    if let Err(e) = ingress.send_to(&buf[..len], client).await {
                        warn!(key, client = %client, "can't relay backend reply: {e}");
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!(key, "backend read failed: {e}");
                    break;
                }
                // Deadline expired; loop to check terminate again.
                Err(_) => continue,
            }
        }
    }

    flows.remove(key);
}
