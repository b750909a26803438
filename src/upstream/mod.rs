use crate::cache::ExpiringMap;
use crate::config::UpstreamConfig;
use crate::discovery::{AutoScalingGroupSource, DiscoverySource};
use crate::utils::error::{Result, RustBalanceError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// How client endpoints are projected onto flow keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    None,
    RemoteIp,
    RemotePort,
}

impl HashMode {
    /// Parse the config string. Absent, empty and `none` map silently;
    /// unknown values fall back to `None` with a warning.
    fn parse(raw: &str) -> Self {
        match raw {
            "" | "none" => HashMode::None,
            "remote_ip" => HashMode::RemoteIp,
            "remote_port" => HashMode::RemotePort,
            other => {
                warn!(hash = other, "incorrect upstream hash, defaulting to none");
                HashMode::None
            }
        }
    }
}

const STICKY_TTL: Duration = Duration::from_secs(60);
const STICKY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// How often dynamic pools re-poll their discovery source.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

struct PoolState {
    targets: Vec<String>,
    rr_cursor: u64,
}

/// A named pool of backend peers plus the policy for picking one.
///
/// `targets` and the round-robin cursor live under one mutex; the
/// sticky cache is only mutated while that mutex is held, which is
/// what keeps selection coherent with membership refreshes.
pub struct Upstream {
    name: String,
    hash_mode: HashMode,
    state: Mutex<PoolState>,
    sticky: Option<Arc<ExpiringMap<String>>>,
    source: Option<Box<dyn DiscoverySource>>,
}

impl Upstream {
    /// Pool with a fixed membership.
    pub fn new_static(
        name: impl Into<String>,
        targets: Vec<String>,
        hash_mode: HashMode,
    ) -> Self {
        Self::build(name, targets, hash_mode, None, STICKY_TTL, STICKY_SWEEP_INTERVAL)
    }

    /// Pool whose membership is maintained by a discovery source.
    /// Starts empty; call `refresh` (or spawn `auto_refresh`) to
    /// populate it.
    pub fn new_dynamic(
        name: impl Into<String>,
        hash_mode: HashMode,
        source: Box<dyn DiscoverySource>,
    ) -> Self {
        Self::build(
            name,
            Vec::new(),
            hash_mode,
            Some(source),
            STICKY_TTL,
            STICKY_SWEEP_INTERVAL,
        )
    }

    fn build(
        name: impl Into<String>,
        targets: Vec<String>,
        hash_mode: HashMode,
        source: Option<Box<dyn DiscoverySource>>,
        sticky_ttl: Duration,
        sticky_sweep: Duration,
    ) -> Self {
        let sticky = (hash_mode != HashMode::None)
            .then(|| Arc::new(ExpiringMap::new(sticky_ttl, sticky_sweep)));

        Self {
            name: name.into(),
            hash_mode,
            state: Mutex::new(PoolState {
                targets,
                rr_cursor: 0,
            }),
            sticky,
            source,
        }
    }

    /// Build an upstream from its configuration block. Unknown `type`
    /// values fall back to static with a warning; an autoscaling pool
    /// without `AWS_REGION` or a group identifier is a hard error.
    pub fn from_config(cfg: &UpstreamConfig) -> Result<Self> {
        let hash_mode = HashMode::parse(&cfg.hash);

        match cfg.kind.as_str() {
            "aws_autoscaling_group" => {
                let region = std::env::var("AWS_REGION").unwrap_or_default();
                if region.is_empty() || cfg.targets.is_empty() {
                    return Err(RustBalanceError::Config(format!(
                        "upstream '{}': AWS_REGION is not set or no autoscaling group is configured",
                        cfg.name
                    )));
                }

                let source = AutoScalingGroupSource::new(region, cfg.targets[0].clone());
                Ok(Self::new_dynamic(&cfg.name, hash_mode, Box::new(source)))
            }
            "" | "static" => Ok(Self::new_static(&cfg.name, cfg.targets.clone(), hash_mode)),
            other => {
                warn!(
                    upstream = %cfg.name,
                    kind = other,
                    "incorrect upstream type, defaulting to static"
                );
                Ok(Self::new_static(&cfg.name, cfg.targets.clone(), hash_mode))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash_mode(&self) -> HashMode {
        self.hash_mode
    }

    pub fn is_dynamic(&self) -> bool {
        self.source.is_some()
    }

    /// Current membership snapshot.
    pub fn targets(&self) -> Vec<String> {
        self.state.lock().unwrap().targets.clone()
    }

    /// Pick a peer for the given flow key.
    ///
    /// Unhashed pools (and keyless datagrams) get plain round-robin.
    /// Hashed pools return the cached peer for the key when one is
    /// live, otherwise round-robin a fresh one into the cache. Reads
    /// never extend the sticky TTL.
    pub fn select_peer(&self, flow_key: Option<u32>) -> Result<String> {
        let mut state = self.state.lock().unwrap();

        let (sticky, key) = match (&self.sticky, flow_key) {
            (Some(sticky), Some(key)) => (sticky, key),
            _ => return Self::round_robin(&mut state),
        };

        if let Some(peer) = sticky.get(key) {
            return Ok(peer);
        }

        let peer = Self::round_robin(&mut state)?;
        sticky.insert(key, peer.clone());
        Ok(peer)
    }

    fn round_robin(state: &mut PoolState) -> Result<String> {
        if state.targets.is_empty() {
            return Err(RustBalanceError::EmptyPool);
        }

        let index = (state.rr_cursor % state.targets.len() as u64) as usize;
        state.rr_cursor = state.rr_cursor.wrapping_add(1);

        Ok(state.targets[index].clone())
    }

    /// Re-fetch membership from the discovery source.
    ///
    /// On success the target list is swapped and every sticky entry
    /// pointing at a departed peer is purged before the lock is
    /// released. On error the current targets stay untouched.
    pub async fn refresh(&self) -> Result<()> {
        let Some(source) = &self.source else {
            return Ok(());
        };

        let new_targets = source.update_peers().await?;

        let mut state = self.state.lock().unwrap();
        state.targets = new_targets;
        if let Some(sticky) = &self.sticky {
            sticky.retain(|peer| state.targets.contains(peer));
        }
        debug!(
            upstream = %self.name,
            peers = state.targets.len(),
            "upstream membership refreshed"
        );

        Ok(())
    }

    /// Refresh immediately, then once per `interval`, until the
    /// shutdown broadcast fires.
    pub async fn auto_refresh(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(upstream = %self.name, "can't update upstream: {e}");
                    }
                }
            }
        }
    }

    /// Spawn the pool's background tasks: the sticky-cache sweeper
    /// and, for dynamic pools, the membership refresh loop.
    pub fn spawn_tasks(self: Arc<Self>, shutdown: &broadcast::Sender<()>) {
        if let Some(sticky) = &self.sticky {
            tokio::spawn(sticky.clone().run_sweeper(shutdown.subscribe()));
        }
        if self.source.is_some() {
            tokio::spawn(self.auto_refresh(REFRESH_INTERVAL, shutdown.subscribe()));
        }
    }

    #[cfg(test)]
    fn set_rr_cursor(&self, cursor: u64) {
        self.state.lock().unwrap().rr_cursor = cursor;
    }
}
