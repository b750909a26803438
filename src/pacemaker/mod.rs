use crate::config::PacemakerConfig;
use crate::utils::error::{Result, RustBalanceError};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Periodic CloudWatch heartbeat proving the process is alive.
/// Entirely decoupled from the data path: failures here only cost
/// observability.
pub struct Pacemaker {
    client: aws_sdk_cloudwatch::Client,
    namespace: String,
    metric: String,
    dimension: Dimension,
    interval: Duration,
}

impl Pacemaker {
    /// Build from config. The `InstanceId` dimension value falls back
    /// to EC2 instance metadata when the config carries none.
    pub async fn from_config(cfg: &PacemakerConfig) -> Result<Self> {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .load()
            .await;

        let instance_id = match cfg.dimension_value.as_deref() {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => fetch_instance_id().await?,
        };

        let dimension = Dimension::builder()
            .name("InstanceId")
            .value(instance_id)
            .build();

        Ok(Self {
            client: aws_sdk_cloudwatch::Client::new(&shared),
            namespace: cfg.namespace.clone(),
            metric: cfg.metric.clone(),
            dimension,
            interval: Duration::from_secs(cfg.interval.max(1)),
        })
    }

    /// Emit one alive datum.
    pub async fn heartbeat(&self) -> Result<()> {
        let datum = MetricDatum::builder()
            .metric_name(&self.metric)
            .unit(StandardUnit::Count)
            .value(1.0)
            .dimensions(self.dimension.clone())
            .build();

        self.client
            .put_metric_data()
            .namespace(&self.namespace)
            .metric_data(datum)
            .send()
            .await
            .map_err(|e| RustBalanceError::Pacemaker(e.to_string()))?;

        debug!(namespace = %self.namespace, metric = %self.metric, "heartbeat sent");
        Ok(())
    }

    /// Heartbeat immediately, then once per configured interval,
    /// until the shutdown broadcast fires. Failures are logged and
    /// never stop the loop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!("heartbeat failed: {e}");
                    }
                }
            }
        }
    }
}

async fn fetch_instance_id() -> Result<String> {
    let imds = aws_config::imds::Client::builder().build();
    let instance_id = imds
        .get("/latest/meta-data/instance-id")
        .await
        .map_err(|e| {
            RustBalanceError::Pacemaker(format!("can't read instance metadata: {e}"))
        })?;

    Ok(instance_id.as_ref().to_string())
}
