use super::DiscoverySource;
use crate::utils::error::{Result, RustBalanceError};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::types::Filter;
use tracing::debug;

/// Discovers peers from the running instances of an EC2 autoscaling
/// group. Peers are returned as bare private IPv4 addresses; the
/// listener's forwarding port applies when relaying to them.
pub struct AutoScalingGroupSource {
    region: String,
    group_name: String,
}

impl AutoScalingGroupSource {
    pub fn new(region: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            group_name: group_name.into(),
        }
    }
}

#[async_trait]
impl DiscoverySource for AutoScalingGroupSource {
    async fn update_peers(&self) -> Result<Vec<String>> {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .load()
            .await;

        let autoscaling = aws_sdk_autoscaling::Client::new(&shared);
        let groups = autoscaling
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(&self.group_name)
            .send()
            .await
            .map_err(|e| RustBalanceError::Discovery(e.to_string()))?;

        let group = match groups.auto_scaling_groups() {
            [group] => group,
            _ => {
                return Err(RustBalanceError::Discovery(format!(
                    "No AutoScalingGroup found '{}'",
                    self.group_name
                )))
            }
        };

        let instance_ids: Vec<String> = group
            .instances()
            .iter()
            .filter_map(|instance| instance.instance_id().map(str::to_string))
            .collect();

        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }

        let ec2 = aws_sdk_ec2::Client::new(&shared);
        let described = ec2
            .describe_instances()
            .set_instance_ids(Some(instance_ids))
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("running")
                    .build(),
            )
            .send()
            .await
            .map_err(|e| RustBalanceError::Discovery(e.to_string()))?;

        let peers: Vec<String> = described
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .filter_map(|instance| instance.private_ip_address().map(str::to_string))
            .collect();

        debug!(
            group = %self.group_name,
            peers = peers.len(),
            "autoscaling group membership fetched"
        );

        Ok(peers)
    }
}
