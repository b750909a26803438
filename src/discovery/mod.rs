use crate::utils::error::Result;
use async_trait::async_trait;

pub mod aws;

pub use aws::AutoScalingGroupSource;

/// Produces the current peer membership of a dynamic upstream.
///
/// The pool's refresh task is the only caller. Implementations must
/// be idempotent and side-effect-free beyond the provider API itself.
/// An empty membership list is a valid result, not an error.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn update_peers(&self) -> Result<Vec<String>>;
}
