use crate::upstream::Upstream;
use crate::utils::error::{Result, RustBalanceError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::lookup_host;

/// Where a listener forwards its traffic: a named upstream pool or
/// one fixed address.
pub enum PassTarget {
    Upstream(Arc<Upstream>),
    Fixed(SocketAddr),
}

/// Split a `pass` value on its last `:`, yielding the host part and
/// the explicit forwarding port if one was given. IPv4 and bare names
/// only.
fn split_pass(pass: &str) -> Result<(&str, Option<u16>)> {
    match pass.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                RustBalanceError::Resolve(format!("invalid port in pass target '{pass}'"))
            })?;
            Ok((host, Some(port)))
        }
        None => Ok((pass, None)),
    }
}

/// Resolve a listener's `pass` directive against the configured
/// upstreams. An exact name match wins; anything else must resolve as
/// a host address. Returns the target and the forwarding port (the
/// listener's own port when `pass` names none).
pub async fn resolve_pass(
    pass: &str,
    listener_port: u16,
    upstreams: &[Arc<Upstream>],
) -> Result<(PassTarget, u16)> {
    let (host, explicit_port) = split_pass(pass)?;
    let forward_port = explicit_port.unwrap_or(listener_port);

    if let Some(upstream) = upstreams.iter().find(|u| u.name() == host) {
        return Ok((PassTarget::Upstream(upstream.clone()), forward_port));
    }

    let addr = resolve_peer(host, forward_port).await?;
    Ok((PassTarget::Fixed(addr), forward_port))
}

/// Resolve a peer string ("host" or "host:port") to a socket address,
/// filling in `default_port` when the peer carries none.
pub async fn resolve_peer(peer: &str, default_port: u16) -> Result<SocketAddr> {
    let candidate = if peer.contains(':') {
        peer.to_string()
    } else {
        format!("{peer}:{default_port}")
    };

    lookup_host(&candidate)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| RustBalanceError::Resolve(peer.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::HashMode;

    fn pools(names: &[&str]) -> Vec<Arc<Upstream>> {
        names
            .iter()
            .map(|name| Arc::new(Upstream::new_static(*name, Vec::new(), HashMode::None)))
            .collect()
    }

    #[test]
    fn split_pass_forms() {
        assert_eq!(split_pass("backends").unwrap(), ("backends", None));
        assert_eq!(
            split_pass("10.0.0.1:9000").unwrap(),
            ("10.0.0.1", Some(9000))
        );
        assert!(split_pass("backends:notaport").is_err());
        assert!(split_pass("backends:99999").is_err());
    }

    #[tokio::test]
    async fn pass_matches_upstream_by_exact_name() {
        let upstreams = pools(&["backends", "other"]);

        let (target, port) = resolve_pass("backends", 5000, &upstreams).await.unwrap();
        assert!(matches!(target, PassTarget::Upstream(u) if u.name() == "backends"));
        assert_eq!(port, 5000);

        let (target, port) = resolve_pass("other:7000", 5000, &upstreams).await.unwrap();
        assert!(matches!(target, PassTarget::Upstream(u) if u.name() == "other"));
        assert_eq!(port, 7000);
    }

    #[tokio::test]
    async fn pass_falls_back_to_fixed_address() {
        let upstreams = pools(&["backends"]);

        let (target, port) = resolve_pass("127.0.0.1:9000", 5000, &upstreams)
            .await
            .unwrap();
        let expected: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(matches!(target, PassTarget::Fixed(addr) if addr == expected));
        assert_eq!(port, 9000);
    }

    #[tokio::test]
    async fn unresolvable_pass_is_an_error() {
        let upstreams = pools(&["backends"]);
        assert!(matches!(
            resolve_pass("no-such-upstream.invalid", 5000, &upstreams).await,
            Err(RustBalanceError::Resolve(_))
        ));
    }

    #[tokio::test]
    async fn peer_resolution_fills_default_port() {
        let addr = resolve_peer("127.0.0.1", 9000).await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());

        let addr = resolve_peer("127.0.0.1:4000", 9000).await.unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
    }
}
