//! Peer address admission.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use ipnet::IpNet;
use tracing::{info, warn};

/// Networks allowed to reach the hooks.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    networks: Vec<IpNet>,
}

impl AllowList {
    pub fn new(networks: Vec<IpNet>) -> Self {
        for net in &networks {
            info!("Adding IP filter {}", net);
        }
        Self { networks }
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn allows(&self, addr: IpAddr) -> bool {
        let addr = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
            v4 => v4,
        };
        self.networks.iter().any(|net| net.contains(&addr))
    }
}

/// Middleware rejecting peers outside the allow-list.
pub async fn admit_peer(
    State(allow): State<Arc<AllowList>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match peer {
        Some(ip) if allow.allows(ip) => next.run(request).await,
        Some(ip) => {
            warn!("Rejected request from {} to {}", ip, request.uri().path());
            StatusCode::FORBIDDEN.into_response()
        }
        None => {
            warn!("Rejected request with unknown peer to {}", request.uri().path());
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> AllowList {
        AllowList::new(entries.iter().map(|e| e.parse().unwrap()).collect())
    }

    #[test]
    fn matches_networks() {
        let allow = list(&["10.0.0.0/8", "192.168.1.7/32"]);
        assert!(allow.allows("10.20.30.40".parse().unwrap()));
        assert!(allow.allows("192.168.1.7".parse().unwrap()));
        assert!(!allow.allows("192.168.1.8".parse().unwrap()));
    }

    #[test]
    fn ipv4_mapped_peers_match_ipv4_networks() {
        let allow = list(&["127.0.0.1/32"]);
        assert!(allow.allows("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!allow.allows("::1".parse().unwrap()));
    }
}
