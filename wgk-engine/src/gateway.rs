//! Default gateway redirection
//!
//! When one peer carries all traffic, its own endpoint must still be reached
//! through the real default gateway. The redirector keeps a host route to that
//! endpoint for as long as the peer is the default gateway peer.

use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::Mutex;
use wgk_tun::platform::Platform;
use wgk_tun::route::Gateway;

use crate::config::{VpnPeer, DEFAULT_ENDPOINT_PORT};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Binding {
    peer: String,
    endpoint: IpAddr,
    gateway: Gateway,
}

/// Keeps the endpoint of the default gateway peer routed outside the tunnel
pub struct GatewayRedirector {
    platform: Arc<dyn Platform>,
    binding: Mutex<Option<Binding>>,
}

/// Resolve a peer's endpoint host to one address
pub fn resolve_endpoint(peer: &VpnPeer) -> Result<IpAddr> {
    let host = peer
        .endpoint_address()
        .ok_or_else(|| Error::Gateway(format!("peer {} has no endpoint", peer.public_key)))?;
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }
    let port = peer.endpoint_port().unwrap_or(DEFAULT_ENDPOINT_PORT);
    (host, port)
        .to_socket_addrs()?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| Error::Gateway(format!("{} did not resolve to any address", host)))
}

impl GatewayRedirector {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            binding: Mutex::new(None),
        }
    }

    /// Public key of the current default gateway peer
    pub fn current_peer(&self) -> Option<String> {
        self.binding.lock().as_ref().map(|b| b.peer.clone())
    }

    /// Make `peer` the default gateway peer
    pub fn set_default_gateway_peer(&self, peer: &VpnPeer) -> Result<()> {
        let gateway = self
            .platform
            .default_gateway()?
            .ok_or_else(|| Error::Gateway("no default gateway found".into()))?;

        let previous = self.binding.lock().take();
        if let Some(old) = previous {
            log::info!("Dropping previous gateway peer {}", old.peer);
            self.remove_route(&old);
        }

        let endpoint = resolve_endpoint(peer)?;
        log::info!(
            "Routing endpoint {} of {} via {}",
            endpoint,
            peer.public_key,
            gateway
        );
        self.platform.add_host_route(endpoint, &gateway)?;
        *self.binding.lock() = Some(Binding {
            peer: peer.public_key.clone(),
            endpoint,
            gateway,
        });
        Ok(())
    }

    /// Take over a redirection installed by an earlier process
    ///
    /// Nothing is routed; the binding only lets a later reset remove the
    /// host route.
    pub fn adopt(&self, peer: &VpnPeer) -> Result<()> {
        let gateway = self
            .platform
            .default_gateway()?
            .ok_or_else(|| Error::Gateway("no default gateway found".into()))?;
        let endpoint = resolve_endpoint(peer)?;
        *self.binding.lock() = Some(Binding {
            peer: peer.public_key.clone(),
            endpoint,
            gateway,
        });
        Ok(())
    }

    /// Undo [`set_default_gateway_peer`](Self::set_default_gateway_peer) for `peer`
    ///
    /// The host route is only removed if it was installed for this peer's
    /// current endpoint; a stale binding is dropped quietly.
    pub fn reset_default_gateway_peer(&self, peer: &VpnPeer) -> Result<()> {
        let mut guard = self.binding.lock();
        let Some(binding) = guard.as_ref() else {
            return Ok(());
        };
        if binding.peer != peer.public_key {
            return Ok(());
        }
        let binding = binding.clone();
        *guard = None;
        drop(guard);

        let current = peer
            .endpoint_address()
            .and_then(|h| h.parse::<IpAddr>().ok())
            .or_else(|| resolve_endpoint(peer).ok());
        if current == Some(binding.endpoint) {
            self.platform
                .remove_host_route(binding.endpoint, &binding.gateway)?;
        } else {
            log::debug!("Gateway binding for {} is stale, discarding", binding.peer);
        }
        Ok(())
    }

    fn remove_route(&self, binding: &Binding) {
        if let Err(e) = self
            .platform
            .remove_host_route(binding.endpoint, &binding.gateway)
        {
            log::warn!("Failed to remove route to {}: {}", binding.endpoint, e);
        }
    }
}
