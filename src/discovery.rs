use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use service::SessionInfo;

/// A session announced by another host.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSession {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
    #[serde(default)]
    pub address_v6: Option<Ipv6Addr>,
}

impl RemoteSession {
    /// Control endpoint to invite, IPv4 preferred.
    ///
    /// # Test
    ///
    /// ```
    /// use std::net::Ipv4Addr;
    /// use rtpmidi_server::discovery::RemoteSession;
    ///
    /// let remote = RemoteSession {
    ///     name: "Studio".to_string(),
    ///     host: "studio.local".to_string(),
    ///     port: 5004,
    ///     address: Some(Ipv4Addr::new(192, 168, 1, 20)),
    ///     address_v6: None,
    /// };
    ///
    /// assert_eq!(remote.control_address(), Some("192.168.1.20:5004".parse().unwrap()));
    /// ```
    pub fn control_address(&self) -> Option<SocketAddr> {
        let ip = self
            .address
            .map(IpAddr::V4)
            .or(self.address_v6.map(IpAddr::V6))?;

        Some(SocketAddr::new(ip, self.port))
    }
}

/// Service discovery backend.
///
/// Published sessions are announced when they become ready and withdrawn
/// when they end. Remote announcements are fed back into the manager with
/// [`crate::manager::Manager::remote_session_up`] and
/// [`crate::manager::Manager::remote_session_down`].
pub trait Discovery: Send + Sync {
    fn publish(&self, session: &SessionInfo);

    fn unpublish(&self, session: &SessionInfo);
}

/// Discovery that announces nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiscovery;

impl Discovery for NoopDiscovery {
    fn publish(&self, session: &SessionInfo) {
        log::debug!(
            "discovery disabled, not publishing: name={}, port={}",
            session.bonjour_name,
            session.port
        );
    }

    fn unpublish(&self, _: &SessionInfo) {}
}
