//! Destination policy for new streams

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use regex::RegexSet;
use thiserror::Error;
use tracing::debug;
use wisp_mux::packet::{CloseReason, ConnectPacket, StreamType};
use wisp_mux::upstream::{AccessFilter, ConnectionContext, FilterVerdict};

use super::config::WispConfig;
use super::resolver::get_resolver;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Invalid hostname pattern")]
    InvalidPattern(#[from] regex::Error),
}

// IP validation helpers
fn ipv4_is_private(addr: Ipv4Addr) -> bool {
    addr.is_private() || addr.is_link_local()
}

fn ipv6_is_private(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00 // Unique local
        || (addr.segments()[0] & 0xffc0) == 0xfe80 // Link local
}

fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => ipv4_is_private(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => ipv4_is_private(v4),
            None => ipv6_is_private(v6),
        },
    }
}

// 0.0.0.0 and :: reach the local host too
fn is_loopback(addr: IpAddr) -> bool {
    let addr = match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        IpAddr::V4(_) => addr,
    };
    addr.is_loopback() || addr.is_unspecified()
}

/// The server's [`AccessFilter`], driven by [`WispConfig`].
pub struct WispFilter {
    config: Arc<WispConfig>,
    hostname_whitelist: Option<RegexSet>,
    hostname_blacklist: Option<RegexSet>,
}

impl WispFilter {
    pub fn new(config: Arc<WispConfig>) -> Result<Self, FilterError> {
        let compile = |patterns: &[String]| {
            (!patterns.is_empty())
                .then(|| RegexSet::new(patterns))
                .transpose()
        };
        Ok(Self {
            hostname_whitelist: compile(&config.hostname_whitelist)?,
            hostname_blacklist: compile(&config.hostname_blacklist)?,
            config,
        })
    }

    fn is_hostname_blocked(&self, host: &str) -> bool {
        match (&self.hostname_whitelist, &self.hostname_blacklist) {
            (Some(whitelist), _) => !whitelist.is_match(host),
            (None, Some(blacklist)) => blacklist.is_match(host),
            (None, None) => false,
        }
    }

    fn is_address_allowed(&self, addr: IpAddr) -> bool {
        if is_loopback(addr) {
            return self.config.allow_loopback;
        }
        !is_private(addr) || self.config.allow_private
    }

    /// Checks that need neither DNS nor a connection.
    fn check_request(&self, request: &ConnectPacket) -> Option<CloseReason> {
        match request.stream_type {
            StreamType::Tcp if !self.config.allow_tcp => {
                return Some(CloseReason::ServerStreamBlockedAddress);
            }
            StreamType::Udp if !self.config.allow_udp => {
                return Some(CloseReason::ServerStreamBlockedAddress);
            }
            StreamType::Other(_) => return Some(CloseReason::ServerStreamInvalidInfo),
            _ => {}
        }

        if self.is_hostname_blocked(&request.host) {
            debug!("Hostname {} is blocked", request.host);
            return Some(CloseReason::ServerStreamBlockedAddress);
        }
        if self.config.is_port_blocked(request.port) {
            debug!("Port {} is blocked", request.port);
            return Some(CloseReason::ServerStreamBlockedAddress);
        }
        if !self.config.allow_direct_ip && request.host.parse::<IpAddr>().is_ok() {
            debug!("Direct IP {} is blocked", request.host);
            return Some(CloseReason::ServerStreamBlockedAddress);
        }
        None
    }

    fn check_limits(&self, host: &str, context: &ConnectionContext) -> Option<CloseReason> {
        if self
            .config
            .stream_limit_total
            .is_some_and(|limit| context.stream_count >= limit)
        {
            debug!("Stream limit reached ({} streams)", context.stream_count);
            return Some(CloseReason::ServerStreamThrottled);
        }
        if self
            .config
            .stream_limit_per_host
            .is_some_and(|limit| context.streams_to_host >= limit)
        {
            debug!("Stream limit for {} reached", host);
            return Some(CloseReason::ServerStreamThrottled);
        }
        None
    }

    /// Resolve the host and pick the first address the policy allows.
    async fn resolve(&self, request: &ConnectPacket) -> Result<ConnectPacket, CloseReason> {
        let addrs = match request.host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => get_resolver().resolve(&request.host).await.map_err(|e| {
                debug!("{:#}", e);
                CloseReason::ServerStreamUnreachable
            })?,
        };
        if addrs.is_empty() {
            return Err(CloseReason::ServerStreamUnreachable);
        }

        let addr = addrs
            .into_iter()
            .find(|addr| self.is_address_allowed(*addr))
            .ok_or_else(|| {
                debug!("All addresses of {} are blocked", request.host);
                CloseReason::ServerStreamBlockedAddress
            })?;
        Ok(ConnectPacket {
            stream_type: request.stream_type,
            host: addr.to_string(),
            port: request.port,
        })
    }
}

#[async_trait]
impl AccessFilter for WispFilter {
    async fn evaluate(
        &self,
        request: &ConnectPacket,
        context: Option<&ConnectionContext>,
    ) -> FilterVerdict {
        if let Some(reason) = self.check_request(request) {
            return FilterVerdict::Deny(reason);
        }
        // no limits without a wisp connection (wsproxy)
        if let Some(reason) = context.and_then(|c| self.check_limits(&request.host, c)) {
            return FilterVerdict::Deny(reason);
        }
        match self.resolve(request).await {
            Ok(destination) => FilterVerdict::Allow(destination),
            Err(reason) => FilterVerdict::Deny(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(config: WispConfig) -> WispFilter {
        WispFilter::new(Arc::new(config)).unwrap()
    }

    fn tcp(host: &str, port: u16) -> ConnectPacket {
        ConnectPacket {
            stream_type: StreamType::Tcp,
            host: host.to_string(),
            port,
        }
    }

    async fn verdict(filter: &WispFilter, request: ConnectPacket) -> FilterVerdict {
        filter.evaluate(&request, None).await
    }

    #[tokio::test]
    async fn public_ip_is_allowed() {
        let filter = filter(WispConfig::default());
        assert_eq!(
            verdict(&filter, tcp("93.184.215.14", 80)).await,
            FilterVerdict::Allow(tcp("93.184.215.14", 80))
        );
    }

    #[tokio::test]
    async fn blocked_port_and_type() {
        let filter = filter(WispConfig {
            allow_udp: false,
            ..Default::default()
        });
        assert_eq!(
            verdict(&filter, tcp("93.184.215.14", 25)).await,
            FilterVerdict::Deny(CloseReason::ServerStreamBlockedAddress)
        );

        let udp = ConnectPacket {
            stream_type: StreamType::Udp,
            ..tcp("1.1.1.1", 53)
        };
        assert_eq!(
            verdict(&filter, udp).await,
            FilterVerdict::Deny(CloseReason::ServerStreamBlockedAddress)
        );

        let other = ConnectPacket {
            stream_type: StreamType::Other(9),
            ..tcp("1.1.1.1", 53)
        };
        assert_eq!(
            verdict(&filter, other).await,
            FilterVerdict::Deny(CloseReason::ServerStreamInvalidInfo)
        );
    }

    #[tokio::test]
    async fn hostname_lists() {
        let blacklisted = filter(WispConfig {
            hostname_blacklist: vec![r"(^|\.)evil\.example$".into()],
            ..Default::default()
        });
        assert_eq!(
            verdict(&blacklisted, tcp("www.evil.example", 443)).await,
            FilterVerdict::Deny(CloseReason::ServerStreamBlockedAddress)
        );

        let whitelisted = filter(WispConfig {
            hostname_whitelist: vec![r"^93\.184\.".into()],
            hostname_blacklist: vec![".*".into()],
            ..Default::default()
        });
        assert!(matches!(
            verdict(&whitelisted, tcp("93.184.215.14", 443)).await,
            FilterVerdict::Allow(_)
        ));
        assert_eq!(
            verdict(&whitelisted, tcp("1.1.1.1", 443)).await,
            FilterVerdict::Deny(CloseReason::ServerStreamBlockedAddress)
        );
    }

    #[tokio::test]
    async fn address_policy() {
        let strict = filter(WispConfig {
            allow_private: false,
            ..Default::default()
        });
        for host in ["127.0.0.1", "10.1.2.3", "192.168.0.1", "::1", "fd00::1", "0.0.0.0"] {
            assert_eq!(
                verdict(&strict, tcp(host, 80)).await,
                FilterVerdict::Deny(CloseReason::ServerStreamBlockedAddress),
                "{host} should be blocked"
            );
        }

        let loopback_only = filter(WispConfig {
            allow_loopback: true,
            allow_private: false,
            ..Default::default()
        });
        assert!(matches!(
            verdict(&loopback_only, tcp("127.0.0.1", 8080)).await,
            FilterVerdict::Allow(_)
        ));
        assert!(matches!(
            verdict(&loopback_only, tcp("10.0.0.1", 8080)).await,
            FilterVerdict::Deny(_)
        ));

        let no_direct = filter(WispConfig {
            allow_direct_ip: false,
            ..Default::default()
        });
        assert_eq!(
            verdict(&no_direct, tcp("93.184.215.14", 80)).await,
            FilterVerdict::Deny(CloseReason::ServerStreamBlockedAddress)
        );
    }

    #[tokio::test]
    async fn stream_limits_need_a_connection() {
        let filter = filter(WispConfig {
            stream_limit_total: Some(2),
            stream_limit_per_host: Some(1),
            ..Default::default()
        });
        let request = tcp("93.184.215.14", 80);

        let busy = ConnectionContext {
            stream_count: 2,
            streams_to_host: 0,
        };
        assert_eq!(
            filter.evaluate(&request, Some(&busy)).await,
            FilterVerdict::Deny(CloseReason::ServerStreamThrottled)
        );

        let same_host = ConnectionContext {
            stream_count: 1,
            streams_to_host: 1,
        };
        assert_eq!(
            filter.evaluate(&request, Some(&same_host)).await,
            FilterVerdict::Deny(CloseReason::ServerStreamThrottled)
        );

        assert!(matches!(
            filter.evaluate(&request, None).await,
            FilterVerdict::Allow(_)
        ));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let config = WispConfig {
            hostname_blacklist: vec!["(".into()],
            ..Default::default()
        };
        assert!(WispFilter::new(Arc::new(config)).is_err());
    }
}
