//! DNS discovery of XMPP server endpoints.
//!
//! Resolves `_xmpp-server._tcp.{domain}` SRV records ordered by priority
//! and weight, falling back to the domain's A/AAAA records on port 5269
//! when no SRV records exist.

use std::net::SocketAddr;

use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::{debug, warn};

/// Default S2S port used for the A/AAAA fallback.
pub const S2S_PORT: u16 = 5269;

/// Errors from endpoint resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The resolver could not be constructed from system configuration.
    #[error("resolver initialization failed: {0}")]
    Init(String),

    /// Every lookup path failed.
    #[error("no targets resolved for {domain}: {reason}")]
    NoTargets {
        /// The domain being resolved.
        domain: String,
        /// What the resolver reported.
        reason: String,
    },
}

/// One resolved connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Host name to connect (and verify TLS) against.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// SRV priority; lower is tried first.
    pub priority: u16,
    /// SRV weight within a priority class.
    pub weight: u16,
}

impl ResolvedTarget {
    /// The conventional fallback target for a domain without SRV records.
    pub fn fallback(domain: String) -> ResolvedTarget {
        ResolvedTarget {
            host: domain,
            port: S2S_PORT,
            priority: u16::MAX,
            weight: 0,
        }
    }
}

/// SRV resolver over the system DNS configuration.
pub struct SrvResolver {
    resolver: TokioAsyncResolver,
}

impl SrvResolver {
    /// Build a resolver from the system configuration.
    pub fn new() -> Result<SrvResolver, DnsError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|err| DnsError::Init(err.to_string()))?;
        Ok(SrvResolver { resolver })
    }

    /// Resolve the S2S targets for `domain`, best candidates first.
    pub async fn resolve_xmpp_server(&self, domain: &str) -> Result<Vec<ResolvedTarget>, DnsError> {
        let srv_name = format!("_xmpp-server._tcp.{domain}.");
        match self.resolver.srv_lookup(srv_name.clone()).await {
            Ok(lookup) => {
                let mut targets: Vec<ResolvedTarget> = lookup
                    .iter()
                    .map(|record| ResolvedTarget {
                        host: record.target().to_utf8().trim_end_matches('.').to_owned(),
                        port: record.port(),
                        priority: record.priority(),
                        weight: record.weight(),
                    })
                    .collect();
                if targets.is_empty() {
                    debug!(domain = domain, "Empty SRV answer, using fallback");
                    return Ok(vec![ResolvedTarget::fallback(domain.to_owned())]);
                }
                sort_targets(&mut targets);
                Ok(targets)
            }
            Err(err) => {
                // NXDOMAIN or lookup failure: the fallback applies.
                debug!(domain = domain, error = %err, "SRV lookup failed, using fallback");
                Ok(vec![ResolvedTarget::fallback(domain.to_owned())])
            }
        }
    }

    /// Resolve a target host to socket addresses.
    pub async fn resolve_host_to_addrs(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Vec<SocketAddr>, DnsError> {
        // Literal addresses short-circuit the resolver.
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => {
                let addrs: Vec<SocketAddr> = lookup
                    .iter()
                    .map(|ip| SocketAddr::new(ip, port))
                    .collect();
                if addrs.is_empty() {
                    return Err(DnsError::NoTargets {
                        domain: host.to_owned(),
                        reason: "no A/AAAA records".to_owned(),
                    });
                }
                Ok(addrs)
            }
            Err(err) => {
                warn!(host = host, error = %err, "Address lookup failed");
                Err(DnsError::NoTargets {
                    domain: host.to_owned(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

/// Order SRV targets by priority, then descending weight.
fn sort_targets(targets: &mut [ResolvedTarget]) {
    targets.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.weight.cmp(&a.weight))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_target_shape() {
        let target = ResolvedTarget::fallback("example.org".to_owned());
        assert_eq!(target.host, "example.org");
        assert_eq!(target.port, S2S_PORT);
        assert_eq!(target.priority, u16::MAX);
    }

    #[test]
    fn targets_order_by_priority_then_weight() {
        let mut targets = vec![
            ResolvedTarget {
                host: "c".into(),
                port: 5269,
                priority: 10,
                weight: 0,
            },
            ResolvedTarget {
                host: "a".into(),
                port: 5269,
                priority: 0,
                weight: 10,
            },
            ResolvedTarget {
                host: "b".into(),
                port: 5269,
                priority: 0,
                weight: 60,
            },
        ];
        sort_targets(&mut targets);
        let hosts: Vec<&str> = targets.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(hosts, ["b", "a", "c"]);
    }
}
