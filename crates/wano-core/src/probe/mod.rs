//! DNS reachability probe
//!
//! Resolves a target host name through every configured resolver, with the
//! queries sourced from the freshly provisioned interface address. The point
//! is not to resolve the host but to see whether any resolver answers at all:
//!
//! - an answer, or a definitive negative answer (no data, name not found,
//!   refused), is reachability evidence
//! - SERVFAIL, timeouts and local socket errors are not
//!
//! The probe fails open: without a target or without resolvers it succeeds.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfig, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::traits::ReachabilityProbe;

/// Extract `nameserver` entries from resolv.conf contents
pub fn parse_resolv_conf(contents: &str) -> Vec<IpAddr> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some("nameserver"), Some(addr)) => {
                    // Drop an IPv6 zone index
                    let addr = addr.split('%').next().unwrap_or(addr);
                    addr.parse().ok()
                }
                _ => None,
            }
        })
        .collect()
}

/// Whether a lookup outcome shows the resolver is reachable
fn is_evidence(result: &Result<(), ResolveError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => match e.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                *response_code != ResponseCode::ServFail
            }
            _ => false,
        },
    }
}

/// DNS-based [`ReachabilityProbe`]
#[derive(Debug, Clone)]
pub struct DnsProbe {
    config: ProbeConfig,
}

impl DnsProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Resolvers to probe, capped at `max_resolvers`
    async fn resolvers(&self) -> Vec<IpAddr> {
        let mut resolvers = if self.config.resolvers.is_empty() {
            match tokio::fs::read_to_string(&self.config.resolv_conf).await {
                Ok(contents) => parse_resolv_conf(&contents),
                Err(e) => {
                    warn!(
                        "dns_probe: Unable to read {}: {}",
                        self.config.resolv_conf, e
                    );
                    Vec::new()
                }
            }
        } else {
            self.config.resolvers.clone()
        };

        if resolvers.len() > self.config.max_resolvers {
            info!(
                "dns_probe: Maximum number of DNS servers reached ({}), truncating list.",
                self.config.max_resolvers
            );
            resolvers.truncate(self.config.max_resolvers);
        }
        resolvers
    }

    fn resolver_for(&self, server: IpAddr, local_addr: Option<IpAddr>) -> TokioAsyncResolver {
        let mut name_server =
            NameServerConfig::new(SocketAddr::new(server, self.config.port), Protocol::Udp);
        // A v4 source cannot reach a v6 server and vice versa
        name_server.bind_addr = local_addr
            .filter(|local| local.is_ipv4() == server.is_ipv4())
            .map(|local| SocketAddr::new(local, 0));

        let mut config = ResolverConfig::new();
        config.add_name_server(name_server);

        let mut opts = ResolverOpts::default();
        opts.timeout = self.config.round_timeout();
        opts.attempts = 1;
        opts.cache_size = 0;
        opts.use_hosts_file = false;
        opts.ip_strategy = LookupIpStrategy::Ipv4Only;

        TokioAsyncResolver::tokio(config, opts)
    }
}

#[async_trait]
impl ReachabilityProbe for DnsProbe {
    async fn probe(&self, ifname: &str, local_addr: Option<IpAddr>) -> bool {
        let Some(target) = self.config.target.clone() else {
            info!("{}: dns_probe: No host to resolve, skipping DNS probe.", ifname);
            return true;
        };

        let servers = self.resolvers().await;
        if servers.is_empty() {
            warn!("{}: dns_probe: No DNS servers configured, skipping DNS probe.", ifname);
            return true;
        }

        let resolvers: Vec<(IpAddr, TokioAsyncResolver)> = servers
            .into_iter()
            .map(|server| (server, self.resolver_for(server, local_addr)))
            .collect();

        let timeout = self.config.round_timeout();
        for round in 0..self.config.rounds {
            let mut queries = JoinSet::new();
            for (server, resolver) in &resolvers {
                let server = *server;
                let resolver = resolver.clone();
                let target = target.clone();
                queries.spawn(async move {
                    let result = tokio::time::timeout(timeout, resolver.lookup_ip(target)).await;
                    (server, result)
                });
            }

            while let Some(joined) = queries.join_next().await {
                let Ok((server, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(lookup) => {
                        let lookup = lookup.map(|_| ());
                        if is_evidence(&lookup) {
                            info!("{}: dns_probe: DNS server {} answered.", ifname, server);
                            return true;
                        }
                        if let Err(e) = lookup {
                            debug!("{}: dns_probe: DNS server {}: {}", ifname, server, e);
                        }
                    }
                    Err(_) => debug!("{}: dns_probe: DNS server {} timed out", ifname, server),
                }
            }
            debug!("{}: dns_probe: Round {} without answer", ifname, round + 1);
        }

        warn!("{}: dns_probe: No DNS server reachable.", ifname);
        false
    }
}
