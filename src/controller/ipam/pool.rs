//! Address pools on top of `ipnetwork` blocks

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::crd::{DnsConfig, NetworkConfig};
use crate::error::{Error, Result};

/// One configured network: the block addresses are taken from, the gateway
/// and the resolvers handed to every machine in it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pool {
    network: IpNetwork,
    gateway: IpAddr,
    dns_servers: Vec<IpAddr>,
}

/// Parse `addr/prefix`; a bare address is rejected
pub fn parse_cidr(cidr: &str) -> Result<IpNetwork> {
    let cidr = cidr.trim();
    if !cidr.contains('/') {
        return Err(Error::ConfigError(format!(
            "{cidr:?} is not in address/prefix form"
        )));
    }
    cidr.parse::<IpNetwork>()
        .map_err(|e| Error::ConfigError(format!("invalid cidr {cidr:?}: {e}")))
}

fn parse_ip(what: &str, value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::ConfigError(format!("invalid {what} {value:?}: {e}")))
}

impl Pool {
    pub fn new(cidr: &str, gateway: &str, dns_servers: &[String]) -> Result<Self> {
        let parsed = parse_cidr(cidr)?;
        let gateway = parse_ip("gateway", gateway)?;
        if gateway.is_ipv4() != parsed.is_ipv4() {
            return Err(Error::ConfigError(format!(
                "gateway {gateway} is not in the address family of {cidr}"
            )));
        }
        let dns_servers = dns_servers
            .iter()
            .map(|s| parse_ip("dns server", s))
            .collect::<Result<Vec<_>>>()?;

        // 10.1.2.77/24 names the block 10.1.2.0/24
        let network = IpNetwork::new(parsed.network(), parsed.prefix())
            .map_err(|e| Error::ConfigError(format!("invalid cidr {cidr:?}: {e}")))?;
        Ok(Self {
            network,
            gateway,
            dns_servers,
        })
    }

    pub fn prefix(&self) -> u8 {
        self.network.prefix()
    }

    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.network.contains(*ip)
    }

    /// Lowest address that is not the network address, the broadcast
    /// address, the gateway or in `used`
    pub fn first_free(&self, used: &HashSet<IpAddr>) -> Option<IpAddr> {
        let network = self.network.network();
        let broadcast = self.network.broadcast();
        // at most used.len() + 3 candidates are rejected
        self.network.iter().find(|ip| {
            *ip != network && *ip != broadcast && *ip != self.gateway && !used.contains(ip)
        })
    }

    /// Network block written into a machine that was given `ip`
    pub fn assignment(&self, ip: IpAddr) -> NetworkConfig {
        NetworkConfig {
            cidr: format!("{}/{}", ip, self.prefix()),
            gateway: self.gateway.to_string(),
            dns: DnsConfig {
                servers: self.dns_servers.iter().map(IpAddr::to_string).collect(),
            },
        }
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// Address part of a CIDR already written into a machine
pub fn assigned_address(cidr: &str) -> Result<IpAddr> {
    parse_cidr(cidr)
        .map(|net| net.ip())
        .map_err(|e| Error::field("spec.providerSpec.value.network.cidr", e.to_string()))
}
