//! Datacenter endpoint lookup.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Datacenter identifier
pub type DcId = i32;

bitflags! {
    /// Properties of a datacenter endpoint
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DcFlags: u32 {
        /// Address is IPv6
        const IPV6 = 0x01;
        /// Only serves media downloads
        const MEDIA_ONLY = 0x02;
        /// Only reachable over TCP
        const TCPO_ONLY = 0x04;
    }
}

/// A single address/port pair for a datacenter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcEndpoint {
    /// IP address or host name
    pub address: String,
    /// Port
    pub port: u16,
    /// Endpoint properties
    pub flags: DcFlags,
}

impl DcEndpoint {
    /// `host:port`, with IPv6 addresses in brackets
    pub fn socket_addr(&self) -> String {
        if self.flags.contains(DcFlags::IPV6) {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// URL HTTP transports post to
    pub fn http_url(&self) -> String {
        format!("http://{}/api", self.socket_addr())
    }
}

impl fmt::Display for DcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_addr())
    }
}

/// Endpoints of one datacenter for one address family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcEndpoints {
    /// Endpoint for TCP
    pub tcp: DcEndpoint,
    /// Endpoint for HTTP, absent when the datacenter is TCP-only
    pub http: Option<DcEndpoint>,
}

/// Resolves datacenter ids to endpoints
pub trait DcLookup: Send + Sync + fmt::Debug {
    /// Endpoints for `dc` in the requested address family
    fn lookup(&self, dc: DcId, ipv6: bool) -> Option<DcEndpoints>;

    /// Datacenter used when none is specified
    fn main_dc(&self) -> DcId;
}

/// One configured datacenter address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcOption {
    /// Datacenter id
    pub id: DcId,
    /// IP address
    pub address: String,
    /// TCP port
    pub port: u16,
    /// HTTP port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Endpoint properties
    #[serde(default)]
    pub flags: DcFlags,
}

fn default_http_port() -> u16 {
    80
}

impl DcOption {
    /// Create an option with the default HTTP port
    pub fn new(id: DcId, address: &str, port: u16, flags: DcFlags) -> Self {
        Self {
            id,
            address: address.to_string(),
            port,
            http_port: default_http_port(),
            flags,
        }
    }
}

/// Fixed table of datacenter options
#[derive(Debug, Clone)]
pub struct StaticDcTable {
    main_dc: DcId,
    options: Vec<DcOption>,
}

impl StaticDcTable {
    /// Create a table
    pub fn new(main_dc: DcId, options: Vec<DcOption>) -> Self {
        Self { main_dc, options }
    }

    /// Built-in production datacenters
    pub fn production() -> Self {
        let v4 = DcFlags::empty();
        let v6 = DcFlags::IPV6;
        Self::new(
            2,
            vec![
                DcOption::new(1, "149.154.175.50", 443, v4),
                DcOption::new(2, "149.154.167.51", 443, v4),
                DcOption::new(3, "149.154.175.100", 443, v4),
                DcOption::new(4, "149.154.167.91", 443, v4),
                DcOption::new(5, "91.108.56.130", 443, v4),
                DcOption::new(1, "2001:b28:f23d:f001::a", 443, v6),
                DcOption::new(2, "2001:67c:4e8:f002::a", 443, v6),
                DcOption::new(3, "2001:b28:f23d:f003::a", 443, v6),
                DcOption::new(4, "2001:67c:4e8:f004::a", 443, v6),
                DcOption::new(5, "2001:b28:f23f:f005::a", 443, v6),
            ],
        )
    }

    /// Configured options
    pub fn options(&self) -> &[DcOption] {
        &self.options
    }
}

impl DcLookup for StaticDcTable {
    fn lookup(&self, dc: DcId, ipv6: bool) -> Option<DcEndpoints> {
        let option = self.options.iter().find(|option| {
            option.id == dc
                && option.flags.contains(DcFlags::IPV6) == ipv6
                && !option.flags.contains(DcFlags::MEDIA_ONLY)
        })?;

        let tcp = DcEndpoint {
            address: option.address.clone(),
            port: option.port,
            flags: option.flags,
        };
        let http = (!option.flags.contains(DcFlags::TCPO_ONLY)).then(|| DcEndpoint {
            port: option.http_port,
            ..tcp.clone()
        });
        Some(DcEndpoints { tcp, http })
    }

    fn main_dc(&self) -> DcId {
        self.main_dc
    }
}
