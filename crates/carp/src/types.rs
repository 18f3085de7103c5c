//! CARP data types and protocol constants.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// CARP protocol version carried in every advertisement
pub const CARP_VERSION: u8 = 2;

/// Advertisement message type (the only type defined)
pub const CARP_ADVERTISEMENT: u8 = 1;

/// IP protocol number used for CARP
pub const IPPROTO_CARP: u8 = 112;

/// Required TTL / hop limit of every advertisement
pub const CARP_DFLTTL: u8 = 255;

/// Default advertisement base interval in seconds
pub const CARP_DFLTINTV: u8 = 1;

/// Maximum number of virtual hosts per coordinator
pub const CARP_MAXNODES: usize = 32;

/// Length of the shared secret in bytes
pub const CARP_KEY_LEN: usize = 20;

/// Authentication length field, in 32-bit words (counter + digest)
pub const CARP_AUTHLEN: u8 = 7;

/// Timing value announced while bowing out (advbase and advskew)
pub const CARP_BOW_OUT: u8 = 255;

/// Largest accepted advertisement skew
pub const CARP_MAX_SKEW: u8 = 254;

/// Default IPv4 peer (multicast group)
pub const CARP_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 18);

/// IPv6 multicast group
pub const CARP_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x12);

/// Interface group every coordinator joins on creation
pub const CARP_IFGROUP: &str = "carp";

/// Interface group that never carries a demotion counter
pub const IFGROUP_ALL: &str = "all";

/// A link-layer (Ethernet) address
pub type MacAddr = [u8; 6];

/// Virtual host state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VhostState {
    /// Not participating
    Init,
    /// Waiting for the master to go away
    Backup,
    /// Owning the virtual identity and advertising
    Master,
}

impl VhostState {
    /// True for BACKUP and MASTER.
    pub fn is_participating(self) -> bool {
        !matches!(self, VhostState::Init)
    }

    pub fn is_master(self) -> bool {
        matches!(self, VhostState::Master)
    }
}

impl std::fmt::Display for VhostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VhostState::Init => write!(f, "INIT"),
            VhostState::Backup => write!(f, "BACKUP"),
            VhostState::Master => write!(f, "MASTER"),
        }
    }
}

/// Load balancing mode of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Balancing {
    /// Plain failover, one master for the whole coordinator
    #[default]
    None,
    /// Share inbound traffic using a multicast virtual MAC
    Ip,
    /// Like `Ip`, with the unicast virtual MAC hidden from the switch
    IpStealth,
}

impl Balancing {
    /// True for the IP based modes.
    pub fn is_ip_based(self) -> bool {
        !matches!(self, Balancing::None)
    }
}

impl std::fmt::Display for Balancing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Balancing::None => write!(f, "none"),
            Balancing::Ip => write!(f, "ip"),
            Balancing::IpStealth => write!(f, "ip-stealth"),
        }
    }
}

/// Link state reported for a coordinator interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    #[default]
    Invalid,
    Down,
    Up,
}

/// Address family of an advertisement or timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => write!(f, "inet"),
            Family::V6 => write!(f, "inet6"),
        }
    }
}

/// Engine-wide options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarpOptions {
    /// Accept incoming advertisements at all
    pub allow: bool,

    /// Take over from a master that advertises slower than us
    pub preempt: bool,

    /// Set the router flag on unsolicited neighbour advertisements
    pub ipv6_router: bool,
}

impl Default for CarpOptions {
    fn default() -> Self {
        Self {
            allow: true,
            preempt: false,
            ipv6_router: false,
        }
    }
}
