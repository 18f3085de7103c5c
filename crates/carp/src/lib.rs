//! Common Address Redundancy Protocol (CARP)
//!
//! Pure Rust failover engine: hosts on one link share virtual identities
//! (vhids) and elect a master for each by exchanging authenticated
//! advertisements.
//!
//! # Features
//!
//! - CARP version 2 advertisements over IPv4 and IPv6
//! - SHA-1 HMAC authentication with replay protection
//! - Several vhids per interface with IP load balancing
//! - Preemption and demotion counters per interface group
//! - Bow-out advertisements on administrative shutdown
//! - Deterministic simulation with a virtual clock
//!
//! # Example
//!
//! ```no_run
//! use carp::{CarpOptions, CarpRequest, CarpRuntime, ParentInterface, Privilege, SocketTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut transport = SocketTransport::new();
//! let (index, _receivers) = transport.open("eth0")?;
//!
//! let runtime = CarpRuntime::new(CarpOptions::default(), transport);
//! {
//!     let engine = runtime.engine();
//!     let mut engine = engine.lock().await;
//!     engine.register_interface(ParentInterface::ethernet("eth0", index, [2, 0, 0, 0, 0, 1]))?;
//!     engine.create_coordinator("carp0")?;
//!     let req = CarpRequest::new().carpdev("eth0").vhid(1, 0).passphrase("secret");
//!     engine.set_request("carp0", &req, Privilege::Privileged)?;
//!     engine.add_address("carp0", "192.168.1.1".parse()?)?;
//! }
//!
//! // Process timers and packets (requires CAP_NET_RAW)
//! runtime.run(std::future::pending()).await;
//! # Ok(())
//! # }
//! ```

mod admin;
mod coordinator;
mod demote;
mod engine;
mod error;
mod hmac;
pub mod input;
mod packet;
mod replay;
pub mod runtime;
mod socket;
mod stats;
pub mod timer;
mod transport;
mod types;
mod vhost;

pub use admin::{CarpRequest, CarpStatus, Privilege, VhidConfig, VhostStatus, key_from_passphrase};
pub use coordinator::GroupCoordinator;
pub use demote::{DemotionCounter, InterfaceGroups};
pub use engine::{CarpEngine, ParentInterface};
pub use error::{CarpError, Result, TransportError};
pub use hmac::{AuthInput, Authenticator, HmacContext};
pub use packet::{Advertisement, CARP_HEADER_LEN, PacketError};
pub use replay::{ReplayGuard, ReplayVerdict};
pub use runtime::{CarpRuntime, Inbound, SharedEngine};
pub use socket::{CarpSocket, SocketTransport};
pub use stats::{CarpStats, StatsSnapshot};
pub use timer::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
pub use transport::{Egress, RecordingTransport, Sent, Transport};
pub use types::*;
pub use vhost::{LocalView, PeerView, Timing, VhostEntry, Verdict, evaluate};
