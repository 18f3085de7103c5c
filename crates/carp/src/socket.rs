//! Raw socket transport.
//!
//! Advertisements travel over raw IPPROTO_CARP sockets bound to the parent
//! link, joined to 224.0.0.18 / ff02::12, with TTL and hop limit 255 and
//! multicast loopback disabled. Gratuitous ARPs go out through an
//! AF_PACKET socket and neighbour advertisements through raw ICMPv6.

use crate::error::TransportError;
use crate::packet::Advertisement;
use crate::transport::{Egress, Transport};
use crate::types::{CARP_DFLTTL, CARP_GROUP_V4, CARP_GROUP_V6, Family, IPPROTO_CARP, MacAddr};
use nix::sys::socket::{ControlMessageOwned, MsgFlags, SockaddrIn6, recvmsg, setsockopt, sockopt};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io::{self, ErrorKind, IoSliceMut, Read};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, warn};

const RECV_BUFFER: usize = 1500;

/// All-nodes group, destination of unsolicited neighbour advertisements
const ALL_NODES_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setsockopt_struct<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Index of a network interface
pub fn interface_index(name: &str) -> io::Result<u32> {
    nix::net::if_::if_nametoindex(name).map_err(|_| {
        io::Error::new(ErrorKind::NotFound, format!("Interface {} not found", name))
    })
}

/// CARP socket on one parent link and address family
pub struct CarpSocket {
    socket: Socket,
    interface: String,
    ifindex: u32,
    family: Family,
}

impl CarpSocket {
    /// Create a raw CARP socket bound to `interface`.
    ///
    /// Needs CAP_NET_RAW.
    pub fn new(interface: &str, family: Family) -> io::Result<Self> {
        let ifindex = interface_index(interface)?;
        let domain = match family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(IPPROTO_CARP as i32)))?;
        socket.set_nonblocking(true)?;
        socket.bind_device(Some(interface.as_bytes()))?;

        let fd = socket.as_raw_fd();
        let ttl = CARP_DFLTTL as libc::c_int;
        match family {
            Family::V4 => {
                setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_TTL, ttl)?;
                setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, ttl)?;
                setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, 0)?;

                let mreq = libc::ip_mreqn {
                    imr_multiaddr: libc::in_addr { s_addr: 0 },
                    imr_address: libc::in_addr { s_addr: 0 },
                    imr_ifindex: ifindex as i32,
                };
                setsockopt_struct(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_IF, &mreq)?;
            }
            Family::V6 => {
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, ttl)?;
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, ttl)?;
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, 0)?;
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_IF, ifindex as libc::c_int)?;
                // the hop limit is only visible as ancillary data
                setsockopt(&socket, sockopt::Ipv6RecvHopLimit, &true).map_err(io::Error::from)?;
            }
        }

        Ok(Self {
            socket,
            interface: interface.to_string(),
            ifindex,
            family,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Second handle on the same socket
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            socket: self.socket.try_clone()?,
            interface: self.interface.clone(),
            ifindex: self.ifindex,
            family: self.family,
        })
    }

    fn membership(&self, add: bool) -> io::Result<()> {
        let fd = self.socket.as_raw_fd();
        match self.family {
            Family::V4 => {
                let mreq = libc::ip_mreqn {
                    imr_multiaddr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(CARP_GROUP_V4.octets()),
                    },
                    imr_address: libc::in_addr { s_addr: 0 },
                    imr_ifindex: self.ifindex as i32,
                };
                let name = if add { libc::IP_ADD_MEMBERSHIP } else { libc::IP_DROP_MEMBERSHIP };
                setsockopt_struct(fd, libc::IPPROTO_IP, name, &mreq)
            }
            Family::V6 => {
                let mreq = libc::ipv6_mreq {
                    ipv6mr_multiaddr: libc::in6_addr {
                        s6_addr: CARP_GROUP_V6.octets(),
                    },
                    ipv6mr_interface: self.ifindex,
                };
                let name = if add { libc::IPV6_ADD_MEMBERSHIP } else { libc::IPV6_DROP_MEMBERSHIP };
                setsockopt_struct(fd, libc::IPPROTO_IPV6, name, &mreq)
            }
        }
    }

    /// Join the CARP multicast group on the bound link
    pub fn join_multicast(&self) -> io::Result<()> {
        self.membership(true)
    }

    pub fn leave_multicast(&self) -> io::Result<()> {
        self.membership(false)
    }

    /// Send an encoded advertisement. The kernel adds the IP header.
    pub fn send(&self, payload: &[u8], peer: Ipv4Addr) -> io::Result<usize> {
        let dst: SocketAddr = match self.family {
            Family::V4 => SocketAddrV4::new(peer, 0).into(),
            Family::V6 => SocketAddrV6::new(CARP_GROUP_V6, 0, 0, self.ifindex).into(),
        };
        self.socket.send_to(payload, &SockAddr::from(dst))
    }

    /// Receive one IPv4 datagram, IP header included
    pub fn recv_v4(&self) -> io::Result<Vec<u8>> {
        let mut buf = [0u8; RECV_BUFFER];
        let len = (&self.socket).read(&mut buf)?;
        Ok(buf[..len].to_vec())
    }

    /// Receive one IPv6 CARP payload and its hop limit
    pub fn recv_v6(&self) -> io::Result<(u8, Vec<u8>)> {
        let mut buf = [0u8; RECV_BUFFER];
        let mut cmsg = nix::cmsg_space!(libc::c_int);
        let mut iov = [IoSliceMut::new(&mut buf)];

        let msg = recvmsg::<SockaddrIn6>(self.socket.as_raw_fd(), &mut iov, Some(&mut cmsg), MsgFlags::empty())
            .map_err(io::Error::from)?;
        let len = msg.bytes;
        let mut hop_limit = 0u8;
        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::Ipv6HopLimit(hops) = cmsg {
                hop_limit = u8::try_from(hops).unwrap_or(0);
            }
        }
        Ok((hop_limit, buf[..len].to_vec()))
    }
}

impl AsRawFd for CarpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Drop for CarpSocket {
    fn drop(&mut self) {
        // leaving is best effort; clones share the membership
        let _ = self.leave_multicast();
    }
}

/// Ethernet frame of a gratuitous ARP request for `addr`
pub fn arp_frame(lladdr: MacAddr, addr: Ipv4Addr) -> [u8; 42] {
    let mut frame = [0u8; 42];
    frame[0..6].copy_from_slice(&[0xff; 6]);
    frame[6..12].copy_from_slice(&lladdr);
    frame[12..14].copy_from_slice(&(libc::ETH_P_ARP as u16).to_be_bytes());

    // hardware ethernet, protocol IPv4, request
    frame[14..22].copy_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
    frame[22..28].copy_from_slice(&lladdr);
    frame[28..32].copy_from_slice(&addr.octets());
    frame[38..42].copy_from_slice(&addr.octets());
    frame
}

/// Unsolicited neighbour advertisement with a target link-layer option.
///
/// The kernel fills in the ICMPv6 checksum.
pub fn neighbor_advert(lladdr: MacAddr, addr: Ipv6Addr, router: bool) -> [u8; 32] {
    let mut msg = [0u8; 32];
    msg[0] = 136;
    // override, plus router when acting as one
    msg[4] = 0x20 | if router { 0x80 } else { 0 };
    msg[8..24].copy_from_slice(&addr.octets());
    msg[24] = 2;
    msg[25] = 1;
    msg[26..32].copy_from_slice(&lladdr);
    msg
}

struct Link {
    name: String,
    v4: CarpSocket,
    v6: Option<CarpSocket>,
}

/// [`Transport`] over raw sockets, one set per parent link
#[derive(Default)]
pub struct SocketTransport {
    links: HashMap<u32, Link>,
    arp: Option<Socket>,
    icmp6: Option<Socket>,
}

impl SocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open sockets on a parent link.
    ///
    /// Returns the link index and a receive handle per address family.
    /// IPv6 is optional; failing to set it up only logs.
    pub fn open(&mut self, ifname: &str) -> io::Result<(u32, Vec<CarpSocket>)> {
        let v4 = CarpSocket::new(ifname, Family::V4)?;
        v4.join_multicast()?;
        let index = v4.ifindex();

        let v6 = match CarpSocket::new(ifname, Family::V6).and_then(|s| s.join_multicast().map(|_| s)) {
            Ok(sock) => Some(sock),
            Err(err) => {
                warn!(iface = %ifname, error = %err, "IPv6 CARP socket unavailable");
                None
            }
        };

        let mut receivers = vec![v4.try_clone()?];
        if let Some(v6) = &v6 {
            receivers.push(v6.try_clone()?);
        }
        self.links.insert(
            index,
            Link {
                name: ifname.to_string(),
                v4,
                v6,
            },
        );
        Ok((index, receivers))
    }

    fn link(&self, carpdev: u32) -> io::Result<&Link> {
        self.links
            .get(&carpdev)
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no sockets on link {carpdev}")))
    }

    fn arp_socket(&mut self) -> io::Result<&Socket> {
        if self.arp.is_none() {
            let protocol = Protocol::from((libc::ETH_P_ARP as u16).to_be() as i32);
            self.arp = Some(Socket::new(Domain::PACKET, Type::RAW, Some(protocol))?);
        }
        self.arp
            .as_ref()
            .ok_or_else(|| io::Error::other("ARP socket unavailable"))
    }

    fn icmp6_socket(&mut self) -> io::Result<&Socket> {
        if self.icmp6.is_none() {
            let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
            setsockopt_int(
                socket.as_raw_fd(),
                libc::IPPROTO_IPV6,
                libc::IPV6_MULTICAST_HOPS,
                CARP_DFLTTL as libc::c_int,
            )?;
            self.icmp6 = Some(socket);
        }
        self.icmp6
            .as_ref()
            .ok_or_else(|| io::Error::other("ICMPv6 socket unavailable"))
    }

    fn send_arp(&mut self, carpdev: u32, lladdr: MacAddr, addr: Ipv4Addr) -> io::Result<()> {
        let frame = arp_frame(lladdr, addr);
        let socket = self.arp_socket()?;

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
        sll.sll_ifindex = carpdev as i32;
        sll.sll_halen = 6;
        sll.sll_addr[..6].copy_from_slice(&[0xff; 6]);

        let ret = unsafe {
            libc::sendto(
                socket.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &sll as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn send_na(&mut self, carpdev: u32, lladdr: MacAddr, addr: Ipv6Addr, router: bool) -> io::Result<()> {
        let msg = neighbor_advert(lladdr, addr, router);
        let socket = self.icmp6_socket()?;
        let dst: SocketAddr = SocketAddrV6::new(ALL_NODES_V6, 0, 0, carpdev).into();
        socket.send_to(&msg, &SockAddr::from(dst))?;
        Ok(())
    }
}

impl Transport for SocketTransport {
    fn send_advertisement(&mut self, egress: &Egress, advert: &Advertisement) -> Result<(), TransportError> {
        let link = self.link(egress.carpdev)?;
        let payload = advert.encode();
        let sent = match egress.family {
            Family::V4 => link.v4.send(&payload, egress.peer),
            Family::V6 => match &link.v6 {
                Some(sock) => sock.send(&payload, egress.peer),
                None => return Err(TransportError::Io(io::Error::from(ErrorKind::Unsupported))),
            },
        };
        sent.map(|_| ()).map_err(TransportError::from_io)
    }

    fn send_gratuitous_arp(&mut self, carpdev: u32, lladdr: MacAddr, addr: Ipv4Addr) {
        if let Err(err) = self.send_arp(carpdev, lladdr, addr) {
            debug!(carpdev, %addr, error = %err, "gratuitous ARP failed");
        }
    }

    fn send_neighbor_advert(&mut self, carpdev: u32, lladdr: MacAddr, addr: Ipv6Addr, router: bool) {
        if let Err(err) = self.send_na(carpdev, lladdr, addr, router) {
            debug!(carpdev, %addr, error = %err, "neighbour advertisement failed");
        }
    }
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let links: Vec<&str> = self.links.values().map(|l| l.name.as_str()).collect();
        f.debug_struct("SocketTransport").field("links", &links).finish()
    }
}
