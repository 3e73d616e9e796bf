use crate::netif::InterfaceIndex;
use crate::ssdp::SSDP_PORT;
use ::std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

mod error;
pub use error::{Error, Syscall};

/// The IPv4 SSDP multicast group
pub const SSDP_GROUP_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// The IPv6 link-local SSDP multicast group
pub const SSDP_GROUP_V6_LINK: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);

/// The IPv6 site-local SSDP multicast group
pub const SSDP_GROUP_V6_SITE: Ipv6Addr =
    Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0xc);

fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// The SSDP group to use for traffic from a given local address
///
/// IPv4 addresses use 239.255.255.250; link-local IPv6 addresses use
/// FF02::C and any other IPv6 address FF05::C.
pub fn multicast_group(local: &IpAddr) -> IpAddr {
    match local {
        IpAddr::V4(_) => IpAddr::V4(SSDP_GROUP_V4),
        IpAddr::V6(v6) if is_link_local_v6(v6) => {
            IpAddr::V6(SSDP_GROUP_V6_LINK)
        }
        IpAddr::V6(_) => IpAddr::V6(SSDP_GROUP_V6_SITE),
    }
}

/// Where to send multicasts from a given local address
pub fn multicast_destination(
    local: &IpAddr,
    interface: InterfaceIndex,
    port: u16,
) -> SocketAddr {
    match multicast_group(local) {
        IpAddr::V4(v4) => SocketAddr::new(IpAddr::V4(v4), port),
        IpAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(
            v6,
            port,
            0,
            interface.0.get(),
        )),
    }
}

/// The HOST header value for multicasts from a given local address
pub fn multicast_host(local: &IpAddr) -> String {
    match multicast_group(local) {
        IpAddr::V4(v4) => format!("{v4}:{SSDP_PORT}"),
        IpAddr::V6(v6) if v6 == SSDP_GROUP_V6_LINK => {
            format!("[FF02::C]:{SSDP_PORT}")
        }
        IpAddr::V6(_) => format!("[FF05::C]:{SSDP_PORT}"),
    }
}

/// Sending UDP datagrams from a specific source IP
pub trait TargetedSend {
    /// Send a UDP datagram from a specific local address
    ///
    /// Works even if two interfaces share the same IP range
    /// (169.254/16, for instance), so long as they have different
    /// addresses.
    ///
    /// # Errors
    ///
    /// Returns `Err` if there is no session on `from`, or if the
    /// underlying send fails.
    ///
    fn send_to(
        &self,
        buffer: &[u8],
        to: &SocketAddr,
        from: &IpAddr,
    ) -> Result<(), Error>;

    /// Send a multicast datagram
    ///
    /// UDP multicast is lossy, so every multicast goes out twice.
    ///
    /// # Errors
    ///
    /// As for [`TargetedSend::send_to`].
    ///
    fn send_multicast(
        &self,
        buffer: &[u8],
        group: &SocketAddr,
        from: &IpAddr,
    ) -> Result<(), Error> {
        self.send_to(buffer, group, from)?;
        self.send_to(buffer, group, from)
    }
}

/// Joining and leaving multicast groups (by local address)
pub trait Multicast {
    /// Join a multicast group using a particular local address
    ///
    /// # Errors
    ///
    /// Fails if the sockets for `local` cannot be created or bound.
    ///
    fn join_multicast_group(
        &self,
        multicast_address: &IpAddr,
        local: &IpAddr,
        interface: InterfaceIndex,
    ) -> Result<(), Error>;

    /// Leave a multicast group previously joined on `local`
    ///
    /// # Errors
    ///
    /// Can only fail if the underlying system call fails.
    ///
    fn leave_multicast_group(
        &self,
        multicast_address: &IpAddr,
        local: &IpAddr,
        interface: InterfaceIndex,
    ) -> Result<(), Error>;
}

/// Socket setup using `socket2` and `std::net` underneath
pub mod std;

/// Per-address socket sessions on Tokio
pub mod tokio;
