use super::{multicast_group, Error, Syscall};
use crate::netif::InterfaceIndex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// Multicast hop limit for everything we send
const MULTICAST_TTL: u32 = 2;

type NewSocketFn = fn(Domain) -> std::io::Result<Socket>;
type BindFn = fn(&Socket, SocketAddr) -> std::io::Result<()>;
type JoinFn = fn(&Socket, &IpAddr, &IpAddr, InterfaceIndex) -> std::io::Result<()>;

fn new_udp_socket(domain: Domain) -> std::io::Result<Socket> {
    Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
}

fn bind(socket: &Socket, addr: SocketAddr) -> std::io::Result<()> {
    socket.bind(&SockAddr::from(addr))
}

fn domain_for(local: &IpAddr) -> Domain {
    match local {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    }
}

fn setup_multicast_socket_inner(
    local: &IpAddr,
    interface: InterfaceIndex,
    port: u16,
    new_socket: NewSocketFn,
    bind: BindFn,
    join: JoinFn,
) -> Result<std::net::UdpSocket, Error> {
    let socket = new_socket(domain_for(local))
        .map_err(|e| Error::Syscall(Syscall::Socket, e))?;
    configure_multicast(&socket, local)
        .map_err(|e| Error::Syscall(Syscall::Socket, e))?;
    let any = match local {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    bind(&socket, SocketAddr::new(any, port))
        .map_err(|e| Error::Syscall(Syscall::Bind, e))?;
    join(&socket, &multicast_group(local), local, interface)
        .map_err(|e| Error::Syscall(Syscall::JoinMulticast, e))?;
    Ok(socket.into())
}

fn configure_multicast(socket: &Socket, local: &IpAddr) -> std::io::Result<()> {
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    match local {
        IpAddr::V4(_) => {
            socket.set_broadcast(true)?;
            #[cfg(target_os = "linux")]
            disable_multicast_all(socket)?;
        }
        IpAddr::V6(_) => socket.set_only_v6(true)?,
    }
    Ok(())
}

/// Only deliver groups joined on *this* socket
///
/// Linux otherwise delivers every group joined by any socket on the
/// host to every socket bound to the port.
#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_truncation)] // socklen_t
fn disable_multicast_all(socket: &Socket) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let off: libc::c_int = 0;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_ALL,
            std::ptr::addr_of!(off).cast::<libc::c_void>(),
            std::mem::size_of_val(&off) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn join_group(
    socket: &Socket,
    group: &IpAddr,
    local: &IpAddr,
    interface: InterfaceIndex,
) -> std::io::Result<()> {
    match (group, local) {
        (IpAddr::V4(group), IpAddr::V4(local)) => {
            #[cfg(target_os = "linux")]
            {
                let _ = local;
                ipv4_multicast_operation(
                    socket,
                    libc::IP_ADD_MEMBERSHIP,
                    group,
                    interface,
                )
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = interface;
                socket.join_multicast_v4(group, local)
            }
        }
        (IpAddr::V6(group), IpAddr::V6(_)) => {
            socket.join_multicast_v6(group, interface.0.get())
        }
        _ => Err(std::io::ErrorKind::InvalidInput.into()),
    }
}

#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_truncation)] // socklen_t
#[allow(clippy::cast_possible_wrap)] // ifindex
fn ipv4_multicast_operation(
    socket: &Socket,
    op: libc::c_int,
    group: &Ipv4Addr,
    interface: InterfaceIndex,
) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // socket2 (like std::net) only joins IPv4 groups by address, which
    // is ambiguous when two interfaces share a subnet; Linux has long
    // supported joining by interface index instead.
    let mreqn = libc::ip_mreqn {
        imr_multiaddr: libc::in_addr {
            s_addr: u32::from_ne_bytes(group.octets()),
        },
        imr_address: libc::in_addr { s_addr: 0 },
        imr_ifindex: interface.0.get() as libc::c_int,
    };
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            op,
            std::ptr::addr_of!(mreqn).cast::<libc::c_void>(),
            std::mem::size_of_val(&mreqn) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// A socket receiving SSDP multicasts arriving via `local`
///
/// Bound to the wildcard address on `port` with address reuse, so
/// that several sessions (and other SSDP stacks on the same host) can
/// coexist.
///
/// # Errors
///
/// Passes on errors from creating, binding or joining.
pub(crate) fn setup_multicast_socket(
    local: &IpAddr,
    interface: InterfaceIndex,
    port: u16,
) -> Result<std::net::UdpSocket, Error> {
    setup_multicast_socket_inner(
        local,
        interface,
        port,
        new_udp_socket,
        bind,
        join_group,
    )
}

fn setup_unicast_socket_inner(
    local: &IpAddr,
    interface: InterfaceIndex,
    new_socket: NewSocketFn,
    bind: BindFn,
) -> Result<std::net::UdpSocket, Error> {
    let socket = new_socket(domain_for(local))
        .map_err(|e| Error::Syscall(Syscall::Socket, e))?;
    configure_unicast(&socket, local, interface)
        .map_err(|e| Error::Syscall(Syscall::Socket, e))?;
    let addr = match local {
        IpAddr::V4(v4) => SocketAddr::new(IpAddr::V4(*v4), 0),
        IpAddr::V6(v6) => {
            let scope = if super::multicast_group(local)
                == IpAddr::V6(super::SSDP_GROUP_V6_LINK)
            {
                interface.0.get()
            } else {
                0
            };
            SocketAddr::V6(SocketAddrV6::new(*v6, 0, 0, scope))
        }
    };
    bind(&socket, addr).map_err(|e| Error::Syscall(Syscall::Bind, e))?;
    Ok(socket.into())
}

fn configure_unicast(
    socket: &Socket,
    local: &IpAddr,
    interface: InterfaceIndex,
) -> std::io::Result<()> {
    socket.set_nonblocking(true)?;
    match local {
        IpAddr::V4(v4) => {
            socket.set_broadcast(true)?;
            socket.set_multicast_if_v4(v4)?;
            socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
            socket.set_multicast_loop_v4(true)?;
        }
        IpAddr::V6(_) => {
            socket.set_only_v6(true)?;
            socket.set_multicast_if_v6(interface.0.get())?;
            socket.set_multicast_hops_v6(MULTICAST_TTL)?;
            socket.set_multicast_loop_v6(true)?;
        }
    }
    Ok(())
}

/// A socket bound to `local` on an ephemeral port
///
/// Used for sending searches, announcements and responses, and for
/// receiving the unicast answers to our own searches.
///
/// # Errors
///
/// Passes on errors from creating or binding.
pub(crate) fn setup_unicast_socket(
    local: &IpAddr,
    interface: InterfaceIndex,
) -> Result<std::net::UdpSocket, Error> {
    setup_unicast_socket_inner(local, interface, new_udp_socket, bind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn ix(i: u32) -> InterfaceIndex {
        InterfaceIndex(NonZeroU32::new(i).unwrap())
    }

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn bad_socket(_: Domain) -> std::io::Result<Socket> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "injected"))
    }

    fn bad_bind(_: &Socket, _: SocketAddr) -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "injected"))
    }

    fn bad_join(
        _: &Socket,
        _: &IpAddr,
        _: &IpAddr,
        _: InterfaceIndex,
    ) -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "injected"))
    }

    fn good_bind(_: &Socket, _: SocketAddr) -> std::io::Result<()> {
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn multicast_socket_failures_are_tagged() {
        let r = setup_multicast_socket_inner(
            &LOCALHOST, ix(1), 0, bad_socket, bind, join_group,
        );
        assert!(matches!(r, Err(Error::Syscall(Syscall::Socket, _))));

        let r = setup_multicast_socket_inner(
            &LOCALHOST, ix(1), 0, new_udp_socket, bad_bind, join_group,
        );
        assert!(matches!(r, Err(Error::Syscall(Syscall::Bind, _))));

        let r = setup_multicast_socket_inner(
            &LOCALHOST, ix(1), 0, new_udp_socket, good_bind, bad_join,
        );
        assert!(matches!(r, Err(Error::Syscall(Syscall::JoinMulticast, _))));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn unicast_socket_failures_are_tagged() {
        let r = setup_unicast_socket_inner(&LOCALHOST, ix(1), bad_socket, bind);
        assert!(matches!(r, Err(Error::Syscall(Syscall::Socket, _))));

        let r = setup_unicast_socket_inner(
            &LOCALHOST, ix(1), new_udp_socket, bad_bind,
        );
        assert!(matches!(r, Err(Error::Syscall(Syscall::Bind, _))));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn unicast_socket_binds_to_local_address() {
        let s = setup_unicast_socket(&LOCALHOST, ix(1)).unwrap();
        let addr = s.local_addr().unwrap();
        assert_eq!(addr.ip(), LOCALHOST);
        assert_ne!(addr.port(), 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn join_rejects_mixed_families() {
        let s = new_udp_socket(Domain::IPV4).unwrap();
        let r = join_group(
            &s,
            &IpAddr::V6(super::super::SSDP_GROUP_V6_LINK),
            &LOCALHOST,
            ix(1),
        );
        assert!(r.is_err());
    }
}
