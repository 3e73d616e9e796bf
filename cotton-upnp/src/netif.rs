//! Enumerating network interfaces and watching them change
//!
//! Interfaces are reported as a sequence of [`NetworkEvent`]s: a
//! [`NetworkEvent::NewLink`] for each interface, always before that
//! interface's [`NetworkEvent::NewAddr`] events. [`watch`] keeps
//! producing events as interfaces come and go, by polling `getifaddrs`
//! and reporting the differences.

use async_stream::stream;
use bitflags::bitflags;
use futures::Stream;
use nix::ifaddrs;
use nix::net::if_::InterfaceFlags;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

/** Kernel network interface index (1-based)
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceIndex(pub NonZeroU32);

bitflags! {
    /// Interface capabilities and state, after `SIOCGIFFLAGS`
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        const UP = 0x1;
        const BROADCAST = 0x2;
        const LOOPBACK = 0x4;
        const POINTTOPOINT = 0x8; // not preserving Posix misspelling
        const RUNNING = 0x40;
        const MULTICAST = 0x1000;
    }
}

/// A change to the set of interfaces or addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A new interface, or new flags on an existing one
    NewLink(InterfaceIndex, String, Flags),
    /// An interface has gone away
    DelLink(InterfaceIndex),
    /// An address (with prefix length) has been added to an interface
    NewAddr(InterfaceIndex, IpAddr, u8),
    /// An address has been removed from an interface
    DelAddr(InterfaceIndex, IpAddr, u8),
}

/// One row of `getifaddrs` output, reduced to what we care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAddress {
    pub name: String,
    pub flags: Flags,
    pub address: Option<(IpAddr, u8)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Link {
    name: String,
    flags: Flags,
    addrs: BTreeSet<(IpAddr, u8)>,
}

/// The state of all interfaces at one moment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    links: BTreeMap<InterfaceIndex, Link>,
}

impl Snapshot {
    /// Query the operating system
    ///
    /// # Errors
    ///
    /// Passes on errors from `getifaddrs`.
    pub fn current() -> Result<Self, std::io::Error> {
        let rows = ifaddrs::getifaddrs()?.map(raw_address);
        Ok(Self::build(rows, system_index))
    }

    /// Build from pre-digested rows, resolving names with `index_of`
    pub fn build<I, F>(rows: I, index_of: F) -> Self
    where
        I: IntoIterator<Item = RawAddress>,
        F: Fn(&str) -> Option<InterfaceIndex>,
    {
        let mut links: BTreeMap<InterfaceIndex, Link> = BTreeMap::new();
        for row in rows {
            // Undo Linux aliasing: "eth0:1" is "eth0" really
            let name = match row.name.split_once(':') {
                None => row.name,
                Some((prefix, _alias)) => prefix.to_string(),
            };
            let Some(index) = index_of(&name) else {
                debug!("no index for interface {name}");
                continue;
            };
            let link = links.entry(index).or_insert_with(|| Link {
                name,
                ..Link::default()
            });
            link.flags |= row.flags;
            if let Some(addr) = row.address {
                link.addrs.insert(addr);
            }
        }
        Self { links }
    }

    /// Everything in this snapshot, as if newly arrived
    pub fn events(&self) -> Vec<NetworkEvent> {
        Snapshot::default().diff(self)
    }

    /// The events that turn `self` into `newer`
    ///
    /// Removals come first (addresses, then links); then additions
    /// (links, then addresses).
    pub fn diff(&self, newer: &Snapshot) -> Vec<NetworkEvent> {
        let mut events = Vec::new();

        for (ix, old) in &self.links {
            let remaining = newer.links.get(ix);
            for &(addr, prefix) in &old.addrs {
                if !remaining.is_some_and(|l| l.addrs.contains(&(addr, prefix)))
                {
                    events.push(NetworkEvent::DelAddr(*ix, addr, prefix));
                }
            }
            if remaining.is_none() {
                events.push(NetworkEvent::DelLink(*ix));
            }
        }

        for (ix, new) in &newer.links {
            let previous = self.links.get(ix);
            if previous.map_or(true, |p| p.flags != new.flags || p.name != new.name)
            {
                events.push(NetworkEvent::NewLink(
                    *ix,
                    new.name.clone(),
                    new.flags,
                ));
            }
        }
        for (ix, new) in &newer.links {
            let previous = self.links.get(ix);
            for &(addr, prefix) in &new.addrs {
                if !previous.is_some_and(|p| p.addrs.contains(&(addr, prefix)))
                {
                    events.push(NetworkEvent::NewAddr(*ix, addr, prefix));
                }
            }
        }
        events
    }
}

fn system_index(name: &str) -> Option<InterfaceIndex> {
    nix::net::if_::if_nametoindex(name)
        .ok()
        .and_then(NonZeroU32::new)
        .map(InterfaceIndex)
}

fn raw_address(ifaddr: ifaddrs::InterfaceAddress) -> RawAddress {
    let mut address = None;
    if let (Some(addr), Some(mask)) = (ifaddr.address, ifaddr.netmask) {
        if let Some(ipv4) = addr.as_sockaddr_in() {
            if let Some(netmask) = mask.as_sockaddr_in() {
                let prefix = u32::from(Ipv4Addr::from(netmask.ip())).leading_ones();
                address = Some((
                    IpAddr::from(Ipv4Addr::from(ipv4.ip())),
                    prefix as u8,
                ));
            }
        } else if let Some(ipv6) = addr.as_sockaddr_in6() {
            if let Some(netmask) = mask.as_sockaddr_in6() {
                let prefix = u128::from(netmask.ip()).leading_ones();
                address = Some((IpAddr::from(ipv6.ip()), prefix as u8));
            }
        }
    }
    RawAddress {
        name: ifaddr.interface_name,
        flags: map_interface_flags(&ifaddr.flags),
        address,
    }
}

fn map_interface_flags(flags: &InterfaceFlags) -> Flags {
    let mut newflags = Flags::default();
    for (iff, newf) in [
        (InterfaceFlags::IFF_UP, Flags::UP),
        (InterfaceFlags::IFF_RUNNING, Flags::RUNNING),
        (InterfaceFlags::IFF_LOOPBACK, Flags::LOOPBACK),
        (InterfaceFlags::IFF_POINTOPOINT, Flags::POINTTOPOINT),
        (InterfaceFlags::IFF_BROADCAST, Flags::BROADCAST),
        (InterfaceFlags::IFF_MULTICAST, Flags::MULTICAST),
    ] {
        if flags.contains(iff) {
            newflags |= newf;
        }
    }
    newflags
}

/** Obtain the current list of network interfaces

For a simple listing of the returned information, just use println:

```no_run
# use cotton_upnp::netif::*;
for e in get_interfaces()? {
    println!("{:?}", e);
}
# Ok::<(), std::io::Error>(())
```

# Errors

Passes on errors from `getifaddrs`.
 */
pub fn get_interfaces() -> Result<Vec<NetworkEvent>, std::io::Error> {
    Ok(Snapshot::current()?.events())
}

/// A never-ending stream of interface changes
///
/// Starts with the current state, then polls every `interval` and
/// reports whatever changed. A failed poll is logged and skipped.
pub fn watch(interval: Duration) -> impl Stream<Item = NetworkEvent> {
    stream! {
        let mut current = Snapshot::default();
        loop {
            match Snapshot::current() {
                Ok(newer) => {
                    for event in current.diff(&newer) {
                        yield event;
                    }
                    current = newer;
                }
                Err(e) => warn!("getifaddrs failed: {e}"),
            }
            tokio::time::sleep(interval).await;
        }
    }
}
