use crate::config::{Config, MAX_SEARCH_MX};
use crate::deferred::Schedule;
use crate::event::{Advertisement, Notification};
use crate::message;
use crate::netif::{Flags, InterfaceIndex, NetworkEvent};
use crate::refresh_timer::RefreshTimer;
use crate::ssdp::{self, target_match, SSDP_ALL};
use crate::udp;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slotmap::SlotMap;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

struct Interface {
    ips: Vec<IpAddr>,
    up: bool,
}

/// A callback made by [`Engine`] when notification messages arrive
///
/// See the implementation in [`crate::AsyncService`].
///
pub trait Callback {
    /// An SSDP notification has been received
    fn on_notification(&self, notification: &Notification);

    /// Whether the receiving end has gone away
    ///
    /// Closed subscriptions are dropped the next time a notification
    /// arrives.
    fn is_closed(&self) -> bool {
        false
    }
}

struct ActiveSearch<CB: Callback> {
    notification_type: String,
    callback: CB,
}

slotmap::new_key_type! { struct ActiveSearchKey; }

/// An answer owed to a searcher, sent once its random delay expires
struct PendingResponse {
    search_target: String,
    to: SocketAddr,
    local: IpAddr,
}

/// The core of an SSDP implementation
///
/// This low-level facility is usually wrapped-up in
/// [`crate::AsyncService`] for use in larger programs, but can also
/// be used directly when needed.
///
/// This struct handles parsing and emitting SSDP messages; it does
/// not own or define the UDP sockets themselves, which are left to
/// its owner.  The owner should pass incoming UDP packets to
/// [`Engine::on_data`], and changes to available network interfaces
/// to [`Engine::on_network_event`].
///
/// The owner should also implement a timer facility: the [`Engine`]
/// can be asked at any time when it next needs a timer callback
/// ([`Engine::next_wakeup`]), and, when that time comes, the
/// [`Engine::wakeup`] method must be called. See, for instance, the
/// `tokio::select!` loop in `AsyncService`.
///
/// Each usable local address gets its own socket session, opened via
/// [`udp::Multicast::join_multicast_group`]. An interface is usable
/// if it is up, running and multicast-capable.
///
pub struct Engine<CB: Callback> {
    interfaces: HashMap<InterfaceIndex, Interface>,
    sessions: HashMap<IpAddr, InterfaceIndex>,
    active_searches: SlotMap<ActiveSearchKey, ActiveSearch<CB>>,
    advertisements: HashMap<String, Advertisement>,
    pending_responses: Schedule<u64, PendingResponse>,
    next_response_key: u64,
    refresh_timer: RefreshTimer,
    rng: StdRng,
    port: u16,
    max_age: u32,
    search_mx: u32,
    enable_ipv6: bool,
}

impl<CB: Callback> Engine<CB> {
    /// Create a new Engine, parameterised by callback type
    ///
    #[must_use]
    pub fn new(config: &Config, random_seed: u64, now: Instant) -> Self {
        Engine {
            interfaces: HashMap::default(),
            sessions: HashMap::default(),
            active_searches: SlotMap::with_key(),
            advertisements: HashMap::default(),
            pending_responses: Schedule::new(),
            next_response_key: 0,
            refresh_timer: RefreshTimer::new(
                Duration::from_secs(u64::from(config.advertise_max_age)),
                random_seed,
                now,
            ),
            rng: StdRng::seed_from_u64(random_seed.rotate_left(32)),
            port: config.ssdp_port,
            max_age: config.advertise_max_age,
            search_mx: config.effective_search_mx(),
            enable_ipv6: config.enable_ipv6,
        }
    }

    /// Obtain the desired delay before the next [`Engine::wakeup`] is needed
    #[must_use]
    pub fn next_wakeup(&self, now: Instant) -> Duration {
        let refresh = self
            .refresh_timer
            .next_refresh()
            .saturating_duration_since(now);
        match self.pending_responses.next_wakeup(now) {
            Some(response) => refresh.min(response),
            None => refresh,
        }
    }

    /// Notify the `Engine` that its timeout has expired
    ///
    /// The desired timeout duration can be obtained from [`Engine::next_wakeup`].
    ///
    pub fn wakeup<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        now: Instant,
        socket: &SCK,
    ) {
        for (_, response) in self.pending_responses.take_due(now) {
            self.respond(&response, socket);
        }

        if !self.refresh_timer.is_due(now) {
            return;
        }
        self.refresh_timer.update_refresh(now);

        for (key, value) in &self.advertisements {
            self.notify_on_all(key, value, socket);
        }
        for search_type in self.search_types() {
            self.search_on_all(&search_type, socket);
        }
    }

    /// The searches to repeat
    ///
    /// If anybody is doing an ssdp:all search, then we don't need to
    /// do any of the other searches.
    fn search_types(&self) -> Vec<String> {
        if self
            .active_searches
            .values()
            .any(|s| s.notification_type == SSDP_ALL)
        {
            return vec![SSDP_ALL.to_string()];
        }
        let mut types = Vec::new();
        for s in self.active_searches.values() {
            if !types.contains(&s.notification_type) {
                types.push(s.notification_type.clone());
            }
        }
        types
    }

    fn search_on<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        search_type: &str,
        source: &IpAddr,
        interface: InterfaceIndex,
        socket: &SCK,
    ) {
        let message = ssdp::build_search(
            &udp::multicast_host(source),
            search_type,
            self.search_mx,
        );
        if let Err(e) = socket.send_multicast(
            &message.serialize(),
            &udp::multicast_destination(source, interface, self.port),
            source,
        ) {
            debug!("search from {source} failed: {e}");
        }
    }

    fn search_on_all<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        search_type: &str,
        socket: &SCK,
    ) {
        for (ip, ix) in &self.sessions {
            self.search_on(search_type, ip, *ix, socket);
        }
    }

    /// Subscribe to notifications of a particular service type
    ///
    /// And send searches.
    pub fn subscribe<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        notification_type: String,
        callback: CB,
        socket: &SCK,
    ) {
        self.search_on_all(&notification_type, socket);
        let s = ActiveSearch {
            notification_type,
            callback,
        };
        self.active_searches.insert(s);
    }

    /// Search on every session, without subscribing
    ///
    /// Answers go to existing subscribers whose type matches.
    pub fn search<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        search_type: &str,
        socket: &SCK,
    ) {
        self.search_on_all(search_type, socket);
    }

    fn call_subscribers(&mut self, notification: &Notification) {
        self.active_searches.retain(|_, s| !s.callback.is_closed());
        for s in self.active_searches.values() {
            if target_match(
                &s.notification_type,
                notification.notification_type(),
            ) {
                s.callback.on_notification(notification);
            }
        }
    }

    /// Notify the `Engine` that data has arrived on one of its sessions
    ///
    /// `local` is the address of the session it arrived on. Malformed
    /// or unrecognised datagrams are dropped. Answers to searches are
    /// sent later, from [`Engine::wakeup`].
    pub fn on_data(
        &mut self,
        buf: &[u8],
        local: IpAddr,
        source: SocketAddr,
        now: Instant,
    ) {
        let message = match message::parse(buf) {
            Ok(m) => m,
            Err(e) => {
                trace!("dropping datagram from {source}: {e}");
                return;
            }
        };
        let classified = match ssdp::classify(&message) {
            Ok(c) => c,
            Err(e) => {
                trace!("ignoring message from {source}: {e}");
                return;
            }
        };
        match classified {
            ssdp::Message::NotifyAlive {
                notification_type,
                unique_service_name,
                location,
                max_age,
            } => {
                self.call_subscribers(&Notification::Alive {
                    notification_type,
                    unique_service_name,
                    location,
                    max_age,
                    source,
                    local,
                    message,
                });
            }
            ssdp::Message::NotifyByeBye {
                notification_type,
                unique_service_name,
            } => {
                self.call_subscribers(&Notification::ByeBye {
                    notification_type,
                    unique_service_name,
                    source,
                    local,
                    message,
                });
            }
            ssdp::Message::Search {
                search_target,
                maximum_wait_sec,
            } => {
                self.on_search(search_target, maximum_wait_sec, local, source, now);
            }
            ssdp::Message::Response {
                search_target,
                unique_service_name,
                location,
                max_age,
            } => {
                self.call_subscribers(&Notification::SearchResult {
                    notification_type: search_target,
                    unique_service_name,
                    location,
                    max_age,
                    source,
                    local,
                    message,
                });
            }
        }
    }

    /// Queue an answer to a search, after a random delay up to MX
    ///
    /// MX values above [`MAX_SEARCH_MX`] are treated as that.
    fn on_search(
        &mut self,
        search_target: String,
        maximum_wait_sec: u32,
        local: IpAddr,
        source: SocketAddr,
        now: Instant,
    ) {
        let mx = maximum_wait_sec.min(MAX_SEARCH_MX);
        let delay = Duration::from_millis(
            self.rng.random_range(0..=u64::from(mx) * 1000),
        );
        trace!("search for {search_target} from {source}, answering in {delay:?}");
        let key = self.next_response_key;
        self.next_response_key += 1;
        self.pending_responses.schedule(
            key,
            PendingResponse {
                search_target,
                to: source,
                local,
            },
            delay,
            now,
        );
    }

    fn respond<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        response: &PendingResponse,
        socket: &SCK,
    ) {
        for (key, value) in &self.advertisements {
            if !target_match(&response.search_target, &value.notification_type)
            {
                continue;
            }
            let mut url = value.location.clone();
            let _ = url.set_ip_host(response.local);

            let response_type = if response.search_target == SSDP_ALL {
                &value.notification_type
            } else {
                &response.search_target
            };
            let message = ssdp::build_response(
                response_type,
                key,
                url.as_str(),
                self.max_age,
            );
            if let Err(e) =
                socket.send_to(&message.serialize(), &response.to, &response.local)
            {
                debug!("response to {} failed: {e}", response.to);
            }
        }
    }

    /// Open a session on `addr` and announce ourselves there
    fn open_session<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        addr: IpAddr,
        interface: InterfaceIndex,
        socket: &SCK,
    ) {
        if self.sessions.contains_key(&addr) {
            return;
        }
        if let Err(e) = socket.join_multicast_group(
            &udp::multicast_group(&addr),
            &addr,
            interface,
        ) {
            warn!("cannot open SSDP session on {addr}: {e}");
            return;
        }
        debug!("SSDP session on {addr}");
        self.sessions.insert(addr, interface);
        self.send_all(&addr, interface, socket);
    }

    /// Close the session on `addr`; returns whether there was one
    fn close_session<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        addr: &IpAddr,
        socket: &SCK,
    ) -> bool {
        let Some(interface) = self.sessions.remove(addr) else {
            return false;
        };
        if let Err(e) = socket.leave_multicast_group(
            &udp::multicast_group(addr),
            addr,
            interface,
        ) {
            debug!("leaving group on {addr}: {e}");
        }
        true
    }

    fn send_all<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        ip: &IpAddr,
        interface: InterfaceIndex,
        socket: &SCK,
    ) {
        for search_type in self.search_types() {
            self.search_on(&search_type, ip, interface, socket);
        }
        for (key, value) in &self.advertisements {
            self.notify_on(key, value, ip, interface, socket);
        }
    }

    fn remove_interface<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        ix: InterfaceIndex,
        socket: &SCK,
    ) -> Vec<IpAddr> {
        let Some(interface) = self.interfaces.remove(&ix) else {
            return Vec::new();
        };
        interface
            .ips
            .into_iter()
            .filter(|ip| self.close_session(ip, socket))
            .collect()
    }

    /// Notify the `Engine` of a network interface change
    ///
    /// Returns the local addresses whose sessions closed as a result,
    /// so that the owner can tell anyone tracking devices seen there.
    /// A session which cannot be opened is logged and skipped.
    pub fn on_network_event<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        e: &NetworkEvent,
        socket: &SCK,
    ) -> Vec<IpAddr> {
        let mut lost = Vec::new();
        match e {
            NetworkEvent::NewLink(ix, _name, flags) => {
                if !flags.contains(Flags::MULTICAST) {
                    return self.remove_interface(*ix, socket);
                }
                let up = flags.contains(Flags::RUNNING | Flags::UP);
                let Some(v) = self.interfaces.get_mut(ix) else {
                    self.interfaces.insert(
                        *ix,
                        Interface {
                            ips: Vec::new(),
                            up,
                        },
                    );
                    return lost;
                };
                let was_up = v.up;
                v.up = up;
                let ips = v.ips.clone();
                if up && !was_up {
                    for ip in ips {
                        self.open_session(ip, *ix, socket);
                    }
                } else if !up && was_up {
                    lost.extend(
                        ips.into_iter().filter(|ip| self.close_session(ip, socket)),
                    );
                }
            }
            NetworkEvent::DelLink(ix) => {
                return self.remove_interface(*ix, socket);
            }
            NetworkEvent::NewAddr(ix, addr, _prefix) => {
                if addr.is_ipv6() && !self.enable_ipv6 {
                    trace!("IPv6 disabled, ignoring {addr}");
                    return lost;
                }
                // Snapshots and watchers guarantee we get a NewLink
                // before any NewAddr
                let Some(v) = self.interfaces.get_mut(ix) else {
                    return lost;
                };
                if v.ips.contains(addr) {
                    return lost;
                }
                v.ips.push(*addr);
                if v.up {
                    self.open_session(*addr, *ix, socket);
                }
            }
            NetworkEvent::DelAddr(ix, addr, _prefix) => {
                if let Some(v) = self.interfaces.get_mut(ix) {
                    if let Some(n) = v.ips.iter().position(|a| a == addr) {
                        v.ips.swap_remove(n);
                    }
                }
                if self.close_session(addr, socket) {
                    lost.push(*addr);
                }
            }
        }
        lost
    }

    /// Notify the `Engine` that the session on `local` has failed
    ///
    /// Returns whether there was such a session. It stays closed until
    /// its interface next comes up.
    pub fn on_session_lost<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        local: &IpAddr,
        socket: &SCK,
    ) -> bool {
        self.close_session(local, socket)
    }

    /// The local addresses with open sessions
    pub fn local_addresses(&self) -> Vec<IpAddr> {
        self.sessions.keys().copied().collect()
    }

    fn notify_on<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        unique_service_name: &str,
        advertisement: &Advertisement,
        source: &IpAddr,
        interface: InterfaceIndex,
        socket: &SCK,
    ) {
        let mut url = advertisement.location.clone();
        let _ = url.set_ip_host(*source);
        let message = ssdp::build_notify(
            &udp::multicast_host(source),
            &advertisement.notification_type,
            unique_service_name,
            url.as_str(),
            self.max_age,
        );
        if let Err(e) = socket.send_multicast(
            &message.serialize(),
            &udp::multicast_destination(source, interface, self.port),
            source,
        ) {
            debug!("notify from {source} failed: {e}");
        }
    }

    fn notify_on_all<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        unique_service_name: &str,
        advertisement: &Advertisement,
        socket: &SCK,
    ) {
        for (ip, ix) in &self.sessions {
            self.notify_on(unique_service_name, advertisement, ip, *ix, socket);
        }
    }

    fn byebye_on_all<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        notification_type: &str,
        unique_service_name: &str,
        socket: &SCK,
    ) {
        for (ip, ix) in &self.sessions {
            let message = ssdp::build_byebye(
                &udp::multicast_host(ip),
                notification_type,
                unique_service_name,
            );
            if let Err(e) = socket.send_multicast(
                &message.serialize(),
                &udp::multicast_destination(ip, *ix, self.port),
                ip,
            ) {
                debug!("byebye from {ip} failed: {e}");
            }
        }
    }

    /// Advertise a local resource to SSDP peers
    pub fn advertise<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        unique_service_name: String,
        advertisement: Advertisement,
        socket: &SCK,
    ) {
        self.notify_on_all(&unique_service_name, &advertisement, socket);
        self.advertisements
            .insert(unique_service_name, advertisement);
    }

    /// Withdraw an advertisement for a local resource
    ///
    /// For instance, it is "polite" to call this if shutting down
    /// cleanly.
    ///
    pub fn deadvertise<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        unique_service_name: &str,
        socket: &SCK,
    ) {
        if let Some(advertisement) =
            self.advertisements.remove(unique_service_name)
        {
            self.byebye_on_all(
                &advertisement.notification_type,
                unique_service_name,
                socket,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssdp::Message;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};
    use std::num::NonZeroU32;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeSocket {
        sends: Mutex<Vec<(SocketAddr, IpAddr, Message)>>,
        mcasts: Mutex<Vec<(IpAddr, IpAddr, bool)>>,
        injecting_multicast_error: bool,
    }

    impl FakeSocket {
        fn contains_send<F>(
            &self,
            wasto: SocketAddr,
            wasfrom: IpAddr,
            mut f: F,
        ) -> bool
        where
            F: FnMut(&Message) -> bool,
        {
            self.sends.lock().unwrap().iter().any(|(to, from, msg)| {
                *to == wasto && *from == wasfrom && f(msg)
            })
        }

        fn contains_search(&self, search: &str) -> bool {
            self.contains_send(multicast_dest(), LOCAL_SRC, |m| {
                matches!(m,
                             Message::Search { search_target, .. }
                             if search_target == search)
            })
        }

        fn contains_notify(&self, location: &str) -> bool {
            self.contains_send(multicast_dest(), LOCAL_SRC, |m| {
                matches!(m,
                         Message::NotifyAlive { location: l, .. }
                         if l == location)
            })
        }

        fn no_sends(&self) -> bool {
            self.sends.lock().unwrap().is_empty()
        }

        fn send_count(&self) -> usize {
            self.sends.lock().unwrap().len()
        }

        fn sends_to(&self, to: SocketAddr) -> usize {
            self.sends
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _, _)| *t == to)
                .count()
        }

        fn contains_mcast(
            &self,
            group: IpAddr,
            local: IpAddr,
            join: bool,
        ) -> bool {
            self.mcasts.lock().unwrap().iter().any(|(gp, l, jn)| {
                *gp == group && *l == local && *jn == join
            })
        }

        fn no_mcasts(&self) -> bool {
            self.mcasts.lock().unwrap().is_empty()
        }

        fn clear(&self) {
            self.sends.lock().unwrap().clear();
            self.mcasts.lock().unwrap().clear();
        }

        fn inject_multicast_error(&mut self, errors: bool) {
            self.injecting_multicast_error = errors;
        }
    }

    impl udp::TargetedSend for FakeSocket {
        fn send_to(
            &self,
            buffer: &[u8],
            to: &SocketAddr,
            from: &IpAddr,
        ) -> Result<(), udp::Error> {
            self.sends.lock().unwrap().push((
                *to,
                *from,
                ssdp::parse(buffer).unwrap(),
            ));
            Ok(())
        }
    }

    impl udp::Multicast for FakeSocket {
        fn join_multicast_group(
            &self,
            multicast_address: &IpAddr,
            local: &IpAddr,
            _interface: InterfaceIndex,
        ) -> Result<(), udp::Error> {
            if self.injecting_multicast_error {
                Err(udp::Error::Syscall(
                    udp::Syscall::JoinMulticast,
                    std::io::Error::new(std::io::ErrorKind::Other, "injected"),
                ))
            } else {
                self.mcasts.lock().unwrap().push((
                    *multicast_address,
                    *local,
                    true,
                ));
                Ok(())
            }
        }

        fn leave_multicast_group(
            &self,
            multicast_address: &IpAddr,
            local: &IpAddr,
            _interface: InterfaceIndex,
        ) -> Result<(), udp::Error> {
            self.mcasts.lock().unwrap().push((
                *multicast_address,
                *local,
                false,
            ));
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct FakeCallback {
        calls: Arc<Mutex<Vec<Notification>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl FakeCallback {
        fn contains_notify(&self, desired_type: &str) -> bool {
            self.calls.lock().unwrap().iter().any(|n| {
                matches!(
                n,
                Notification::Alive { notification_type, .. }
                if notification_type == desired_type
                    )
            })
        }

        fn contains_search_result(&self, desired_type: &str) -> bool {
            self.calls.lock().unwrap().iter().any(|n| {
                matches!(
                n,
                Notification::SearchResult { notification_type, .. }
                if notification_type == desired_type
                    )
            })
        }

        fn contains_byebye(&self, desired_type: &str) -> bool {
            self.calls.lock().unwrap().iter().any(|n| {
                matches!(n,
                Notification::ByeBye { notification_type, .. }
                if notification_type == desired_type
                )
            })
        }

        fn no_notifies(&self) -> bool {
            self.calls.lock().unwrap().is_empty()
        }

        fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }
    }

    impl Callback for FakeCallback {
        fn on_notification(&self, notification: &Notification) {
            self.calls.lock().unwrap().push(notification.clone());
        }

        fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }
    }

    fn multicast_dest() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(239, 255, 255, 250),
            1900,
        ))
    }

    const LOCAL_IX: InterfaceIndex =
        InterfaceIndex(match NonZeroU32::new(4) {
            Some(n) => n,
            None => unreachable!(),
        });
    const LOCAL_SRC: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 100, 1));
    const LOCAL_SRC_2: IpAddr = IpAddr::V4(Ipv4Addr::new(169, 254, 33, 203));
    const LOCAL_V6: IpAddr =
        IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x37));
    const MULTICAST_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250));

    fn remote_src() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(192, 168, 100, 60),
            12345,
        ))
    }

    fn new_eth0_if() -> NetworkEvent {
        NetworkEvent::NewLink(
            LOCAL_IX,
            "jeth0".to_string(),
            Flags::UP | Flags::RUNNING | Flags::MULTICAST,
        )
    }

    fn new_eth0_if_down() -> NetworkEvent {
        NetworkEvent::NewLink(LOCAL_IX, "jeth0".to_string(), Flags::MULTICAST)
    }

    fn new_eth0_if_nomulti() -> NetworkEvent {
        NetworkEvent::NewLink(
            LOCAL_IX,
            "jeth0".to_string(),
            Flags::UP | Flags::RUNNING,
        )
    }

    fn del_eth0() -> NetworkEvent {
        NetworkEvent::DelLink(LOCAL_IX)
    }

    const NEW_ETH0_ADDR: NetworkEvent =
        NetworkEvent::NewAddr(LOCAL_IX, LOCAL_SRC, 8);
    const NEW_ETH0_ADDR_2: NetworkEvent =
        NetworkEvent::NewAddr(LOCAL_IX, LOCAL_SRC_2, 8);
    const DEL_ETH0_ADDR: NetworkEvent =
        NetworkEvent::DelAddr(LOCAL_IX, LOCAL_SRC, 8);
    const NEW_IPV6_ADDR: NetworkEvent =
        NetworkEvent::NewAddr(LOCAL_IX, LOCAL_V6, 64);

    fn root_advert() -> Advertisement {
        Advertisement {
            notification_type: "upnp:rootdevice".to_string(),
            location: url::Url::parse("http://127.0.0.1/description.xml")
                .unwrap(),
        }
    }

    fn build(m: &message::Message) -> Vec<u8> {
        m.serialize()
    }

    fn build_notify(notification_type: &str) -> Vec<u8> {
        build(&ssdp::build_notify(
            "239.255.255.250:1900",
            notification_type,
            "uuid:37",
            "http://me",
            1800,
        ))
    }

    fn build_byebye(notification_type: &str) -> Vec<u8> {
        build(&ssdp::build_byebye(
            "239.255.255.250:1900",
            notification_type,
            "uuid:37",
        ))
    }

    fn build_response(notification_type: &str) -> Vec<u8> {
        build(&ssdp::build_response(
            notification_type,
            "uuid:37",
            "http://me",
            1800,
        ))
    }

    fn build_search(notification_type: &str, mx: u32) -> Vec<u8> {
        build(&ssdp::build_search(
            "239.255.255.250:1900",
            notification_type,
            mx,
        ))
    }

    struct Fixture {
        e: Engine<FakeCallback>,
        c: FakeCallback,
        s: FakeSocket,
        now: Instant,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self::with_config(&Config::default())
        }
    }

    impl Fixture {
        fn with_config(config: &Config) -> Self {
            let now = Instant::now();
            Fixture {
                e: Engine::new(config, 1, now),
                c: FakeCallback::default(),
                s: FakeSocket::default(),
                now,
            }
        }

        fn new_with<F: FnMut(&mut Fixture)>(mut f: F) -> Fixture {
            let mut fixture = Fixture::default();
            f(&mut fixture);
            fixture.c.clear();
            fixture.s.clear();
            fixture
        }

        fn network(&mut self, e: &NetworkEvent) -> Vec<IpAddr> {
            self.e.on_network_event(e, &self.s)
        }

        fn receive(&mut self, buf: &[u8]) {
            self.receive_from(buf, remote_src());
        }

        fn receive_from(&mut self, buf: &[u8], source: SocketAddr) {
            self.e.on_data(buf, LOCAL_SRC, source, self.now);
        }
    }

    /* ==== Tests for Engine ==== */

    #[test]
    fn search_sent_on_network_event_if_already_subscribed() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
            f.network(&new_eth0_if());
        });

        f.network(&NEW_ETH0_ADDR);

        // Multicasts go out twice
        assert_eq!(f.s.send_count(), 2);
        assert!(f.s.contains_search("ssdp:all"));
    }

    #[test]
    fn search_sent_on_subscribe_if_network_already_exists() {
        let mut f = Fixture::new_with(|f| {
            f.network(&new_eth0_if());
            f.network(&NEW_ETH0_ADDR);
        });

        f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);

        assert_eq!(f.s.send_count(), 2);
        assert!(f.s.contains_search("ssdp:all"));
    }

    #[test]
    fn session_opened_per_address() {
        let mut f = Fixture::new_with(|f| {
            f.network(&new_eth0_if());
        });

        f.network(&NEW_ETH0_ADDR);
        f.network(&NEW_ETH0_ADDR_2);

        assert!(f.s.contains_mcast(MULTICAST_IP, LOCAL_SRC, true));
        assert!(f.s.contains_mcast(MULTICAST_IP, LOCAL_SRC_2, true));
        let mut addrs = f.e.local_addresses();
        addrs.sort();
        assert_eq!(addrs, vec![LOCAL_SRC_2, LOCAL_SRC]);
    }

    #[test]
    fn no_search_sent_on_down_interface() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
            f.network(&new_eth0_if_down());
        });

        f.network(&NEW_ETH0_ADDR);

        assert!(f.s.no_sends());
        assert!(f.s.no_mcasts());
    }

    #[test]
    fn no_search_sent_on_non_multicast_interface() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
            f.network(&new_eth0_if_nomulti());
        });

        f.network(&NEW_ETH0_ADDR);

        assert!(f.s.no_sends());
        assert!(f.e.local_addresses().is_empty());
    }

    #[test]
    fn searches_sent_on_two_ips() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
            f.network(&new_eth0_if());
            f.network(&NEW_ETH0_ADDR);
            f.network(&NEW_ETH0_ADDR_2);
        });

        f.e.search("upnp:rootdevice", &f.s);

        assert_eq!(f.s.send_count(), 4);
        assert!(f.s.contains_send(multicast_dest(), LOCAL_SRC_2, |m| matches!(
            m,
            Message::Search { search_target, .. } if search_target == "upnp:rootdevice"
        )));
    }

    #[test]
    fn deleted_address_reported_lost() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
            f.network(&new_eth0_if());
            f.network(&NEW_ETH0_ADDR);
        });

        let lost = f.network(&DEL_ETH0_ADDR);

        assert_eq!(lost, vec![LOCAL_SRC]);
        assert!(f.s.contains_mcast(MULTICAST_IP, LOCAL_SRC, false));
        f.s.clear();
        f.e.search("ssdp:all", &f.s);
        assert!(f.s.no_sends());
    }

    #[test]
    fn deleted_link_reports_all_addresses_lost() {
        let mut f = Fixture::new_with(|f| {
            f.network(&new_eth0_if());
            f.network(&NEW_ETH0_ADDR);
            f.network(&NEW_ETH0_ADDR_2);
        });

        let mut lost = f.network(&del_eth0());
        lost.sort();

        assert_eq!(lost, vec![LOCAL_SRC_2, LOCAL_SRC]);
        assert!(f.e.local_addresses().is_empty());
    }

    #[test]
    fn interface_going_down_closes_sessions() {
        let mut f = Fixture::new_with(|f| {
            f.network(&new_eth0_if());
            f.network(&NEW_ETH0_ADDR);
        });

        let lost = f.network(&new_eth0_if_down());

        assert_eq!(lost, vec![LOCAL_SRC]);
        assert!(f.e.local_addresses().is_empty());
    }

    #[test]
    fn search_sent_on_interface_newly_up() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
            f.network(&new_eth0_if_down());
            f.network(&NEW_ETH0_ADDR);
        });

        f.network(&new_eth0_if());

        assert_eq!(f.s.send_count(), 2);
        assert!(f.s.contains_search("ssdp:all"));
    }

    #[test]
    fn join_failure_skips_address() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
            f.network(&new_eth0_if());
        });
        f.s.inject_multicast_error(true);

        let lost = f.network(&NEW_ETH0_ADDR);

        assert!(lost.is_empty());
        assert!(f.s.no_sends());
        assert!(f.e.local_addresses().is_empty());
    }

    #[test]
    fn ipv6_uses_link_local_group() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
            f.network(&new_eth0_if());
        });

        f.network(&NEW_IPV6_ADDR);

        assert!(f.s.contains_mcast(
            IpAddr::V6(udp::SSDP_GROUP_V6_LINK),
            LOCAL_V6,
            true
        ));
        let dest = udp::multicast_destination(&LOCAL_V6, LOCAL_IX, 1900);
        assert!(f.s.contains_send(dest, LOCAL_V6, |_| true));
    }

    #[test]
    fn ipv6_ignored_when_disabled() {
        let config = Config {
            enable_ipv6: false,
            ..Config::default()
        };
        let mut f = Fixture::with_config(&config);
        f.network(&new_eth0_if());

        f.network(&NEW_IPV6_ADDR);

        assert!(f.s.no_mcasts());
        assert!(f.e.local_addresses().is_empty());
    }

    #[test]
    fn only_one_ssdpall_search_is_sent() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("upnp:rootdevice".to_string(), f.c.clone(), &f.s);
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
            f.network(&new_eth0_if());
        });

        f.network(&NEW_ETH0_ADDR);

        assert_eq!(f.s.send_count(), 2);
        assert!(f.s.contains_search("ssdp:all"));
    }

    #[test]
    fn two_normal_searches_are_sent() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("upnp:rootdevice".to_string(), f.c.clone(), &f.s);
            f.e.subscribe("upnp::Renderer:3".to_string(), f.c.clone(), &f.s);
            f.network(&new_eth0_if());
        });

        f.network(&NEW_ETH0_ADDR);

        assert_eq!(f.s.send_count(), 4);
        assert!(f.s.contains_search("upnp:rootdevice"));
        assert!(f.s.contains_search("upnp::Renderer:3"));
    }

    #[test]
    fn bogus_message_ignored() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
        });

        f.receive(b"foo-bar");
        f.receive(b"GET / HTTP/1.1\r\n\r\n");

        assert!(f.c.no_notifies());
    }

    #[test]
    fn notify_calls_subscriber() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
        });

        f.receive(&build_notify("upnp::Directory:3"));

        assert!(f.c.contains_notify("upnp::Directory:3"));
        let calls = f.c.calls.lock().unwrap();
        assert!(matches!(&calls[0],
                         Notification::Alive { max_age, source, local, .. }
                         if *max_age == 1800
                         && *source == remote_src()
                         && *local == LOCAL_SRC));
    }

    #[test]
    fn notify_doesnt_call_subscriber() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("upnp::Directory:3".to_string(), f.c.clone(), &f.s);
        });

        f.receive(&build_notify("upnp::ContentDirectory:3"));

        assert!(f.c.no_notifies());
    }

    #[test]
    fn byebye_calls_subscriber() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
        });

        f.receive(&build_byebye("upnp::Directory:3"));

        assert!(f.c.contains_byebye("upnp::Directory:3"));
    }

    #[test]
    fn response_calls_subscriber() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("upnp::Directory:3".to_string(), f.c.clone(), &f.s);
        });

        f.receive(&build_response("upnp::Directory:3"));

        assert!(f.c.contains_search_result("upnp::Directory:3"));
    }

    #[test]
    fn response_doesnt_call_subscriber() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("upnp::Directory:3".to_string(), f.c.clone(), &f.s);
        });

        f.receive(&build_response("upnp::ContentDirectory:3"));

        assert!(f.c.no_notifies());
    }

    #[test]
    fn closed_subscriber_dropped() {
        let mut f = Fixture::new_with(|f| {
            f.e.subscribe("ssdp:all".to_string(), f.c.clone(), &f.s);
        });
        *f.c.closed.lock().unwrap() = true;

        f.receive(&build_notify("upnp::Directory:3"));

        assert!(f.c.no_notifies());
        assert!(f.e.active_searches.is_empty());
    }

    #[test]
    fn notify_sent_on_network_event() {
        let mut f = Fixture::new_with(|f| {
            f.e.advertise("uuid:137".to_string(), root_advert(), &f.s);
            f.network(&new_eth0_if());
        });

        f.network(&NEW_ETH0_ADDR);

        assert!(f.s.contains_notify("http://192.168.100.1/description.xml"));
    }

    #[test]
    fn notify_sent_on_advertise() {
        let mut f = Fixture::new_with(|f| {
            f.network(&new_eth0_if());
            f.network(&NEW_ETH0_ADDR);
        });

        f.e.advertise("uuid:137".to_string(), root_advert(), &f.s);

        assert_eq!(f.s.send_count(), 2);
        assert!(f.s.contains_notify("http://192.168.100.1/description.xml"));
    }

    #[test]
    fn byebye_sent_on_deadvertise() {
        let mut f = Fixture::new_with(|f| {
            f.network(&new_eth0_if());
            f.network(&NEW_ETH0_ADDR);
            f.e.advertise("uuid:137".to_string(), root_advert(), &f.s);
        });

        f.e.deadvertise("uuid:137", &f.s);

        assert!(f.s.contains_send(multicast_dest(), LOCAL_SRC, |m| matches!(
            m,
            Message::NotifyByeBye { unique_service_name, .. } if unique_service_name == "uuid:137"
        )));
    }

    #[test]
    fn no_byebye_for_unknown_advertisement() {
        let mut f = Fixture::new_with(|f| {
            f.network(&new_eth0_if());
            f.network(&NEW_ETH0_ADDR);
        });

        f.e.deadvertise("uuid:137", &f.s);

        assert!(f.s.no_sends());
    }

    fn advertised_fixture() -> Fixture {
        Fixture::new_with(|f| {
            f.network(&new_eth0_if());
            f.network(&NEW_ETH0_ADDR);
            f.e.advertise("uuid:137".to_string(), root_advert(), &f.s);
            // Get the initial refresh out of the way
            let now = f.now;
            f.e.wakeup(now, &f.s);
        })
    }

    #[test]
    fn response_to_search_is_deferred() {
        let mut f = advertised_fixture();

        f.receive(&build_search("upnp:rootdevice", 2));

        assert_eq!(f.s.sends_to(remote_src()), 0);
        assert!(f.e.next_wakeup(f.now) <= Duration::from_secs(2));

        let later = f.now + Duration::from_secs(2);
        f.e.wakeup(later, &f.s);

        assert_eq!(f.s.sends_to(remote_src()), 1);
        assert!(f.s.contains_send(
            remote_src(), LOCAL_SRC,
            |m| matches!(m,
                         Message::Response { search_target, unique_service_name,
                                             location, .. }
                         if search_target == "upnp:rootdevice"
                         && unique_service_name == "uuid:137"
                         && location == "http://192.168.100.1/description.xml")));

        // And only once
        f.e.wakeup(later + Duration::from_secs(2), &f.s);
        assert_eq!(f.s.sends_to(remote_src()), 1);
    }

    #[test]
    fn huge_mx_answered_within_five_seconds() {
        let mut f = advertised_fixture();

        for _ in 0..10 {
            f.receive(&build_search("upnp:rootdevice", u32::MAX));
        }
        assert!(f.e.next_wakeup(f.now) <= Duration::from_secs(5));

        f.e.wakeup(f.now + Duration::from_secs(5), &f.s);
        assert_eq!(f.s.sends_to(remote_src()), 10);
        assert!(f.e.pending_responses.is_empty());
    }

    #[test]
    fn overlapping_searches_answered_separately() {
        let mut f = advertised_fixture();
        let other = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(192, 168, 100, 61),
            23456,
        ));

        f.receive(&build_search("upnp:rootdevice", 3));
        f.receive_from(&build_search("upnp:rootdevice", 3), other);
        assert_eq!(f.e.pending_responses.len(), 2);
        assert_eq!(f.s.send_count(), 0);

        f.e.wakeup(f.now + Duration::from_secs(3), &f.s);
        assert_eq!(f.s.sends_to(remote_src()), 1);
        assert_eq!(f.s.sends_to(other), 1);
        assert!(f.s.contains_send(
            other, LOCAL_SRC,
            |m| matches!(m,
                         Message::Response { unique_service_name, .. }
                         if unique_service_name == "uuid:137")));
    }

    #[test]
    fn search_without_mx_not_answered() {
        let mut f = advertised_fixture();

        f.receive(
            b"M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
MAN: \"ssdp:discover\"\r\n\
ST: upnp:rootdevice\r\n\
\r\n",
        );

        f.e.wakeup(f.now + Duration::from_secs(10), &f.s);
        assert_eq!(f.s.sends_to(remote_src()), 0);
    }

    #[test]
    fn response_sent_to_downlevel_search() {
        let mut f = Fixture::new_with(|f| {
            f.network(&new_eth0_if());
            f.network(&NEW_ETH0_ADDR);
            f.e.advertise(
                "uuid:137".to_string(),
                Advertisement {
                    notification_type: "upnp::Directory:3".to_string(),
                    location: url::Url::parse(
                        "http://127.0.0.1/description.xml",
                    )
                    .unwrap(),
                },
                &f.s,
            );
        });

        f.receive(&build_search("upnp::Directory:2", 1));
        f.e.wakeup(f.now + Duration::from_secs(1), &f.s);

        assert!(f.s.contains_send(
            remote_src(), LOCAL_SRC,
            |m| matches!(m,
                         Message::Response { search_target, .. }
                         if search_target == "upnp::Directory:2")));
    }

    #[test]
    fn response_sent_to_generic_search() {
        let mut f = advertised_fixture();

        f.receive(&build_search("ssdp:all", 1));
        f.e.wakeup(f.now + Duration::from_secs(1), &f.s);

        assert!(f.s.contains_send(
            remote_src(), LOCAL_SRC,
            |m| matches!(m,
                         Message::Response { search_target, .. }
                         if search_target == "upnp:rootdevice")));
    }

    #[test]
    fn no_response_to_unmatched_search() {
        let mut f = advertised_fixture();

        f.receive(&build_search("upnp::Directory:2", 1));
        f.e.wakeup(f.now + Duration::from_secs(1), &f.s);

        assert_eq!(f.s.sends_to(remote_src()), 0);
    }

    #[test]
    fn refresh_repeats_notifies() {
        let mut f = advertised_fixture();

        let delay = f.e.next_wakeup(f.now);
        assert!(delay >= Duration::from_secs(450));
        assert!(delay <= Duration::from_secs(810));

        f.e.wakeup(f.now + delay, &f.s);
        assert!(f.s.contains_notify("http://192.168.100.1/description.xml"));
    }

    #[test]
    fn refresh_not_repeated_early() {
        let mut f = advertised_fixture();

        f.e.wakeup(f.now + Duration::from_secs(60), &f.s);

        assert!(f.s.no_sends());
    }

    #[test]
    fn lost_session_stops_sends() {
        let mut f = Fixture::new_with(|f| {
            f.network(&new_eth0_if());
            f.network(&NEW_ETH0_ADDR);
        });

        assert!(f.e.on_session_lost(&LOCAL_SRC, &f.s));
        assert!(!f.e.on_session_lost(&LOCAL_SRC, &f.s));

        f.e.search("ssdp:all", &f.s);
        assert!(f.s.no_sends());
    }
}
