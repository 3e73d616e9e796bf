use super::{Error, Syscall};
use crate::netif::InterfaceIndex;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const MAX_PACKET_SIZE: usize = 1500;

/// One datagram, tagged with the session that received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    /// The local address of the session it arrived on
    pub local: IpAddr,
    pub source: SocketAddr,
}

/// What the transport reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Datagram(Datagram),
    /// A receive error closed the session on this local address
    SessionLost(IpAddr),
}

/// The sockets for one local address
struct Session {
    sender: std::net::UdpSocket,
    receivers: Vec<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for r in &self.receivers {
            r.abort();
        }
    }
}

/// Tokio-based SSDP transport: one session per local address
///
/// Joining a multicast group on a local address opens a session: a
/// multicast socket bound to the SSDP port and joined to the group,
/// plus a unicast socket bound to the address itself. Everything that
/// arrives on either is passed up as a [`TransportEvent`]; a receive
/// error closes the session and is reported as
/// [`TransportEvent::SessionLost`].
pub struct Transport {
    port: u16,
    sessions: Mutex<HashMap<IpAddr, Session>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    /// Create a transport listening for multicasts on `port`
    ///
    /// No sockets are opened until a group is joined.
    pub fn new(port: u16) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                port,
                sessions: Mutex::new(HashMap::new()),
                events,
            },
            rx,
        )
    }

    /// The multicast port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether a session is open on `local`
    pub fn has_session(&self, local: &IpAddr) -> bool {
        self.sessions.lock().contains_key(local)
    }

    /// The port of the unicast socket for `local`, if open
    pub fn session_port(&self, local: &IpAddr) -> Option<u16> {
        self.sessions
            .lock()
            .get(local)
            .and_then(|s| s.sender.local_addr().ok())
            .map(|a| a.port())
    }

    /// The addresses with open sessions
    pub fn local_addresses(&self) -> Vec<IpAddr> {
        self.sessions.lock().keys().copied().collect()
    }

    /// Open a session on `local`
    ///
    /// The unicast socket is essential; if only the multicast socket
    /// fails, the session still sends and receives unicast traffic.
    ///
    /// # Errors
    ///
    /// Passes on failures creating or binding the unicast socket.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open_session(
        &self,
        local: &IpAddr,
        interface: InterfaceIndex,
    ) -> Result<(), Error> {
        if self.has_session(local) {
            return Ok(());
        }

        let unicast = super::std::setup_unicast_socket(local, interface)?;
        // Sends go via a duplicate handle, which needs no reactor readiness
        let sender = unicast
            .try_clone()
            .map_err(|e| Error::Syscall(Syscall::Socket, e))?;
        let unicast = Arc::new(
            UdpSocket::from_std(unicast)
                .map_err(|e| Error::Syscall(Syscall::Socket, e))?,
        );
        let mut receivers =
            vec![self.spawn_receiver(unicast.clone(), *local)];

        match super::std::setup_multicast_socket(local, interface, self.port)
            .and_then(|s| {
                UdpSocket::from_std(s)
                    .map_err(|e| Error::Syscall(Syscall::Socket, e))
            }) {
            Ok(multicast) => {
                receivers.push(self.spawn_receiver(Arc::new(multicast), *local));
            }
            Err(e) => {
                warn!("no multicast reception on {local}: {e}");
            }
        }

        debug!("session opened on {local}");
        self.sessions
            .lock()
            .insert(*local, Session { sender, receivers });
        Ok(())
    }

    /// Close the session on `local`; returns whether there was one
    pub fn close_session(&self, local: &IpAddr) -> bool {
        let closed = self.sessions.lock().remove(local).is_some();
        if closed {
            debug!("session closed on {local}");
        }
        closed
    }

    fn spawn_receiver(
        &self,
        socket: Arc<UdpSocket>,
        local: IpAddr,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, source)) => {
                        trace!("{n} bytes from {source} on {local}");
                        let datagram = Datagram {
                            data: buf[..n].to_vec(),
                            local,
                            source,
                        };
                        if events.send(TransportEvent::Datagram(datagram)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "receive failed on {local}: {}",
                            Error::Syscall(Syscall::Recvfrom, e)
                        );
                        let _ = events.send(TransportEvent::SessionLost(local));
                        break;
                    }
                }
            }
        })
    }
}

impl super::TargetedSend for Transport {
    fn send_to(
        &self,
        buffer: &[u8],
        to: &SocketAddr,
        from: &IpAddr,
    ) -> Result<(), Error> {
        let sessions = self.sessions.lock();
        let session = sessions.get(from).ok_or(Error::NoSession(*from))?;
        session
            .sender
            .send_to(buffer, *to)
            .map(|_| ())
            .map_err(|e| Error::Syscall(Syscall::Sendto, e))
    }
}

impl super::Multicast for Transport {
    fn join_multicast_group(
        &self,
        _multicast_address: &IpAddr,
        local: &IpAddr,
        interface: InterfaceIndex,
    ) -> Result<(), Error> {
        self.open_session(local, interface)
    }

    fn leave_multicast_group(
        &self,
        _multicast_address: &IpAddr,
        local: &IpAddr,
        _interface: InterfaceIndex,
    ) -> Result<(), Error> {
        if self.close_session(local) {
            Ok(())
        } else {
            Err(Error::NoSession(*local))
        }
    }
}
