use crate::config::{Config, ConfigError};
use crate::control_point::Searcher;
use crate::engine::{Callback, Engine};
use crate::netif::{self, NetworkEvent};
use crate::udp::tokio::{Transport, TransportEvent};
use crate::{Advertisement, Notification};
use futures::Stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::{debug, info};

struct AsyncCallback {
    channel: mpsc::Sender<Notification>,
}

impl Callback for AsyncCallback {
    fn on_notification(&self, n: &Notification) {
        let _ = self.channel.try_send(n.clone());
    }

    fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

struct Inner {
    engine: Mutex<Engine<AsyncCallback>>,
    transport: Transport,
    loss_watchers: Mutex<Vec<mpsc::UnboundedSender<IpAddr>>>,
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl Inner {
    fn on_network_event(&self, event: &NetworkEvent) {
        let lost = self
            .engine
            .lock()
            .on_network_event(event, &self.transport);
        for local in lost {
            self.report_loss(local);
        }
    }

    fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Datagram(d) => {
                self.engine.lock().on_data(
                    &d.data,
                    d.local,
                    d.source,
                    now(),
                );
            }
            TransportEvent::SessionLost(local) => {
                let closed = self
                    .engine
                    .lock()
                    .on_session_lost(&local, &self.transport);
                if closed {
                    self.report_loss(local);
                }
            }
        }
    }

    fn report_loss(&self, local: IpAddr) {
        info!("lost SSDP session on {local}");
        self.loss_watchers
            .lock()
            .retain(|w| w.send(local).is_ok());
    }

    async fn run<S>(
        self: Arc<Self>,
        mut network: S,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) where
        S: Stream<Item = NetworkEvent> + Unpin,
    {
        let mut network_open = true;
        loop {
            let delay = self.engine.lock().next_wakeup(now());
            tokio::select! {
                e = network.next(), if network_open => match e {
                    Some(event) => self.on_network_event(&event),
                    None => {
                        debug!("network event stream ended");
                        network_open = false;
                    }
                },
                e = transport_events.recv() => match e {
                    Some(event) => self.on_transport_event(event),
                    None => break,
                },
                () = tokio::time::sleep(delay) => {
                    self.engine.lock().wakeup(now(), &self.transport);
                },
            }
        }
    }
}

struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// High-level asynchronous SSDP service using tokio.
///
/// Handles incoming and outgoing searches using `async`, `await`, and the
/// Tokio crate.
///
/// Clones share one service; the background task stops when the last
/// clone is dropped.
///
#[derive(Clone)]
pub struct AsyncService {
    inner: Arc<Inner>,
    _task: Arc<TaskGuard>,
}

impl AsyncService {
    /// Create a new `AsyncService`, watching the host's network interfaces
    ///
    /// Interfaces are polled every
    /// [`Config::interface_poll_interval_secs`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the configuration is unusable.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    ///
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Self::with_network_events(
            config,
            netif::watch(config.interface_poll_interval()),
        )
    }

    /// Create a new `AsyncService`, fed by the given interface events
    ///
    /// For hosts whose interfaces are managed some other way, and for
    /// tests.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the configuration is unusable.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    ///
    pub fn with_network_events<S>(
        config: &Config,
        network: S,
    ) -> Result<Self, ConfigError>
    where
        S: Stream<Item = NetworkEvent> + Send + 'static,
    {
        config.validate()?;
        let (transport, transport_events) = Transport::new(config.ssdp_port);
        let inner = Arc::new(Inner {
            engine: Mutex::new(Engine::new(config, rand::random(), now())),
            transport,
            loss_watchers: Mutex::new(Vec::new()),
        });
        let task = tokio::spawn(
            inner.clone().run(Box::pin(network), transport_events),
        );
        Ok(AsyncService {
            inner,
            _task: Arc::new(TaskGuard(task)),
        })
    }

    /// Subscribe to SSDP notifications for a resource type.
    ///
    /// Also sends searches for it. Dropping the stream ends the
    /// subscription.
    ///
    pub fn subscribe<A>(
        &self,
        notification_type: A,
    ) -> impl Stream<Item = Notification>
    where
        A: Into<String>,
    {
        let (snd, rcv) = mpsc::channel(100);
        self.inner.engine.lock().subscribe(
            notification_type.into(),
            AsyncCallback { channel: snd },
            &self.inner.transport,
        );
        ReceiverStream::new(rcv)
    }

    /// Search again for a resource type
    ///
    /// Answers go to existing subscribers.
    pub fn search(&self, search_type: &str) {
        self.inner
            .engine
            .lock()
            .search(search_type, &self.inner.transport);
    }

    /// Announce a new resource
    ///
    /// And start responding to any searches matching it.
    ///
    pub fn advertise<USN>(
        &self,
        unique_service_name: USN,
        advertisement: Advertisement,
    ) where
        USN: Into<String>,
    {
        self.inner.engine.lock().advertise(
            unique_service_name.into(),
            advertisement,
            &self.inner.transport,
        );
    }

    /// Announce the disappearance of a resource
    ///
    /// And stop responding to searches.
    ///
    pub fn deadvertise(&self, unique_service_name: &str) {
        self.inner
            .engine
            .lock()
            .deadvertise(unique_service_name, &self.inner.transport);
    }

    /// Feed in an interface change directly
    pub fn on_network_event(&self, event: &NetworkEvent) {
        self.inner.on_network_event(event);
    }

    /// Local addresses whose sessions close from now on
    pub fn interface_losses(&self) -> impl Stream<Item = IpAddr> {
        let (snd, rcv) = mpsc::unbounded_channel();
        self.inner.loss_watchers.lock().push(snd);
        UnboundedReceiverStream::new(rcv)
    }

    /// The local addresses with open sessions
    pub fn local_addresses(&self) -> Vec<IpAddr> {
        self.inner.engine.lock().local_addresses()
    }

    /// The port our unicast traffic on `local` goes from
    pub fn session_port(&self, local: &IpAddr) -> Option<u16> {
        self.inner.transport.session_port(local)
    }
}

impl Searcher for AsyncService {
    fn search(&self, target: &str) {
        AsyncService::search(self, target);
    }
}
