//! Tracking the devices on the network
//!
//! A [`ControlPoint`] drives a [`DeviceTable`] from SSDP
//! notifications, fetching each new device's description and the SCPD
//! documents of all its services before announcing it to subscribers.

use crate::async_service::AsyncService;
use crate::config::Config;
use crate::deferred::DeferredCallbackSet;
use crate::description::{self, DescriptionError, Device};
use crate::device_table::{
    Action, DeviceEvent, DeviceState, DeviceTable, Endpoint, Sighting,
    TimerKey,
};
use crate::event::Notification;
use crate::fetch::{FetchError, Fetcher};
use crate::ssdp;
use futures::Stream;
use futures_util::future::try_join_all;
use futures_util::StreamExt;
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

/// Something which can send SSDP searches
///
/// Implemented by [`AsyncService`]; tests substitute their own.
pub trait Searcher: Send + Sync {
    fn search(&self, target: &str);
}

/// Why a device could not be resolved
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ResolveError {
    #[error("fetching {0}: {1}")]
    Fetch(Url, #[source] FetchError),

    #[error("reading {0}: {1}")]
    Description(Url, #[source] DescriptionError),
}

slotmap::new_key_type! { pub struct SubscriptionKey; }

/// A stream of [`DeviceEvent`]s, from [`ControlPoint::subscribe`]
pub struct Subscription {
    key: SubscriptionKey,
    receiver: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl Subscription {
    /// For passing to [`ControlPoint::unsubscribe`]
    pub fn key(&self) -> SubscriptionKey {
        self.key
    }
}

impl Stream for Subscription {
    type Item = DeviceEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<DeviceEvent>> {
        self.receiver.poll_recv(cx)
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Fetch a description, then every SCPD it mentions
///
/// Any single failure fails the lot.
async fn resolve(
    fetcher: &dyn Fetcher,
    location: &Url,
) -> Result<Device, ResolveError> {
    let body = fetcher
        .get(location)
        .await
        .map_err(|e| ResolveError::Fetch(location.clone(), e))?;
    let mut device = description::parse_description(&body, location)
        .map_err(|e| ResolveError::Description(location.clone(), e))?;

    let urls: Vec<Url> = device
        .all_services()
        .iter()
        .map(|s| s.scpd_url.clone())
        .collect();
    let scpds = try_join_all(urls.iter().map(|url| async move {
        let body = fetcher
            .get(url)
            .await
            .map_err(|e| ResolveError::Fetch(url.clone(), e))?;
        description::parse_scpd(&body)
            .map_err(|e| ResolveError::Description(url.clone(), e))
    }))
    .await?;

    let mut scpds = scpds.into_iter();
    device.for_each_service_mut(&mut |s| s.scpd = scpds.next());
    Ok(device)
}

struct Inner {
    table: Mutex<DeviceTable>,
    timers: DeferredCallbackSet<TimerKey>,
    fetcher: Arc<dyn Fetcher>,
    searcher: Arc<dyn Searcher>,
    subscribers: Mutex<SlotMap<SubscriptionKey, mpsc::UnboundedSender<DeviceEvent>>>,
    search_target: String,
}

impl Inner {
    /// Change the table, and carry out what it asks for
    ///
    /// Everything but searching happens with the table still locked,
    /// so subscribers see each device's events in the order the table
    /// changed. Sending events, arming timers and spawning fetches
    /// never block. Searches go out after the lock is released.
    fn update<F>(self: &Arc<Self>, change: F)
    where
        F: FnOnce(&mut DeviceTable) -> Vec<Action>,
    {
        let mut search = false;
        {
            let mut table = self.table.lock();
            for action in change(&mut table) {
                match action {
                    Action::Fetch {
                        udn,
                        location,
                        generation,
                    } => self.spawn_fetch(udn, location, generation),
                    Action::ArmTimer { key, delay } => {
                        self.timers.schedule(key, delay);
                    }
                    Action::CancelTimer(key) => {
                        self.timers.cancel(&key);
                    }
                    Action::Search => search = true,
                    Action::Emit(event) => self.emit(&event),
                }
            }
        }
        if search {
            self.searcher.search(&self.search_target);
        }
    }

    fn spawn_fetch(self: &Arc<Self>, udn: String, location: Url, generation: u64) {
        let weak = Arc::downgrade(self);
        let fetcher = self.fetcher.clone();
        tokio::spawn(async move {
            let result = resolve(fetcher.as_ref(), &location).await;
            if let Some(inner) = weak.upgrade() {
                inner.update(|t| t.on_resolved(&udn, generation, result, now()));
            }
        });
    }

    fn emit(&self, event: &DeviceEvent) {
        trace!("device event {event:?}");
        self.subscribers
            .lock()
            .retain(|_, s| s.send(event.clone()).is_ok());
    }

    fn on_timer(self: &Arc<Self>, key: &TimerKey) {
        self.update(|t| t.on_timer(key, now()));
    }

    fn on_notification(self: &Arc<Self>, notification: &Notification) {
        match notification {
            Notification::Alive {
                unique_service_name,
                location,
                max_age,
                source,
                local,
                ..
            }
            | Notification::SearchResult {
                unique_service_name,
                location,
                max_age,
                source,
                local,
                ..
            } => {
                let location = match Url::parse(location) {
                    Ok(url) => url,
                    Err(e) => {
                        debug!("bad location {location:?} from {source}: {e}");
                        return;
                    }
                };
                let sighting = Sighting {
                    udn: ssdp::device_name(unique_service_name).to_string(),
                    location,
                    max_age: *max_age,
                    source: *source,
                    local: *local,
                };
                self.update(|t| t.on_alive(sighting, now()));
            }
            Notification::ByeBye {
                unique_service_name,
                ..
            } => {
                let udn = ssdp::device_name(unique_service_name);
                self.update(|t| t.on_byebye(udn));
            }
        }
    }

    fn on_interface_lost(self: &Arc<Self>, local: &IpAddr) {
        self.update(|t| t.on_interface_lost(local));
    }
}

/// Discovers devices, and keeps track of which are still there
///
/// Clones share the same table.
#[derive(Clone)]
pub struct ControlPoint {
    inner: Arc<Inner>,
}

impl ControlPoint {
    /// A control point fed by hand, via [`ControlPoint::on_notification`]
    /// and [`ControlPoint::on_interface_lost`]
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        searcher: Arc<dyn Searcher>,
        fetcher: Arc<dyn Fetcher>,
        config: &Config,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            Inner {
                table: Mutex::new(DeviceTable::new(config)),
                timers: DeferredCallbackSet::new(move |key| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_timer(&key);
                    }
                }),
                fetcher,
                searcher,
                subscribers: Mutex::new(SlotMap::with_key()),
                search_target: config.search_target.clone(),
            }
        });
        Self { inner }
    }

    /// A control point listening to `service`
    ///
    /// Subscribes to [`Config::search_target`], which also sends the
    /// first search.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        service: &AsyncService,
        fetcher: Arc<dyn Fetcher>,
        config: &Config,
    ) -> Self {
        let cp = Self::new(Arc::new(service.clone()), fetcher, config);
        let mut losses = Box::pin(service.interface_losses());
        let mut notifications =
            Box::pin(service.subscribe(config.search_target.clone()));
        let weak = Arc::downgrade(&cp.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    n = notifications.next() => {
                        let (Some(n), Some(inner)) = (n, weak.upgrade()) else {
                            break;
                        };
                        inner.on_notification(&n);
                    }
                    l = losses.next() => {
                        let (Some(l), Some(inner)) = (l, weak.upgrade()) else {
                            break;
                        };
                        inner.on_interface_lost(&l);
                    }
                }
            }
            debug!("control point stopped");
        });
        cp
    }

    /// Feed in an SSDP notification
    pub fn on_notification(&self, notification: &Notification) {
        self.inner.on_notification(notification);
    }

    /// One of our local addresses has gone away
    pub fn on_interface_lost(&self, local: &IpAddr) {
        self.inner.on_interface_lost(local);
    }

    /// Receive all device events from now on
    pub fn subscribe(&self) -> Subscription {
        let (snd, receiver) = mpsc::unbounded_channel();
        let key = self.inner.subscribers.lock().insert(snd);
        Subscription { key, receiver }
    }

    /// Stop sending events to a subscription
    ///
    /// Dropping the [`Subscription`] does the same, eventually.
    pub fn unsubscribe(&self, key: SubscriptionKey) -> bool {
        self.inner.subscribers.lock().remove(key).is_some()
    }

    /// Search again
    pub fn search(&self) {
        self.inner.searcher.search(&self.inner.search_target);
    }

    /// The active devices
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.inner.table.lock().devices()
    }

    /// An active device, by UDN (with or without `uuid:`)
    pub fn device(&self, udn: &str) -> Option<Arc<Device>> {
        self.inner.table.lock().get(ssdp::device_name(udn))
    }

    /// Whether a device is resolving or active, if known at all
    pub fn state(&self, udn: &str) -> Option<DeviceState> {
        self.inner.table.lock().state(ssdp::device_name(udn))
    }

    /// Where a known device was last seen, and via which of our addresses
    pub fn endpoint(&self, udn: &str) -> Option<Endpoint> {
        self.inner
            .table
            .lock()
            .endpoint(ssdp::device_name(udn))
            .cloned()
    }
}
