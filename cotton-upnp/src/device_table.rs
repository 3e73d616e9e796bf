//! The table of known devices, and how it changes
//!
//! [`DeviceTable`] does no I/O and keeps no clock: it is told what
//! happened and when, and answers with a list of [`Action`]s for its
//! owner to carry out (fetches to start, timers to arm or cancel,
//! events to publish). [`crate::ControlPoint`] is that owner for
//! Tokio programs.
//!
//! A device is first *resolving* (its description is being fetched),
//! then *active*. It leaves the table on byebye, on expiry of its
//! announced lifetime, or when the interface it was seen on goes away.

use crate::config::Config;
use crate::deferred::SLACK;
use crate::description::Device;
use std::collections::HashMap;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// An SSDP announcement or search result for a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    /// Device name from the USN, without `uuid:`
    pub udn: String,
    pub location: Url,
    pub max_age: u32,
    pub source: SocketAddr,
    pub local: IpAddr,
}

/// Timers a [`DeviceTable`] asks its owner to run
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// The device's announced lifetime is over
    Expiry(String),

    /// The device has stayed at a new location long enough
    SourceChange(String),
}

/// What subscribers to a [`DeviceTable`] are told
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Added(Arc<Device>),

    /// Moved to a new location
    Updated(Arc<Device>),

    /// Said byebye, or its interface went away
    Removed(Arc<Device>),

    /// Not heard from within its lifetime
    Expired(Arc<Device>),

    /// Description or SCPD could not be fetched or understood
    ResolutionFailed {
        udn: String,
        location: Url,
        reason: String,
    },
}

/// What the owner of a [`DeviceTable`] must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Fetch and resolve the description, then report back via
    /// [`DeviceTable::on_resolved`] with this generation
    Fetch {
        udn: String,
        location: Url,
        generation: u64,
    },

    /// Call [`DeviceTable::on_timer`] after `delay`, replacing any
    /// timer already armed for `key`
    ArmTimer { key: TimerKey, delay: Duration },

    CancelTimer(TimerKey),

    /// Start a fresh discovery search
    Search,

    Emit(DeviceEvent),
}

/// How far along a known device is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Resolving,
    Active,
}

/// Where, and via which of our addresses, a device was last seen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub location: Url,
    pub max_age: u32,
    /// Sender of the announcement
    pub source: SocketAddr,
    /// Our address it arrived on
    pub local: IpAddr,
}

impl From<Sighting> for Endpoint {
    fn from(s: Sighting) -> Self {
        Self {
            location: s.location,
            max_age: s.max_age,
            source: s.source,
            local: s.local,
        }
    }
}

struct Record {
    current: Endpoint,
    last_notify: Instant,
    generation: u64,
    device: Option<Arc<Device>>,
    expires_at: Option<Instant>,

    /// Staged move, and when it takes effect
    pending: Option<(Endpoint, Instant)>,
}

/// Known devices, keyed by UDN (without `uuid:`)
pub struct DeviceTable {
    records: HashMap<String, Record>,
    next_generation: u64,
    ttl_floor: Duration,
    debounce: Duration,
    anti_flap: Duration,
}

/// Has a timer due at `due` fired by `now`?
///
/// Timers may fire up to [`SLACK`] early.
fn fired(due: Instant, now: Instant) -> bool {
    now + SLACK >= due
}

/// How long to believe an announcement with this `max-age`
fn lifetime(max_age: u32, floor: Duration) -> Duration {
    Duration::from_secs(u64::from(max_age)).max(floor)
}

impl DeviceTable {
    /// An empty table, with timings from `config`
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            records: HashMap::new(),
            next_generation: 0,
            ttl_floor: config.ttl_floor(),
            debounce: config.source_change_debounce(),
            anti_flap: config.anti_flap_guard(),
        }
    }

    /// A device announced itself, or answered a search
    pub fn on_alive(&mut self, sighting: Sighting, now: Instant) -> Vec<Action> {
        let ttl = lifetime(sighting.max_age, self.ttl_floor);
        let udn = sighting.udn.clone();

        let Some(r) = self.records.get_mut(&udn) else {
            let generation = self.next_generation;
            self.next_generation += 1;
            debug!("resolving {udn} at {}", sighting.location);
            let location = sighting.location.clone();
            self.records.insert(
                udn.clone(),
                Record {
                    current: sighting.into(),
                    last_notify: now,
                    generation,
                    device: None,
                    expires_at: None,
                    pending: None,
                },
            );
            return vec![Action::Fetch {
                udn,
                location,
                generation,
            }];
        };

        if r.device.is_none() {
            // Fetch in flight; just note that it's still there
            if r.current.location == sighting.location {
                r.current = sighting.into();
                r.last_notify = now;
            }
            return Vec::new();
        }

        if r.current.location == sighting.location {
            r.current = sighting.into();
            r.last_notify = now;
            r.expires_at = Some(now + ttl);
            let mut actions = vec![Action::ArmTimer {
                key: TimerKey::Expiry(udn.clone()),
                delay: ttl,
            }];
            if r.pending.take().is_some() {
                debug!("{udn} back at original location");
                actions.push(Action::CancelTimer(TimerKey::SourceChange(udn)));
            }
            return actions;
        }

        if now.saturating_duration_since(r.last_notify) <= self.anti_flap {
            trace!("{udn} also at {}, ignoring", sighting.location);
            return Vec::new();
        }

        if let Some((pending, _)) = &r.pending {
            if pending.location == sighting.location {
                return Vec::new();
            }
        }

        debug!(
            "{udn} may have moved from {} to {}",
            r.current.location, sighting.location
        );
        r.pending = Some((sighting.into(), now + self.debounce));
        vec![Action::ArmTimer {
            key: TimerKey::SourceChange(udn),
            delay: self.debounce,
        }]
    }

    /// A device said byebye
    pub fn on_byebye(&mut self, udn: &str) -> Vec<Action> {
        let Some(r) = self.records.remove(udn) else {
            return Vec::new();
        };
        let mut actions = vec![
            Action::CancelTimer(TimerKey::Expiry(udn.to_string())),
            Action::CancelTimer(TimerKey::SourceChange(udn.to_string())),
        ];
        if let Some(device) = r.device {
            info!("{udn} removed");
            actions.push(Action::Emit(DeviceEvent::Removed(device)));
        }
        actions
    }

    /// A fetch started by [`Action::Fetch`] has finished
    ///
    /// Results for devices no longer resolving, or from an older
    /// generation, are discarded.
    pub fn on_resolved<E: Display>(
        &mut self,
        udn: &str,
        generation: u64,
        result: Result<Device, E>,
        now: Instant,
    ) -> Vec<Action> {
        let Some(r) = self.records.get_mut(udn) else {
            debug!("{udn} gone before resolution finished");
            return Vec::new();
        };
        if r.generation != generation {
            debug!("stale resolution for {udn}");
            return Vec::new();
        }
        if r.device.is_some() {
            error!("{udn} resolved again while active");
            return Vec::new();
        }

        let location = r.current.location.clone();
        let reason = match result {
            Ok(device) if device.device_name() == udn => {
                let ttl = lifetime(r.current.max_age, self.ttl_floor);
                let device = Arc::new(device);
                r.device = Some(device.clone());
                r.expires_at = Some(now + ttl);
                info!("{udn} added: {}", device.friendly_name);
                return vec![
                    Action::ArmTimer {
                        key: TimerKey::Expiry(udn.to_string()),
                        delay: ttl,
                    },
                    Action::Emit(DeviceEvent::Added(device)),
                ];
            }
            Ok(device) => {
                error!(
                    "{location} describes {} not {udn}",
                    device.device_name()
                );
                format!("description is for {}", device.udn)
            }
            Err(e) => {
                warn!("cannot resolve {udn}: {e}");
                e.to_string()
            }
        };
        self.records.remove(udn);
        vec![Action::Emit(DeviceEvent::ResolutionFailed {
            udn: udn.to_string(),
            location,
            reason,
        })]
    }

    /// A timer armed by [`Action::ArmTimer`] has fired
    ///
    /// Timers which have since been re-armed or cancelled are ignored.
    pub fn on_timer(&mut self, key: &TimerKey, now: Instant) -> Vec<Action> {
        match key {
            TimerKey::Expiry(udn) => self.on_expiry(udn, now),
            TimerKey::SourceChange(udn) => self.on_source_change(udn, now),
        }
    }

    fn on_expiry(&mut self, udn: &str, now: Instant) -> Vec<Action> {
        match self.records.get(udn).and_then(|r| r.expires_at) {
            Some(t) if fired(t, now) => {}
            _ => return Vec::new(),
        }
        let Some(r) = self.records.remove(udn) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        if r.pending.is_some() {
            actions.push(Action::CancelTimer(TimerKey::SourceChange(
                udn.to_string(),
            )));
        }
        if let Some(device) = r.device {
            info!("{udn} expired");
            actions.push(Action::Emit(DeviceEvent::Expired(device)));
        }
        actions
    }

    fn on_source_change(&mut self, udn: &str, now: Instant) -> Vec<Action> {
        let ttl_floor = self.ttl_floor;
        let Some(r) = self.records.get_mut(udn) else {
            return Vec::new();
        };
        match &r.pending {
            Some((_, due)) if fired(*due, now) => {}
            _ => return Vec::new(),
        }
        let (Some((endpoint, _)), Some(device)) = (r.pending.take(), &r.device)
        else {
            return Vec::new();
        };

        info!("{udn} moved to {}", endpoint.location);
        let ttl = lifetime(endpoint.max_age, ttl_floor);
        let device = Arc::new(device.relocated(&endpoint.location));
        r.device = Some(device.clone());
        r.current = endpoint;
        r.last_notify = now;
        r.expires_at = Some(now + ttl);
        vec![
            Action::ArmTimer {
                key: TimerKey::Expiry(udn.to_string()),
                delay: ttl,
            },
            Action::Emit(DeviceEvent::Updated(device)),
        ]
    }

    /// One of our addresses has gone away
    ///
    /// Every device last seen through it is dropped, and a new search
    /// is asked for in case they are still reachable some other way.
    pub fn on_interface_lost(&mut self, local: &IpAddr) -> Vec<Action> {
        let lost: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.current.local == *local)
            .map(|(udn, _)| udn.clone())
            .collect();
        let mut actions = Vec::new();
        for udn in lost {
            actions.extend(self.on_byebye(&udn));
        }
        actions.push(Action::Search);
        actions
    }

    /// An active device
    pub fn get(&self, udn: &str) -> Option<Arc<Device>> {
        self.records.get(udn).and_then(|r| r.device.clone())
    }

    /// All active devices
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.records
            .values()
            .filter_map(|r| r.device.clone())
            .collect()
    }

    /// Whether a device is resolving or active, if known at all
    pub fn state(&self, udn: &str) -> Option<DeviceState> {
        self.records.get(udn).map(|r| match r.device {
            Some(_) => DeviceState::Active,
            None => DeviceState::Resolving,
        })
    }

    /// Where the device is currently believed to be
    pub fn location(&self, udn: &str) -> Option<&Url> {
        self.records.get(udn).map(|r| &r.current.location)
    }

    /// The endpoint in use for `udn`, resolving or active
    pub fn endpoint(&self, udn: &str) -> Option<&Endpoint> {
        self.records.get(udn).map(|r| &r.current)
    }

    /// Where the device may be moving to
    pub fn pending_location(&self, udn: &str) -> Option<&Url> {
        self.records
            .get(udn)
            .and_then(|r| r.pending.as_ref())
            .map(|(e, _)| &e.location)
    }

    /// Number of devices, resolving or active
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no devices are known
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
