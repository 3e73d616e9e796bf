use crate::message::Message;
use std::net::{IpAddr, SocketAddr};

/// Incoming SSDP notification, obtained from
/// [`AsyncService::subscribe`](crate::AsyncService::subscribe)
///
/// Sent in response to searches, and when new resources are made
/// available, and periodically otherwise just in case.
///
/// SSDP notification messages are sent both on arrival and on
/// departure of network resources. Arrivals are distinguished from
/// departures by the notification subtype: either "Alive" or
/// "Bye-bye". Answers to our own searches are reported as
/// "SearchResult"; they mean the same as "Alive".
///
/// Only alive resources have a Location field, so this is expressed
/// in the enum.
///
/// The engine does not de-duplicate these notifications -- in other
/// words, a subscriber is likely to receive multiple copies of each.
/// [`DeviceTable`](crate::device_table::DeviceTable) does that job.
///
#[derive(Debug, Clone)]
pub enum Notification {
    /// The resource in question is now active (at this location/URL)
    Alive {
        /// Resource type, e.g. "urn:schemas-upnp-org:service:ContentDirectory:1"
        notification_type: String,

        /// Unique identifier for this particular resource instance
        unique_service_name: String,

        /// URL of the resource (for UPnP, the device description document)
        location: String,

        /// Seconds the announcement remains valid; 0 if not given
        max_age: u32,

        /// Sender of the announcement
        source: SocketAddr,

        /// Our address on which it arrived
        local: IpAddr,

        /// The message as received
        message: Message,
    },

    /// An answer to one of our searches
    SearchResult {
        /// The search target being answered
        notification_type: String,
        unique_service_name: String,
        location: String,
        max_age: u32,
        source: SocketAddr,
        local: IpAddr,
        message: Message,
    },

    /// The resource in question is (becoming) inactive
    ByeBye {
        /// Resource type
        notification_type: String,

        /// Unique identifier for this particular resource instance
        unique_service_name: String,

        source: SocketAddr,
        local: IpAddr,
        message: Message,
    },
}

impl Notification {
    pub fn notification_type(&self) -> &str {
        match self {
            Self::Alive {
                notification_type, ..
            }
            | Self::SearchResult {
                notification_type, ..
            }
            | Self::ByeBye {
                notification_type, ..
            } => notification_type,
        }
    }

    pub fn unique_service_name(&self) -> &str {
        match self {
            Self::Alive {
                unique_service_name,
                ..
            }
            | Self::SearchResult {
                unique_service_name,
                ..
            }
            | Self::ByeBye {
                unique_service_name,
                ..
            } => unique_service_name,
        }
    }

    /// The device part of the USN, without its `uuid:` prefix
    pub fn device_name(&self) -> &str {
        crate::ssdp::device_name(self.unique_service_name())
    }

    /// Our address the notification arrived on
    pub fn local(&self) -> IpAddr {
        match self {
            Self::Alive { local, .. }
            | Self::SearchResult { local, .. }
            | Self::ByeBye { local, .. } => *local,
        }
    }
}

/// Outgoing SSDP announcement, passed to
/// [`AsyncService::advertise`](crate::AsyncService::advertise)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Resource type
    pub notification_type: String,

    /// Resource location
    ///
    /// The host part is replaced by the address of each interface the
    /// advertisement goes out on.
    pub location: url::Url,
}
