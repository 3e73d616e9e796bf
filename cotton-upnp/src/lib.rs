//! Implementing UPnP discovery: SSDP, and a control point on top of it
//!
//! The cotton-upnp crate encapsulates a client and server for the
//! Simple Service Discovery Protocol (SSDP), a mechanism for
//! discovering available resources on local networks. What is
//! advertised, or discovered, is, for each resource, a unique
//! identifier (Unique Service Name, USN), an identifier for the type
//! of resource (Notification Type, NT), and the location of the
//! resource in the form of a URL.
//!
//! SSDP is mainly used by UPnP (Universal Plug-'n'-Play) systems,
//! such as for media libraries and local streaming of music and video
//! -- but the mechanism is quite generic, and could as easily be used
//! for any type of device or resource that must be discoverable over
//! a network, including in ad hoc settings which don't necessarily
//! have expert network administrators close at hand.
//!
//! The crate is layered:
//!
//!  - [`message`] parses and emits the HTTP-style messages SSDP
//!    uses, and [`ssdp`] gives them SSDP meaning;
//!  - [`Engine`] is the protocol state machine, with no sockets or
//!    clocks of its own, for use with a custom polling loop;
//!  - [`AsyncService`] wraps an `Engine` with per-address UDP
//!    sessions ([`udp::tokio`]) and interface watching ([`netif`])
//!    using the Tokio crate, and can both discover other devices
//!    ([`AsyncService::subscribe`]) and advertise resources itself
//!    ([`AsyncService::advertise`]);
//!  - [`ControlPoint`] follows the devices an `AsyncService` finds,
//!    fetching their descriptions and noticing when they move or
//!    disappear.
//!
//! The crate logs using `tracing`, but never installs a subscriber.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod async_service;
pub mod config;
pub mod control_point;
pub mod deferred;
pub mod description;
pub mod device_table;
pub mod engine;
pub mod escape;
pub mod event;
pub mod fetch;
pub mod message;
pub mod netif;
pub mod refresh_timer;
pub mod ssdp;
pub mod udp;

pub use async_service::AsyncService;
pub use config::Config;
pub use control_point::ControlPoint;
pub use device_table::DeviceEvent;
pub use engine::{Callback, Engine};
pub use event::{Advertisement, Notification};
