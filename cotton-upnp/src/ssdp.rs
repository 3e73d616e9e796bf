//! SSDP meaning layered on top of the [`crate::message`] codec
//!
//! Classifies an incoming datagram as an announcement, a search or a
//! search response, and builds the corresponding outgoing messages.

use crate::message;

/// Default multicast port for SSDP
pub const SSDP_PORT: u16 = 1900;

/// Search target matching every resource
pub const SSDP_ALL: &str = "ssdp:all";

/// Our SERVER header, also sent as the HTTP user agent
pub const SERVER: &str = concat!(
    "none/0 UPnP/1.1 ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION")
);

/// An SSDP message, classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `NOTIFY` with `NTS: ssdp:alive`
    NotifyAlive {
        notification_type: String,
        unique_service_name: String,
        location: String,
        max_age: u32,
    },

    /// `NOTIFY` with `NTS: ssdp:byebye`
    NotifyByeBye {
        notification_type: String,
        unique_service_name: String,
    },

    /// A well-formed `M-SEARCH`
    Search {
        search_target: String,
        maximum_wait_sec: u32,
    },

    /// A `200 OK` answer to one of our searches
    Response {
        search_target: String,
        unique_service_name: String,
        location: String,
        max_age: u32,
    },
}

/// Why a datagram was not a usable SSDP message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("malformed message: {0}")]
    Malformed(#[from] message::Error),

    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("invalid search request: {0}")]
    InvalidSearch(&'static str),

    #[error("not an SSDP message")]
    Unrecognised,
}

/// Extract the device identifier from a USN
///
/// `uuid:abc::upnp:rootdevice` becomes `abc`: the part before any `::`,
/// with its scheme prefix removed.
pub fn device_name(unique_service_name: &str) -> &str {
    let head = match unique_service_name.split_once("::") {
        Some((head, _)) => head,
        None => unique_service_name,
    };
    let head = head.trim();
    match head.split_once(':') {
        Some((_, rest)) => rest,
        None => head,
    }
}

/// The part of a USN after `::`, if any
pub fn usn_suffix(unique_service_name: &str) -> Option<&str> {
    unique_service_name
        .split_once("::")
        .map(|(_, tail)| tail.trim())
}

/// The `max-age` directive of a Cache-Control header; 0 if absent or bad
pub fn max_age(cache_control: Option<&str>) -> u32 {
    let Some(cache_control) = cache_control else {
        return 0;
    };
    for directive in cache_control.split(',') {
        if let Some((name, value)) = directive.split_once('=') {
            if name.trim().eq_ignore_ascii_case("max-age") {
                return value.trim().trim_matches('"').parse().unwrap_or(0);
            }
        }
    }
    0
}

/// Does a search for `search` find a resource of type `candidate`?
///
/// Exact matches and `ssdp:all` always succeed. Versioned types match
/// equal-or-newer versions, so a search for `ContentDirectory:1` finds a
/// `ContentDirectory:2` but not vice versa (UPnP DA 1.0 s1.2.3).
pub fn target_match(search: &str, candidate: &str) -> bool {
    if search == SSDP_ALL {
        return true;
    }
    if search == candidate {
        return true;
    }
    if let Some((sbase, sversion)) = search.rsplit_once(':') {
        if let Some((cbase, cversion)) = candidate.rsplit_once(':') {
            if sbase == cbase {
                if let Ok(sversion) = sversion.parse::<usize>() {
                    if let Ok(cversion) = cversion.parse::<usize>() {
                        return cversion >= sversion;
                    }
                }
            }
        }
    }
    false
}

fn required<'a>(
    m: &'a message::Message,
    name: &'static str,
) -> Result<&'a str, Error> {
    m.header(name).ok_or(Error::MissingHeader(name))
}

fn classify_notify(m: &message::Message) -> Result<Message, Error> {
    let nts = required(m, "NTS")?;
    let unique_service_name = required(m, "USN")?.to_string();
    let notification_type = m
        .header("NT")
        .or_else(|| usn_suffix(&unique_service_name))
        .unwrap_or_default()
        .to_string();

    match nts {
        "ssdp:alive" => Ok(Message::NotifyAlive {
            notification_type,
            location: required(m, "LOCATION")?.to_string(),
            max_age: max_age(m.header("CACHE-CONTROL")),
            unique_service_name,
        }),
        "ssdp:byebye" => Ok(Message::NotifyByeBye {
            notification_type,
            unique_service_name,
        }),
        _ => Err(Error::Unrecognised),
    }
}

fn classify_search(m: &message::Message) -> Result<Message, Error> {
    if m.header("MAN") != Some("\"ssdp:discover\"") {
        return Err(Error::InvalidSearch("MAN is not \"ssdp:discover\""));
    }
    if m.target() != Some("*") {
        return Err(Error::InvalidSearch("target is not *"));
    }
    match m.version_number() {
        Some(v) if v >= (1, 1) => {}
        _ => return Err(Error::InvalidSearch("version older than 1.1")),
    }
    let maximum_wait_sec = m
        .header("MX")
        .and_then(|mx| mx.trim().parse::<u32>().ok())
        .filter(|mx| *mx > 0)
        .ok_or(Error::InvalidSearch("MX missing or not positive"))?;
    Ok(Message::Search {
        search_target: required(m, "ST")?.to_string(),
        maximum_wait_sec,
    })
}

fn classify_response(m: &message::Message) -> Result<Message, Error> {
    if m.status_code() != Some(200) {
        return Err(Error::Unrecognised);
    }
    let unique_service_name = required(m, "USN")?.to_string();
    let search_target = m
        .header("ST")
        .or_else(|| usn_suffix(&unique_service_name))
        .unwrap_or_default()
        .to_string();
    Ok(Message::Response {
        search_target,
        location: required(m, "LOCATION")?.to_string(),
        max_age: max_age(m.header("CACHE-CONTROL")),
        unique_service_name,
    })
}

/// Give SSDP meaning to a parsed HTTP-style message
pub fn classify(m: &message::Message) -> Result<Message, Error> {
    match m.method() {
        Some("NOTIFY") => classify_notify(m),
        Some("M-SEARCH") => classify_search(m),
        Some(_) => Err(Error::Unrecognised),
        None => classify_response(m),
    }
}

/// Parse and classify a datagram in one go
pub fn parse(buf: &[u8]) -> Result<Message, Error> {
    classify(&message::parse(buf)?)
}

fn ssdp_message(mut m: message::Message) -> message::Message {
    m.set_compute_content_length(false);
    m
}

/// A multicast `M-SEARCH`
///
/// `host` is the multicast group as it should appear in the HOST
/// header, e.g. `239.255.255.250:1900`.
pub fn build_search(
    host: &str,
    search_target: &str,
    maximum_wait_sec: u32,
) -> message::Message {
    let mut m = ssdp_message(message::Message::request("M-SEARCH", "*"));
    m.set_header("HOST", host);
    m.set_header("MAN", "\"ssdp:discover\"");
    m.set_header("MX", maximum_wait_sec.to_string());
    m.set_header("ST", search_target);
    m
}

/// A unicast answer to a search
pub fn build_response(
    search_target: &str,
    unique_service_name: &str,
    location: &str,
    max_age: u32,
) -> message::Message {
    let mut m = ssdp_message(message::Message::response(200, "OK"));
    m.set_header("CACHE-CONTROL", format!("max-age={max_age}"));
    m.set_header("EXT", "");
    m.set_header("ST", search_target);
    m.set_header("USN", unique_service_name);
    m.set_header("LOCATION", location);
    m.set_header("SERVER", SERVER);
    m
}

/// An `ssdp:alive` announcement
pub fn build_notify(
    host: &str,
    notification_type: &str,
    unique_service_name: &str,
    location: &str,
    max_age: u32,
) -> message::Message {
    let mut m = ssdp_message(message::Message::request("NOTIFY", "*"));
    m.set_header("HOST", host);
    m.set_header("CACHE-CONTROL", format!("max-age={max_age}"));
    m.set_header("LOCATION", location);
    m.set_header("NT", notification_type);
    m.set_header("NTS", "ssdp:alive");
    m.set_header("USN", unique_service_name);
    m.set_header("SERVER", SERVER);
    m
}

/// An `ssdp:byebye` withdrawal
pub fn build_byebye(
    host: &str,
    notification_type: &str,
    unique_service_name: &str,
) -> message::Message {
    let mut m = ssdp_message(message::Message::request("NOTIFY", "*"));
    m.set_header("HOST", host);
    m.set_header("NT", notification_type);
    m.set_header("NTS", "ssdp:byebye");
    m.set_header("USN", unique_service_name);
    m.set_header("SERVER", SERVER);
    m
}
