//! UPnP device and service descriptions
//!
//! Only the parts needed to identify a device and find its services
//! are extracted; everything else in the XML is ignored.

use url::Url;
use xmltree::{Element, XMLNode};

/// Errors extracting a description
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DescriptionError {
    #[error("XML parse error: {0}")]
    Xml(#[from] xmltree::ParseError),

    #[error("missing <{0}> element")]
    Missing(&'static str),

    #[error("bad URL {0:?}: {1}")]
    Url(String, #[source] url::ParseError),
}

/// What a service's SCPD document says it can do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scpd {
    pub actions: Vec<String>,
    pub state_variables: Vec<String>,
}

/// A service offered by a [`Device`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub service_type: String,
    pub service_id: String,

    /// Where the SCPD document lives
    pub scpd_url: Url,
    pub control_url: Url,
    pub event_sub_url: Url,

    /// The SCPD, once fetched
    pub scpd: Option<Scpd>,
}

/// A device, as described by the document at its SSDP `LOCATION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Unique Device Name, e.g. `uuid:5b2a...`
    pub udn: String,
    pub device_type: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_name: String,
    pub model_number: String,
    pub serial_number: String,
    pub presentation_url: Option<Url>,

    /// The description document's own URL
    pub location: Url,

    pub services: Vec<Service>,

    /// Embedded devices
    pub devices: Vec<Device>,
}

fn children(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(e) => Some(e),
        _ => None,
    })
}

fn child_text(element: &Element, name: &str) -> Option<String> {
    children(element)
        .find(|child| child.name == name)
        .and_then(|child| child.get_text())
        .map(|text| text.trim().to_string())
}

fn list<'a>(
    element: &'a Element,
    list_name: &str,
    item_name: &'a str,
) -> impl Iterator<Item = &'a Element> {
    element
        .get_child(list_name)
        .into_iter()
        .flat_map(move |l| children(l).filter(move |e| e.name == item_name))
}

fn resolve(base: &Url, raw: &str) -> Result<Url, DescriptionError> {
    base.join(raw)
        .map_err(|e| DescriptionError::Url(raw.to_string(), e))
}

fn parse_service(
    element: &Element,
    base: &Url,
) -> Result<Service, DescriptionError> {
    let url = |name: &'static str| -> Result<Url, DescriptionError> {
        let raw = child_text(element, name)
            .ok_or(DescriptionError::Missing(name))?;
        resolve(base, &raw)
    };
    Ok(Service {
        service_type: child_text(element, "serviceType")
            .ok_or(DescriptionError::Missing("serviceType"))?,
        service_id: child_text(element, "serviceId").unwrap_or_default(),
        scpd_url: url("SCPDURL")?,
        control_url: url("controlURL")?,
        event_sub_url: url("eventSubURL")?,
        scpd: None,
    })
}

fn parse_device(
    element: &Element,
    base: &Url,
    location: &Url,
) -> Result<Device, DescriptionError> {
    let text = |name| child_text(element, name).unwrap_or_default();
    let presentation_url = match child_text(element, "presentationURL") {
        Some(raw) if !raw.is_empty() => Some(resolve(base, &raw)?),
        _ => None,
    };
    Ok(Device {
        udn: child_text(element, "UDN")
            .ok_or(DescriptionError::Missing("UDN"))?,
        device_type: text("deviceType"),
        friendly_name: text("friendlyName"),
        manufacturer: text("manufacturer"),
        model_name: text("modelName"),
        model_number: text("modelNumber"),
        serial_number: text("serialNumber"),
        presentation_url,
        location: location.clone(),
        services: list(element, "serviceList", "service")
            .map(|s| parse_service(s, base))
            .collect::<Result<_, _>>()?,
        devices: list(element, "deviceList", "device")
            .map(|d| parse_device(d, base, location))
            .collect::<Result<_, _>>()?,
    })
}

/// Extract a device tree from a description document
///
/// Relative URLs are resolved against `<URLBase>` if present, else
/// against `location`, the URL the document was fetched from.
///
/// # Errors
///
/// Fails on malformed XML, a missing `<device>` or `<UDN>`, or a
/// service lacking any of its URLs.
pub fn parse_description(
    xml: &[u8],
    location: &Url,
) -> Result<Device, DescriptionError> {
    let root = Element::parse(xml)?;
    let base = match child_text(&root, "URLBase") {
        Some(raw) if !raw.is_empty() => {
            Url::parse(&raw).map_err(|e| DescriptionError::Url(raw, e))?
        }
        _ => location.clone(),
    };
    let device = root
        .get_child("device")
        .ok_or(DescriptionError::Missing("device"))?;
    parse_device(device, &base, location)
}

/// Extract action and state-variable names from an SCPD document
///
/// # Errors
///
/// Fails only on malformed XML; an empty `<scpd/>` is fine.
pub fn parse_scpd(xml: &[u8]) -> Result<Scpd, DescriptionError> {
    let root = Element::parse(xml)?;
    let names = |list_name: &str, item_name: &str| -> Vec<String> {
        list(&root, list_name, item_name)
            .filter_map(|e| child_text(e, "name"))
            .collect()
    };
    Ok(Scpd {
        actions: names("actionList", "action"),
        state_variables: names("serviceStateTable", "stateVariable"),
    })
}

fn rehost(url: &mut Url, from: &Url, to: &Url) {
    if url.host_str() == from.host_str()
        && url.port_or_known_default() == from.port_or_known_default()
    {
        let _ = url.set_host(to.host_str());
        let _ = url.set_port(to.port());
    }
}

impl Device {
    /// The UDN without its `uuid:` prefix, as it appears in USNs
    pub fn device_name(&self) -> &str {
        crate::ssdp::device_name(&self.udn)
    }

    /// All services of this device and its embedded devices
    ///
    /// Depth-first: a device's own services come before those of
    /// its embedded devices.
    pub fn all_services(&self) -> Vec<&Service> {
        let mut v: Vec<&Service> = self.services.iter().collect();
        for d in &self.devices {
            v.extend(d.all_services());
        }
        v
    }

    /// Visit every service, in the same order as [`Device::all_services`]
    pub fn for_each_service_mut<F: FnMut(&mut Service)>(&mut self, f: &mut F) {
        for s in &mut self.services {
            f(s);
        }
        for d in &mut self.devices {
            d.for_each_service_mut(f);
        }
    }

    /// A copy of this device as now found at `location`
    ///
    /// URLs which pointed at the old host point at the new one.
    #[must_use]
    pub fn relocated(&self, location: &Url) -> Device {
        let mut d = self.clone();
        d.relocate(&self.location, location);
        d
    }

    fn relocate(&mut self, from: &Url, to: &Url) {
        self.location = to.clone();
        if let Some(u) = &mut self.presentation_url {
            rehost(u, from, to);
        }
        for s in &mut self.services {
            rehost(&mut s.scpd_url, from, to);
            rehost(&mut s.control_url, from, to);
            rehost(&mut s.event_sub_url, from, to);
        }
        for d in &mut self.devices {
            d.relocate(from, to);
        }
    }
}
