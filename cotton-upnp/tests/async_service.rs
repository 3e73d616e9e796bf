use cotton_upnp::netif::{Flags, InterfaceIndex, NetworkEvent};
use cotton_upnp::{ssdp, Advertisement, AsyncService, Config, Notification};
use futures_util::StreamExt;
use serial_test::serial;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn lo() -> InterfaceIndex {
    InterfaceIndex(NonZeroU32::new(1).unwrap())
}

fn config() -> Config {
    Config {
        // Keep clear of any real SSDP traffic
        ssdp_port: 0,
        search_mx: 1,
        ..Config::default()
    }
}

/// A service whose only interface is loopback
async fn loopback_service() -> (AsyncService, mpsc::UnboundedSender<NetworkEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let service = AsyncService::with_network_events(
        &config(),
        UnboundedReceiverStream::new(rx),
    )
    .unwrap();
    tx.send(NetworkEvent::NewLink(
        lo(),
        "lo".to_string(),
        Flags::UP | Flags::RUNNING | Flags::MULTICAST,
    ))
    .unwrap();
    tx.send(NetworkEvent::NewAddr(lo(), LOCALHOST, 8)).unwrap();

    for _ in 0..100 {
        if service.session_port(&LOCALHOST).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (service, tx)
}

async fn send_to_service(service: &AsyncService, bytes: &[u8]) -> UdpSocket {
    let port = service.session_port(&LOCALHOST).unwrap();
    let socket = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    socket
        .send_to(bytes, SocketAddr::new(LOCALHOST, port))
        .await
        .unwrap();
    socket
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
#[serial]
async fn session_opened_on_new_address() {
    let (service, _tx) = loopback_service().await;
    assert_eq!(service.local_addresses(), vec![LOCALHOST]);
    assert!(service.session_port(&LOCALHOST).is_some());
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
#[serial]
async fn search_answered_after_delay() {
    let (service, _tx) = loopback_service().await;
    service.advertise(
        "uuid:999::upnp:rootdevice",
        Advertisement {
            notification_type: "upnp:rootdevice".to_string(),
            location: url::Url::parse("http://192.0.2.1:8080/description.xml")
                .unwrap(),
        },
    );

    let search = ssdp::build_search("239.255.255.250:1900", "ssdp:all", 1);
    let socket = send_to_service(&service, &search.serialize()).await;

    let mut buf = [0u8; 1500];
    let (n, _) = tokio::time::timeout(
        Duration::from_secs(3),
        socket.recv_from(&mut buf),
    )
    .await
    .unwrap()
    .unwrap();

    let ssdp::Message::Response {
        search_target,
        unique_service_name,
        location,
        max_age,
    } = ssdp::parse(&buf[..n]).unwrap()
    else {
        panic!("expected response");
    };
    assert_eq!(search_target, "upnp:rootdevice");
    assert_eq!(unique_service_name, "uuid:999::upnp:rootdevice");
    assert_eq!(location, "http://127.0.0.1:8080/description.xml");
    assert_eq!(max_age, 1800);
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
#[serial]
async fn invalid_search_not_answered() {
    let (service, _tx) = loopback_service().await;
    service.advertise(
        "uuid:999",
        Advertisement {
            notification_type: "upnp:rootdevice".to_string(),
            location: url::Url::parse("http://192.0.2.1/description.xml")
                .unwrap(),
        },
    );

    let socket = send_to_service(
        &service,
        b"M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
MAN: ssdp:discover\r\n\
MX: 1\r\n\
ST: ssdp:all\r\n\
\r\n",
    )
    .await;

    let mut buf = [0u8; 1500];
    let r = tokio::time::timeout(
        Duration::from_millis(1500),
        socket.recv_from(&mut buf),
    )
    .await;
    assert!(r.is_err());
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
#[serial]
async fn subscriber_sees_notify_and_byebye() {
    let (service, _tx) = loopback_service().await;
    let mut stream = service.subscribe("upnp::Directory:2");

    let notify = ssdp::build_notify(
        "239.255.255.250:1900",
        "upnp::Directory:3",
        "uuid:37::upnp::Directory:3",
        "http://192.0.2.7/desc.xml",
        900,
    );
    let _socket = send_to_service(&service, &notify.serialize()).await;

    let n = tokio::time::timeout(Duration::from_secs(3), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        n,
        Notification::Alive { ref location, max_age: 900, local, .. }
        if location == "http://192.0.2.7/desc.xml" && local == LOCALHOST
    ));
    assert_eq!(n.device_name(), "37");

    let byebye = ssdp::build_byebye(
        "239.255.255.250:1900",
        "upnp::Directory:3",
        "uuid:37::upnp::Directory:3",
    );
    let _socket = send_to_service(&service, &byebye.serialize()).await;

    let n = tokio::time::timeout(Duration::from_secs(3), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(n, Notification::ByeBye { .. }));
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
#[serial]
async fn address_loss_reported() {
    let (service, tx) = loopback_service().await;
    let mut losses = Box::pin(service.interface_losses());

    tx.send(NetworkEvent::DelAddr(lo(), LOCALHOST, 8)).unwrap();

    let lost = tokio::time::timeout(Duration::from_secs(3), losses.next())
        .await
        .unwrap();
    assert_eq!(lost, Some(LOCALHOST));
    assert!(service.local_addresses().is_empty());
    assert!(service.session_port(&LOCALHOST).is_none());
}

#[tokio::test]
async fn invalid_config_rejected() {
    let config = Config {
        search_mx: 0,
        ..Config::default()
    };
    let r = AsyncService::with_network_events(&config, futures::stream::empty());
    assert!(r.is_err());
}
