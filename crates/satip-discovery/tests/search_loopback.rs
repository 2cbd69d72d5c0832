//! M-SEARCH round trip against a fake server on loopback.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use satip_discovery::{DiscoveryConfig, DiscoveryEvent, SsdpClient, SATIP_DEVICE_TYPE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_stream::StreamExt;

const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:ses-com:device:SatIPServer:1</deviceType>
    <friendlyName>Loopback Tuner</friendlyName>
    <modelName>LB-1</modelName>
    <UDN>uuid:LOOP42</UDN>
    <satip:X_SATIPCAP xmlns:satip="urn:ses-com:satip">DVBS2-2,DVBC-1</satip:X_SATIPCAP>
    <satip:X_SATIPM3U xmlns:satip="urn:ses-com:satip">/channels.m3u</satip:X_SATIPM3U>
  </device>
</root>"#;

/// Minimal HTTP server answering every request with the description.
async fn spawn_http() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    DESCRIPTION.len(),
                    DESCRIPTION
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (port, hits)
}

/// UDP responder answering each M-SEARCH with a search response.
async fn spawn_responder(http_port: u16) -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let request = String::from_utf8_lossy(&buf[..len]);
            if !request.starts_with("M-SEARCH") || !request.contains(SATIP_DEVICE_TYPE) {
                continue;
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\n\
                 CACHE-CONTROL: max-age=1800\r\n\
                 EXT:\r\n\
                 LOCATION: http://127.0.0.1:{}/desc.xml\r\n\
                 SERVER: Linux/1.0 UPnP/1.1 SatIP/1.0\r\n\
                 ST: {}\r\n\
                 USN: uuid:LOOP42::{}\r\n\r\n",
                http_port, SATIP_DEVICE_TYPE, SATIP_DEVICE_TYPE
            );
            let _ = socket.send_to(response.as_bytes(), from).await;
        }
    });

    addr
}

fn loopback_config(search_addr: std::net::SocketAddr) -> DiscoveryConfig {
    DiscoveryConfig {
        search_addr,
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        multicast: false,
        ..DiscoveryConfig::default()
    }
}

#[tokio::test]
async fn scan_finds_device_once() {
    let (http_port, hits) = spawn_http().await;
    let responder = spawn_responder(http_port).await;

    let client = SsdpClient::new(loopback_config(responder)).unwrap();
    let mut events = client.event_stream();

    let devices = client.scan(Duration::from_millis(500)).await.unwrap();
    assert_eq!(devices.len(), 1);

    let device = &devices[0];
    assert_eq!(device.id.as_str(), "uuid:LOOP42");
    assert_eq!(device.friendly_name, "Loopback Tuner");
    assert_eq!(device.host, "127.0.0.1");
    assert_eq!(device.model_name.as_deref(), Some("LB-1"));
    assert_eq!(
        device.m3u_url.as_deref(),
        Some(format!("http://127.0.0.1:{}/channels.m3u", http_port).as_str())
    );
    assert!(device.capabilities.supports_satellite());
    assert!(device.capabilities.supports_cable());
    assert!(!device.capabilities.supports_terrestrial());

    // Three responses, one fetch, one event.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let event = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, DiscoveryEvent::Found(ref d) if d.id.as_str() == "uuid:LOOP42"));
    assert!(tokio::time::timeout(Duration::from_millis(200), events.next())
        .await
        .is_err());

    assert!(client.find_by_udn("loop42").is_some());
    client.stop().await;
    assert!(!client.is_running());
    assert_eq!(client.devices().len(), 1);
}

#[tokio::test]
async fn scan_without_servers_is_empty() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = SsdpClient::new(loopback_config(silent.local_addr().unwrap())).unwrap();

    let devices = client.scan(Duration::from_millis(200)).await.unwrap();
    assert!(devices.is_empty());
    client.stop().await;
}
