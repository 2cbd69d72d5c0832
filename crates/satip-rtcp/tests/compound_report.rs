//! A server's compound report delivered to a running listener.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use satip_core::MemoryLogger;
use satip_rtcp::{ListenerConfig, ListenerMode, RtcpEvent, RtcpListener, RtcpPacket};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

fn packet(count: u8, packet_type: u8, body: &[u8]) -> Vec<u8> {
    assert_eq!(body.len() % 4, 0);
    let mut out = vec![0x80 | count, packet_type];
    out.extend_from_slice(&((body.len() / 4) as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Sender report, SES1 APP with tuner status, then BYE.
fn compound(tuner_status: &str) -> Vec<u8> {
    let ssrc = 0x0A0B_0C0Du32.to_be_bytes();

    let mut sr = ssrc.to_vec();
    sr.extend_from_slice(&[0u8; 20]);

    let mut app = ssrc.to_vec();
    app.extend_from_slice(b"SES1");
    app.extend_from_slice(&[0, 0]);
    app.extend_from_slice(&(tuner_status.len() as u16).to_be_bytes());
    app.extend_from_slice(tuner_status.as_bytes());
    while app.len() % 4 != 0 {
        app.push(0);
    }

    let mut out = packet(0, 200, &sr);
    out.extend(packet(0, 204, &app));
    out.extend(packet(1, 203, &ssrc));
    out
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<RtcpEvent>) -> RtcpEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

#[tokio::test]
async fn reception_then_bye_ends_listener() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut listener = RtcpListener::start(
        ListenerMode::Unicast {
            address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        },
        0,
        ListenerConfig::default(),
        Arc::new(MemoryLogger::new()),
        tx,
    )
    .await
    .unwrap();

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let status = "ver=1.0;src=1;tuner=1,128,1,8,11494.00,h,dvbs2,8psk,on,0.35,22000,23;pids=0,17";
    server
        .send_to(&compound(status), listener.local_addr())
        .await
        .unwrap();

    assert!(matches!(
        next_event(&mut rx).await,
        RtcpEvent::Packet(RtcpPacket::SenderReport(_))
    ));

    let RtcpEvent::Reception(info) = next_event(&mut rx).await else {
        panic!("expected reception");
    };
    assert!(info.locked);
    assert_eq!(info.level, 50);
    assert_eq!(info.quality, 53);

    assert!(matches!(
        next_event(&mut rx).await,
        RtcpEvent::Packet(RtcpPacket::App(_))
    ));
    assert!(matches!(
        next_event(&mut rx).await,
        RtcpEvent::Packet(RtcpPacket::Bye(_))
    ));
    assert_eq!(next_event(&mut rx).await, RtcpEvent::Bye);

    for _ in 0..50 {
        if !listener.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!listener.is_running());
    listener.stop().await;
}
