//! Background RTCP receive loop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use satip_core::error::{RtcpError, Result};
use satip_core::{ReceptionInfo, SharedLogger};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::packet::{RtcpPacket, RtcpPackets};

/// Largest datagram read from the control channel.
const RECV_BUFFER_SIZE: usize = 2048;

/// Notifications raised by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpEvent {
    /// Any decoded packet.
    Packet(RtcpPacket),
    /// Tuner status carried by an APP packet.
    Reception(ReceptionInfo),
    /// The server ended the stream. No further events follow.
    Bye,
}

/// How the listener socket is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    /// Bind to the given local address (falls back to any address), or any address.
    Unicast { address: Option<IpAddr> },
    /// Bind `0.0.0.0:port` with address reuse and join the group.
    Multicast { group: Ipv4Addr },
}

/// Timing knobs for the listener.
#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    /// How long a single receive waits before re-checking the stop signal.
    pub receive_timeout: Duration,
    /// How long `stop` waits for the loop before aborting it.
    pub join_deadline: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(400),
            join_deadline: Duration::from_millis(800),
        }
    }
}

/// RTCP listener bound to one UDP port.
///
/// Decoded packets are sent on the channel given to [`RtcpListener::start`].
/// The loop ends on [`RtcpListener::stop`], on a BYE packet, when the event
/// receiver is dropped, or on a socket error.
pub struct RtcpListener {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task_handle: Option<JoinHandle<()>>,
    join_deadline: Duration,
    logger: SharedLogger,
}

impl RtcpListener {
    /// Bind the socket and start the background loop.
    pub async fn start(
        mode: ListenerMode,
        port: u16,
        config: ListenerConfig,
        logger: SharedLogger,
        events: mpsc::UnboundedSender<RtcpEvent>,
    ) -> Result<Self> {
        let socket = bind_socket(mode, port, &logger)?;
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        logger.info(&format!("RTCP listener started on {} ({:?})", local_addr, mode));

        let task_logger = logger.clone();
        let receive_timeout = config.receive_timeout;
        let task_handle = tokio::spawn(async move {
            Self::run_loop(socket, mode, receive_timeout, events, task_logger, shutdown_rx).await;
        });

        Ok(Self {
            local_addr,
            shutdown_tx,
            task_handle: Some(task_handle),
            join_deadline: config.join_deadline,
            logger,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the receive loop is still alive.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop, wait for it up to the join deadline, then abort.
    ///
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        let Some(mut handle) = self.task_handle.take() else {
            return;
        };

        match tokio::time::timeout(self.join_deadline, &mut handle).await {
            Ok(Ok(())) => {
                self.logger.verbose(&format!("RTCP listener on {} stopped", self.local_addr));
            }
            Ok(Err(e)) => {
                self.logger.error(&format!("RTCP listener task failed: {}", e));
            }
            Err(_) => {
                self.logger.warn(&format!(
                    "RTCP listener on {} did not stop within {:?}, aborting",
                    self.local_addr, self.join_deadline
                ));
                handle.abort();
            }
        }
    }

    async fn run_loop(
        socket: UdpSocket,
        mode: ListenerMode,
        receive_timeout: Duration,
        events: mpsc::UnboundedSender<RtcpEvent>,
        logger: SharedLogger,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            if *shutdown_rx.borrow() || events.is_closed() {
                break;
            }

            tokio::select! {
                result = tokio::time::timeout(receive_timeout, socket.recv_from(&mut buf)) => {
                    match result {
                        Err(_) => continue,
                        Ok(Err(e)) => {
                            logger.error(&format!("RTCP receive failed: {}", e));
                            break;
                        }
                        Ok(Ok((len, from))) => {
                            logger.verbose(&format!("RTCP datagram of {} bytes from {}", len, from));
                            if Self::dispatch(&buf[..len], &events, &logger) {
                                logger.info("RTCP BYE received, listener exiting");
                                break;
                            }
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        if let ListenerMode::Multicast { group } = mode {
            if let Err(e) = socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                logger.warn(&format!("Failed to leave multicast group {}: {}", group, e));
            }
        }
    }

    /// Decode one datagram and forward its packets. Returns true on BYE.
    ///
    /// A BYE ends the stream even when its body does not decode.
    fn dispatch(
        datagram: &[u8],
        events: &mpsc::UnboundedSender<RtcpEvent>,
        logger: &SharedLogger,
    ) -> bool {
        let mut packets = RtcpPackets::new(datagram);
        for result in packets.by_ref() {
            match result {
                Ok(packet) => {
                    if let RtcpPacket::App(app) = &packet {
                        match app.reception() {
                            Some(info) => {
                                let _ = events.send(RtcpEvent::Reception(info));
                            }
                            None => logger.verbose(&format!(
                                "APP packet {} without tuner status",
                                app.name
                            )),
                        }
                    }
                    let _ = events.send(RtcpEvent::Packet(packet));
                }
                Err(e) => logger.warn(&format!("Dropping malformed RTCP data: {}", e)),
            }
        }

        let saw_bye = packets.saw_bye();
        if saw_bye {
            let _ = events.send(RtcpEvent::Bye);
        }
        saw_bye
    }
}

impl Drop for RtcpListener {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            let _ = self.shutdown_tx.send(true);
            handle.abort();
        }
    }
}

/// Create the tokio socket for a listener mode.
fn bind_socket(mode: ListenerMode, port: u16, logger: &SharedLogger) -> Result<UdpSocket> {
    let std_socket = match mode {
        ListenerMode::Unicast { address: Some(address) } => {
            match bind_unicast(SocketAddr::new(address, port)) {
                Ok(socket) => socket,
                Err(e) => {
                    logger.warn(&format!(
                        "Cannot bind RTCP to {}:{} ({}), using any address",
                        address, port, e
                    ));
                    bind_unicast(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
                        .map_err(|e| RtcpError::Bind(format!("port {}: {}", port, e)))?
                }
            }
        }
        ListenerMode::Unicast { address: None } => {
            bind_unicast(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
                .map_err(|e| RtcpError::Bind(format!("port {}: {}", port, e)))?
        }
        ListenerMode::Multicast { group } => bind_multicast(group, port)
            .map_err(|e| RtcpError::Bind(format!("{}:{}: {}", group, port, e)))?,
    };

    Ok(UdpSocket::from_std(std_socket)?)
}

fn bind_unicast(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn bind_multicast(group: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_packets::{bye, receiver_report, ses1_app};
    use satip_core::{LogLevel, MemoryLogger};
    use std::sync::Arc;

    async fn start_loopback(
        logger: Arc<MemoryLogger>,
    ) -> (RtcpListener, mpsc::UnboundedReceiver<RtcpEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = RtcpListener::start(
            ListenerMode::Unicast {
                address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            },
            0,
            ListenerConfig::default(),
            logger,
            tx,
        )
        .await
        .unwrap();
        (listener, rx)
    }

    async fn send_to(listener: &RtcpListener, data: &[u8]) {
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(data, listener.local_addr()).await.unwrap();
    }

    async fn wait_stopped(listener: &RtcpListener) -> bool {
        for _ in 0..50 {
            if !listener.is_running() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<RtcpEvent>) -> RtcpEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn binds_requested_address() {
            let logger = Arc::new(MemoryLogger::new());
            let (mut listener, _rx) = start_loopback(logger).await;
            assert!(listener.local_addr().ip().is_loopback());
            assert_ne!(listener.local_addr().port(), 0);
            assert!(listener.is_running());

            listener.stop().await;
            assert!(!listener.is_running());
        }

        #[tokio::test]
        async fn stop_is_idempotent() {
            let logger = Arc::new(MemoryLogger::new());
            let (mut listener, _rx) = start_loopback(logger).await;
            listener.stop().await;
            listener.stop().await;
            assert!(!listener.is_running());
        }

        #[tokio::test]
        async fn stop_is_prompt() {
            let logger = Arc::new(MemoryLogger::new());
            let (mut listener, _rx) = start_loopback(logger.clone()).await;
            let started = std::time::Instant::now();
            listener.stop().await;
            assert!(started.elapsed() < Duration::from_millis(800));
            assert!(!logger.contains(LogLevel::Warn, "aborting"));
        }

        #[tokio::test]
        async fn exits_when_receiver_dropped() {
            let logger = Arc::new(MemoryLogger::new());
            let (listener, rx) = start_loopback(logger).await;
            drop(rx);
            tokio::time::sleep(Duration::from_millis(400)).await;
            assert!(wait_stopped(&listener).await);
        }
    }

    mod dispatching {
        use super::*;

        #[tokio::test]
        async fn forwards_reception_from_app_packets() {
            let logger = Arc::new(MemoryLogger::new());
            let (mut listener, mut rx) = start_loopback(logger).await;

            send_to(&listener, &ses1_app(1, "ver=1.0;src=1;tuner=1,128,1,15,")).await;

            assert_eq!(
                next_event(&mut rx).await,
                RtcpEvent::Reception(ReceptionInfo { locked: true, level: 50, quality: 100 })
            );
            assert!(matches!(next_event(&mut rx).await, RtcpEvent::Packet(RtcpPacket::App(_))));
            listener.stop().await;
        }

        #[tokio::test]
        async fn bye_ends_the_loop() {
            let logger = Arc::new(MemoryLogger::new());
            let (listener, mut rx) = start_loopback(logger).await;

            let mut datagram = receiver_report(1, &[]);
            datagram.extend(bye(1));
            send_to(&listener, &datagram).await;

            assert!(matches!(
                next_event(&mut rx).await,
                RtcpEvent::Packet(RtcpPacket::ReceiverReport(_))
            ));
            assert!(matches!(next_event(&mut rx).await, RtcpEvent::Packet(RtcpPacket::Bye(_))));
            assert_eq!(next_event(&mut rx).await, RtcpEvent::Bye);

            // The task ends on its own; the channel closes with it.
            let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
            assert!(closed.is_none());
            assert!(wait_stopped(&listener).await);
        }

        #[tokio::test]
        async fn malformed_datagram_is_dropped_and_loop_continues() {
            let logger = Arc::new(MemoryLogger::new());
            let (mut listener, mut rx) = start_loopback(logger.clone()).await;

            send_to(&listener, &[0x80, 201, 0x00, 0x40, 0, 0]).await;
            send_to(&listener, &receiver_report(9, &[])).await;

            match next_event(&mut rx).await {
                RtcpEvent::Packet(RtcpPacket::ReceiverReport(rr)) => assert_eq!(rr.ssrc, 9),
                other => panic!("unexpected event {:?}", other),
            }
            assert!(logger.contains(LogLevel::Warn, "malformed"));
            assert!(listener.is_running());
            listener.stop().await;
        }

        #[tokio::test]
        async fn malformed_bye_still_ends_the_loop() {
            let logger = Arc::new(MemoryLogger::new());
            let (listener, mut rx) = start_loopback(logger.clone()).await;

            // Source count 2, one SSRC present.
            send_to(&listener, &[0x82, 203, 0x00, 0x01, 0x12, 0x34, 0x56, 0x78]).await;

            assert_eq!(next_event(&mut rx).await, RtcpEvent::Bye);
            assert!(wait_stopped(&listener).await);
            assert!(logger.contains(LogLevel::Warn, "malformed"));
            assert!(logger.contains(LogLevel::Info, "RTCP BYE received"));
        }
    }
}
