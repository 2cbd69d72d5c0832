//! Main SAT>IP client API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as StateMutex;
use satip_core::error::{DiscoveryError, Result};
use satip_core::{Device, DeviceId, TuningParams};
use satip_discovery::{Discovery, DiscoveryEvent, SsdpClient};
use satip_rtsp::{
    RtspSession, SessionConfig, SessionDescription, SessionEvent, SessionInfo, TransportMode,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::{ClientEvent, EventHandler};

struct SessionEntry {
    session: RtspSession,
    /// Distinguishes a re-created session from the one a pump was started for.
    generation: u64,
    pump: JoinHandle<()>,
}

type Sessions = Arc<Mutex<HashMap<DeviceId, SessionEntry>>>;

/// High-level SAT>IP client: discovery plus one RTSP session per device.
pub struct SatIpClient<D: Discovery + 'static = SsdpClient> {
    discovery: Arc<D>,
    sessions: Sessions,
    event_handler: Arc<dyn EventHandler>,
    session_config: SessionConfig,
    transport_mode: TransportMode,
    generation: AtomicU64,
    watcher: StateMutex<Option<JoinHandle<()>>>,
}

impl<D: Discovery + 'static> SatIpClient<D> {
    /// Create a client on top of any discovery implementation.
    pub fn with_discovery(
        discovery: D,
        session_config: SessionConfig,
        transport_mode: TransportMode,
        event_handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            discovery: Arc::new(discovery),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            event_handler,
            session_config,
            transport_mode,
            generation: AtomicU64::new(0),
            watcher: StateMutex::new(None),
        }
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.transport_mode
    }

    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Search the network for `timeout` and return every known device.
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<Device>> {
        self.watch_discovery();
        self.discovery.scan(timeout).await
    }

    /// Snapshot of known devices.
    pub fn devices(&self) -> Vec<Device> {
        self.discovery.devices()
    }

    /// Known device by uuid, with or without `uuid:`.
    pub fn device(&self, uuid: &str) -> Option<Device> {
        self.discovery.find_by_udn(uuid)
    }

    /// Tune a device: SETUP (or re-tune an existing session) followed by PLAY.
    pub async fn tune(&self, uuid: &str, params: &TuningParams) -> Result<SessionInfo> {
        let device = self
            .device(uuid)
            .ok_or_else(|| DiscoveryError::DeviceNotFound(uuid.to_string()))?;
        let query = params.to_query();
        let mut sessions = self.sessions.lock().await;

        if let Some(entry) = sessions.get_mut(&device.id) {
            debug!(device = %device.id, "Re-tuning existing session");
            entry.session.setup(&query, self.transport_mode).await?;
            entry.session.play(None).await?;
            return Ok(entry.session.info());
        }

        let mut session = RtspSession::new(device.clone(), self.session_config.clone());
        let tuned = async {
            session.setup(&query, self.transport_mode).await?;
            session.play(None).await
        }
        .await;
        if let Err(e) = tuned {
            let _ = session.teardown().await;
            return Err(e);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let pump = match session.take_events() {
            Some(events) => self.spawn_session_pump(device.id.clone(), generation, events),
            None => tokio::spawn(async {}),
        };
        let info = session.info();
        info!(device = %device, stream = ?info.stream_id, "Tuned");
        sessions.insert(
            device.id.clone(),
            SessionEntry {
                session,
                generation,
                pump,
            },
        );
        Ok(info)
    }

    /// DESCRIBE a device. Uses its session if tuned, otherwise a one-off
    /// connection to the server's base URL.
    pub async fn describe(&self, uuid: &str) -> Result<SessionDescription> {
        let device = self
            .device(uuid)
            .ok_or_else(|| DiscoveryError::DeviceNotFound(uuid.to_string()))?;

        if let Some(entry) = self.sessions.lock().await.get_mut(&device.id) {
            return entry.session.describe().await;
        }

        let mut session = RtspSession::new(device, self.session_config.clone());
        let description = session.describe().await;
        let _ = session.teardown().await;
        description
    }

    /// Current session details for a tuned device.
    pub async fn session_info(&self, uuid: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .find(|(id, _)| id.matches(uuid))
            .map(|(_, entry)| entry.session.info())
    }

    /// Tear down the session of one device. Unknown devices are a no-op.
    pub async fn stop(&self, uuid: &str) -> Result<()> {
        let entry = {
            let mut sessions = self.sessions.lock().await;
            let id = sessions.keys().find(|id| id.matches(uuid)).cloned();
            id.and_then(|id| sessions.remove(&id))
        };
        match entry {
            Some(entry) => close_entry(entry).await,
            None => Ok(()),
        }
    }

    /// Tear down every session and stop discovery.
    pub async fn shutdown(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }

        let entries: Vec<(DeviceId, SessionEntry)> =
            self.sessions.lock().await.drain().collect();
        for (id, entry) in entries {
            if let Err(e) = close_entry(entry).await {
                warn!(device = %id, "Teardown during shutdown failed: {}", e);
            }
        }

        self.discovery.stop().await;
    }

    /// Forward discovery events to the handler and drop sessions of lost devices.
    fn watch_discovery(&self) {
        let mut watcher = self.watcher.lock();
        if watcher.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }

        let mut events = self.discovery.events();
        let sessions = Arc::clone(&self.sessions);
        let handler = Arc::clone(&self.event_handler);

        *watcher = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    DiscoveryEvent::Found(device) => {
                        handler.on_event(ClientEvent::DeviceFound(device)).await;
                    }
                    DiscoveryEvent::Lost(id) => {
                        handler.on_event(ClientEvent::DeviceLost(id.clone())).await;
                        let entry = sessions.lock().await.remove(&id);
                        if let Some(entry) = entry {
                            info!(device = %id, "Device lost, tearing down its session");
                            if let Err(e) = close_entry(entry).await {
                                debug!(device = %id, "Teardown after loss failed: {}", e);
                            }
                            handler
                                .on_event(ClientEvent::SessionClosed {
                                    device: id,
                                    reason: "device lost".to_string(),
                                })
                                .await;
                        }
                    }
                }
            }
        }));
    }

    fn spawn_session_pump(
        &self,
        device: DeviceId,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        let handler = Arc::clone(&self.event_handler);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::ReceptionChanged(info) => {
                        handler
                            .on_event(ClientEvent::ReceptionChanged {
                                device: device.clone(),
                                info,
                            })
                            .await;
                    }
                    SessionEvent::RemoteClosed => {
                        let entry = {
                            let mut sessions = sessions.lock().await;
                            match sessions.get(&device) {
                                Some(entry) if entry.generation == generation => {
                                    sessions.remove(&device)
                                }
                                _ => None,
                            }
                        };
                        if let Some(mut entry) = entry {
                            // The server already ended the stream, only local cleanup is left.
                            let _ = entry.session.teardown().await;
                        }
                        handler
                            .on_event(ClientEvent::SessionClosed {
                                device: device.clone(),
                                reason: "closed by server".to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
        })
    }
}

/// Tear down an entry removed from the session map and stop its pump.
async fn close_entry(mut entry: SessionEntry) -> Result<()> {
    let result = entry.session.teardown().await;
    entry.pump.abort();
    result
}

impl<D: Discovery + 'static> Drop for SatIpClient<D> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CallbackHandler;
    use async_trait::async_trait;
    use satip_discovery::EventStream;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::sync::broadcast;
    use tokio_stream::wrappers::BroadcastStream;

    /// Discovery backed by a fixed device list and a manual event channel.
    struct FakeDiscovery {
        devices: StateMutex<Vec<Device>>,
        events_tx: broadcast::Sender<DiscoveryEvent>,
    }

    impl FakeDiscovery {
        fn new(devices: Vec<Device>) -> Self {
            let (events_tx, _) = broadcast::channel(16);
            Self {
                devices: StateMutex::new(devices),
                events_tx,
            }
        }
    }

    #[async_trait]
    impl Discovery for FakeDiscovery {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn find_by_type(&self, _target: &str) -> Result<()> {
            Ok(())
        }

        async fn scan(&self, _timeout: Duration) -> Result<Vec<Device>> {
            let devices = self.devices.lock().clone();
            for device in &devices {
                let _ = self.events_tx.send(DiscoveryEvent::Found(device.clone()));
            }
            Ok(devices)
        }

        fn events(&self) -> EventStream {
            let stream =
                BroadcastStream::new(self.events_tx.subscribe()).filter_map(|e| e.ok());
            Box::new(Box::pin(stream))
        }

        fn find_by_udn(&self, uuid: &str) -> Option<Device> {
            self.devices
                .lock()
                .iter()
                .find(|d| d.id.matches(uuid))
                .cloned()
        }

        fn devices(&self) -> Vec<Device> {
            self.devices.lock().clone()
        }

        async fn stop(&self) {}
    }

    /// RTSP server that accepts every request; returns its port and the
    /// request lines it saw.
    async fn spawn_rtsp_server() -> (u16, Arc<StateMutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(StateMutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    loop {
                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let mut cseq = 0u32;
                        let mut client_port = String::from("40000-40001");
                        loop {
                            let mut line = String::new();
                            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                                return;
                            }
                            if line == "\r\n" {
                                break;
                            }
                            if let Some(v) = line.strip_prefix("CSeq:") {
                                cseq = v.trim().parse().unwrap_or(0);
                            }
                            if let Some(p) = line.split(';').find_map(|s| s.trim().strip_prefix("client_port=")) {
                                client_port = p.trim().to_string();
                            }
                        }
                        let method = request_line.split_whitespace().next().unwrap_or("").to_string();
                        log.lock().push(request_line.trim().to_string());
                        let reply = match method.as_str() {
                            "SETUP" => format!(
                                "RTSP/1.0 200 OK\r\nCSeq: {}\r\nSession: 77;timeout=60\r\n\
                                 Transport: RTP/AVP;unicast;client_port={};server_port=42000-42001\r\n\
                                 com.ses.streamID: 9\r\n\r\n",
                                cseq, client_port
                            ),
                            "DESCRIBE" => {
                                let sdp = "v=0\r\na=fmtp:33 ver=1.0;src=1;tuner=1,224,1,12,11954,h,dvbs,qpsk,off,0.35,27500,34;pids=0\r\n";
                                format!(
                                    "RTSP/1.0 200 OK\r\nCSeq: {}\r\nContent-Length: {}\r\n\r\n{}",
                                    cseq,
                                    sdp.len(),
                                    sdp
                                )
                            }
                            _ => format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\nSession: 77\r\n\r\n", cseq),
                        };
                        if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (port, seen)
    }

    fn device(port: u16) -> Device {
        let mut device = Device::new(
            DeviceId::new("uuid:ABC123"),
            "127.0.0.1",
            "http://127.0.0.1/desc.xml",
        );
        device.rtsp_port = port;
        device
    }

    fn session_config(port_base: u16) -> SessionConfig {
        SessionConfig {
            port_base,
            local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..SessionConfig::default()
        }
    }

    fn recording_handler() -> (Arc<dyn EventHandler>, Arc<StateMutex<Vec<ClientEvent>>>) {
        let events = Arc::new(StateMutex::new(Vec::new()));
        let sink = events.clone();
        let handler = CallbackHandler::new(move |event| sink.lock().push(event));
        (Arc::new(handler), events)
    }

    async fn wait_for<F: Fn(&[ClientEvent]) -> bool>(
        events: &Arc<StateMutex<Vec<ClientEvent>>>,
        predicate: F,
    ) -> bool {
        for _ in 0..100 {
            if predicate(&events.lock()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn params() -> TuningParams {
        TuningParams::parse("src=1&freq=11954&pol=h&msys=dvbs&sr=27500&fec=34&mtype=qpsk&pids=0")
    }

    mod discovery {
        use super::*;

        #[tokio::test]
        async fn discover_forwards_found_events() {
            let (handler, events) = recording_handler();
            let client = SatIpClient::with_discovery(
                FakeDiscovery::new(vec![device(554)]),
                SessionConfig::default(),
                TransportMode::Unicast,
                handler,
            );

            let devices = client.discover(Duration::from_millis(10)).await.unwrap();
            assert_eq!(devices.len(), 1);
            assert!(client.device("abc123").is_some());
            assert!(
                wait_for(&events, |e| matches!(e.first(), Some(ClientEvent::DeviceFound(_)))).await
            );
        }

        #[tokio::test]
        async fn tune_unknown_device_fails() {
            let client = SatIpClient::with_discovery(
                FakeDiscovery::new(Vec::new()),
                SessionConfig::default(),
                TransportMode::Unicast,
                Arc::new(crate::NoOpHandler),
            );
            let err = client.tune("uuid:NOPE", &params()).await.unwrap_err();
            assert!(err.to_string().contains("uuid:NOPE"));
        }
    }

    mod sessions {
        use super::*;

        #[tokio::test]
        async fn tune_then_stop() {
            let (port, seen) = spawn_rtsp_server().await;
            let client = SatIpClient::with_discovery(
                FakeDiscovery::new(vec![device(port)]),
                session_config(46000),
                TransportMode::Unicast,
                Arc::new(crate::NoOpHandler),
            );

            let info = client.tune("uuid:ABC123", &params()).await.unwrap();
            assert_eq!(info.session_id.as_deref(), Some("77"));
            assert_eq!(info.stream_id.as_deref(), Some("9"));
            assert!(client.session_info("ABC123").await.is_some());

            let description = client.describe("uuid:ABC123").await.unwrap();
            assert!(description.reception.unwrap().locked);

            client.stop("uuid:ABC123").await.unwrap();
            assert!(client.session_info("ABC123").await.is_none());
            client.stop("uuid:ABC123").await.unwrap();

            let methods: Vec<String> = seen
                .lock()
                .iter()
                .map(|l| l.split_whitespace().next().unwrap_or("").to_string())
                .collect();
            assert_eq!(methods, vec!["SETUP", "PLAY", "DESCRIBE", "TEARDOWN"]);
            assert!(seen.lock()[0].contains("?src=1&freq=11954&pol=h&msys=dvbs"));
        }

        #[tokio::test]
        async fn retune_reuses_session() {
            let (port, seen) = spawn_rtsp_server().await;
            let client = SatIpClient::with_discovery(
                FakeDiscovery::new(vec![device(port)]),
                session_config(46100),
                TransportMode::Unicast,
                Arc::new(crate::NoOpHandler),
            );

            client.tune("uuid:ABC123", &params()).await.unwrap();
            client.tune("uuid:ABC123", &params()).await.unwrap();
            client.shutdown().await;

            let lines = seen.lock().clone();
            assert_eq!(lines.len(), 5);
            assert!(lines[2].starts_with("SETUP "));
            assert!(lines[2].contains("/stream=9?"));
            assert!(lines[4].starts_with("TEARDOWN "));
        }

        #[tokio::test]
        async fn describe_without_session_uses_base_url() {
            let (port, seen) = spawn_rtsp_server().await;
            let client = SatIpClient::with_discovery(
                FakeDiscovery::new(vec![device(port)]),
                session_config(46200),
                TransportMode::Unicast,
                Arc::new(crate::NoOpHandler),
            );

            let description = client.describe("ABC123").await.unwrap();
            assert_eq!(description.reception.unwrap().level, 87);
            let lines = seen.lock().clone();
            assert_eq!(lines, vec![format!("DESCRIBE rtsp://127.0.0.1:{}/ RTSP/1.0", port)]);
        }

        #[tokio::test]
        async fn device_lost_tears_down_session() {
            let (port, seen) = spawn_rtsp_server().await;
            let (handler, events) = recording_handler();
            let client = SatIpClient::with_discovery(
                FakeDiscovery::new(vec![device(port)]),
                session_config(46300),
                TransportMode::Unicast,
                handler,
            );

            client.discover(Duration::from_millis(10)).await.unwrap();
            client.tune("uuid:ABC123", &params()).await.unwrap();
            let _ = client
                .discovery()
                .events_tx
                .send(DiscoveryEvent::Lost(DeviceId::new("uuid:ABC123")));

            assert!(
                wait_for(&events, |e| e.iter().any(|e| matches!(
                    e,
                    ClientEvent::SessionClosed { reason, .. } if reason == "device lost"
                )))
                .await
            );
            assert!(events.lock().iter().any(|e| matches!(e, ClientEvent::DeviceLost(_))));
            assert!(client.session_info("ABC123").await.is_none());
            assert!(seen.lock().last().unwrap().starts_with("TEARDOWN "));
        }

        #[tokio::test]
        async fn rtcp_bye_closes_session() {
            let (port, seen) = spawn_rtsp_server().await;
            let (handler, events) = recording_handler();
            let client = SatIpClient::with_discovery(
                FakeDiscovery::new(vec![device(port)]),
                session_config(46400),
                TransportMode::Unicast,
                handler,
            );

            let info = client.tune("uuid:ABC123", &params()).await.unwrap();
            let rtcp_port = info.client_ports.unwrap().rtcp;

            let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            sender
                .send_to(&[0x81, 203, 0, 1, 0x12, 0x34, 0x56, 0x78], ("127.0.0.1", rtcp_port))
                .await
                .unwrap();

            assert!(
                wait_for(&events, |e| e.iter().any(|e| matches!(
                    e,
                    ClientEvent::SessionClosed { reason, .. } if reason == "closed by server"
                )))
                .await
            );
            assert!(client.session_info("ABC123").await.is_none());
            // No TEARDOWN for a session the server already ended.
            assert!(!seen.lock().iter().any(|l| l.starts_with("TEARDOWN")));
        }
    }
}
