//! RTSP session management.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as StateMutex;
use satip_core::error::{Result, RtspError};
use satip_core::{Device, ReceptionInfo, SharedLogger, TracingLogger};
use satip_rtcp::{ListenerConfig, ListenerMode, RtcpEvent, RtcpListener};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::connection::{RtspConnection, DEFAULT_READ_TIMEOUT};
use crate::headers::{PortPair, SessionHeader, TransportInfo, TransportMode, DEFAULT_SESSION_TIMEOUT};
use crate::keepalive::KeepAlive;
use crate::ports::{allocate_port_pair, DEFAULT_PORT_BASE};
use crate::traits::RtspTransport;
use crate::{RtspRequest, RtspResponse};

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No server session.
    Idle,
    /// SETUP accepted, stream not yet playing.
    Ready,
    /// PLAY accepted.
    Playing,
}

/// Notifications raised by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// New reception figures from RTCP or DESCRIBE.
    ReceptionChanged(ReceptionInfo),
    /// The server sent RTCP BYE.
    RemoteClosed,
}

/// Everything the server told us about the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    /// Seconds until the server expires the session.
    pub timeout: u32,
    pub stream_id: Option<String>,
    pub mode: TransportMode,
    pub client_ports: Option<PortPair>,
    pub server_ports: Option<PortPair>,
    pub destination: Option<String>,
    pub multicast_ports: Option<PortPair>,
    pub multicast_ttl: Option<u8>,
    pub source: Option<String>,
    pub rtp_info: Option<String>,
    pub public_methods: Option<String>,
    pub reception: Option<ReceptionInfo>,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            session_id: None,
            timeout: DEFAULT_SESSION_TIMEOUT,
            stream_id: None,
            mode: TransportMode::default(),
            client_ports: None,
            server_ports: None,
            destination: None,
            multicast_ports: None,
            multicast_ttl: None,
            source: None,
            rtp_info: None,
            public_methods: None,
            reception: None,
        }
    }
}

/// Result of DESCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp: String,
    pub reception: Option<ReceptionInfo>,
}

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// First RTP port tried for unicast.
    pub port_base: u16,
    /// Subtracted from the session timeout to get the keep-alive period.
    pub keepalive_margin: Duration,
    pub read_timeout: Duration,
    pub listener: ListenerConfig,
    /// Local address for the unicast RTCP socket.
    pub local_address: Option<IpAddr>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port_base: DEFAULT_PORT_BASE,
            keepalive_margin: Duration::from_secs(5),
            read_timeout: DEFAULT_READ_TIMEOUT,
            listener: ListenerConfig::default(),
            local_address: None,
        }
    }
}

/// Refresh session id and timeout from a response's `Session` header.
///
/// A malformed header is logged and ignored.
pub(crate) fn apply_session_header(
    info: &StateMutex<SessionInfo>,
    response: &RtspResponse,
    logger: &SharedLogger,
    verb: &str,
) {
    let Some(value) = response.header("Session") else {
        if info.lock().session_id.is_some() {
            logger.warn(&format!("{} response has no Session header", verb));
        }
        return;
    };

    match SessionHeader::parse(value) {
        Some(header) => {
            let mut info = info.lock();
            info.session_id = Some(header.id);
            info.timeout = header.timeout;
        }
        None => logger.error(&format!(
            "{} response Session header '{}' not recognised",
            verb, value
        )),
    }
}

/// One tuning session with a SAT>IP server.
///
/// The connection is shared with the keep-alive task, so requests are
/// serialized through an async mutex.
pub struct RtspSession<T: RtspTransport + 'static = RtspConnection> {
    device: Device,
    base_url: String,
    transport: Arc<Mutex<T>>,
    config: SessionConfig,
    logger: SharedLogger,
    info: Arc<StateMutex<SessionInfo>>,
    state: SessionState,
    remote_closed: Arc<AtomicBool>,
    keepalive: Option<KeepAlive>,
    listener: Option<RtcpListener>,
    pump: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl RtspSession<RtspConnection> {
    /// Session over a TCP connection to the device's RTSP port.
    pub fn new(device: Device, config: SessionConfig) -> Self {
        let logger = TracingLogger::shared("rtsp");
        let connection = RtspConnection::new(device.host.clone(), device.rtsp_port)
            .with_read_timeout(config.read_timeout)
            .with_logger(logger.clone());
        Self::with_transport(device, connection, config, logger)
    }
}

impl<T: RtspTransport + 'static> RtspSession<T> {
    pub fn with_transport(
        device: Device,
        transport: T,
        config: SessionConfig,
        logger: SharedLogger,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            base_url: device.rtsp_base_url(),
            device,
            transport: Arc::new(Mutex::new(transport)),
            config,
            logger,
            info: Arc::new(StateMutex::new(SessionInfo::default())),
            state: SessionState::Idle,
            remote_closed: Arc::new(AtomicBool::new(false)),
            keepalive: None,
            listener: None,
            pump: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Current state. A session closed by the server reports `Idle`.
    pub fn state(&self) -> SessionState {
        if self.remote_closed.load(Ordering::SeqCst) {
            SessionState::Idle
        } else {
            self.state
        }
    }

    /// Snapshot of the negotiated session details.
    pub fn info(&self) -> SessionInfo {
        self.info.lock().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.info.lock().session_id.clone()
    }

    pub fn stream_id(&self) -> Option<String> {
        self.info.lock().stream_id.clone()
    }

    pub fn reception(&self) -> Option<ReceptionInfo> {
        self.info.lock().reception
    }

    /// Take the event receiver. Only the first call returns `Some`.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Local address of the RTCP listener, if running.
    pub fn rtcp_local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr())
    }

    pub fn is_keepalive_running(&self) -> bool {
        self.keepalive.as_ref().map(|k| k.is_running()).unwrap_or(false)
    }

    fn stream_url(&self, stream_id: &str) -> String {
        format!("{}stream={}", self.base_url, stream_id)
    }

    async fn send(&self, request: RtspRequest) -> Result<RtspResponse> {
        let method = request.method.as_str();
        let result = self.transport.lock().await.send(request).await;
        if let Err(e) = &result {
            self.logger.error(&format!("{} request failed: {}", method, e));
        }
        result
    }

    fn check_ok(&self, verb: &str, response: &RtspResponse) -> Result<()> {
        if !response.is_ok() {
            self.logger.error(&format!(
                "{} returned {} {}",
                verb, response.status_code, response.status_text
            ));
        }
        response.ensure_ok()
    }

    /// Forget a session the server already closed, without TEARDOWN.
    async fn discard_remote_closed(&mut self) {
        if self.remote_closed.swap(false, Ordering::SeqCst) {
            self.logger.info("Discarding session closed by server");
            self.stop_background().await;
            let _ = self.transport.lock().await.close().await;
            *self.info.lock() = SessionInfo::default();
            self.state = SessionState::Idle;
        }
    }

    /// SETUP a stream with the given tuning query.
    ///
    /// Without a session this allocates client ports (unicast) and creates
    /// one; with a session it re-tunes the existing stream. On success the
    /// keep-alive task and the RTCP listener are (re)started.
    pub async fn setup(&mut self, query: &str, mode: TransportMode) -> Result<()> {
        self.discard_remote_closed().await;

        let (existing_session, existing_stream, existing_ports) = {
            let info = self.info.lock();
            (info.session_id.clone(), info.stream_id.clone(), info.client_ports)
        };

        let (uri, client_ports) = match (&existing_session, &existing_stream) {
            (Some(_), Some(stream_id)) => (
                format!("{}?{}", self.stream_url(stream_id), query),
                existing_ports,
            ),
            _ => {
                let ports = match mode {
                    TransportMode::Unicast => Some(allocate_port_pair(self.config.port_base)?),
                    TransportMode::Multicast => None,
                };
                (format!("{}?{}", self.base_url, query), ports)
            }
        };

        let request = RtspRequest::setup(uri, mode.request_header(client_ports))
            .session(existing_session.as_deref());
        let response = self.send(request).await?;

        if !response.is_ok() {
            self.logger.error(&format!(
                "Failed to tune, SETUP returned {} {}",
                response.status_code, response.status_text
            ));
            return Err(RtspError::TuningFailed(format!(
                "SETUP returned {}",
                response.status_code
            ))
            .into());
        }

        let stream_id = self.require_header(&response, "com.ses.streamID")?;
        let session_value = self.require_header(&response, "Session")?;
        let session = SessionHeader::parse(&session_value).ok_or_else(|| {
            self.logger.error(&format!(
                "Failed to tune, Session header '{}' not recognised",
                session_value
            ));
            RtspError::TuningFailed(format!("malformed Session header '{}'", session_value))
        })?;
        let transport_value = self.require_header(&response, "Transport")?;
        let transport = TransportInfo::parse(&transport_value).ok_or_else(|| {
            self.logger.error("Failed to tune, no RTP/AVP transport in SETUP response");
            RtspError::TuningFailed("no RTP/AVP transport".to_string())
        })?;

        if let (Some(requested), Some(assigned)) = (client_ports, transport.client_ports) {
            if requested != assigned {
                self.logger.warn(&format!(
                    "Server assigned client ports {} instead of {}",
                    assigned, requested
                ));
            }
        }

        {
            let mut info = self.info.lock();
            info.session_id = Some(session.id.clone());
            info.timeout = session.timeout;
            info.stream_id = Some(stream_id.clone());
            info.mode = mode;
            info.client_ports = transport.client_ports.or(client_ports);
            info.server_ports = transport.server_ports;
            info.destination = transport.destination.clone();
            info.multicast_ports = transport.multicast_ports;
            info.multicast_ttl = transport.ttl;
            info.source = transport.source.clone();
        }

        self.logger.info(&format!(
            "SETUP ok on {}: session {} stream {} timeout {}s ({})",
            self.device.host, session.id, stream_id, session.timeout, mode
        ));

        self.stop_background().await;
        self.start_background().await;
        self.state = SessionState::Ready;
        Ok(())
    }

    fn require_header(&self, response: &RtspResponse, name: &str) -> Result<String> {
        match response.header(name) {
            Some(value) => Ok(value.to_string()),
            None => {
                self.logger.error(&format!(
                    "Failed to tune, no {} header in SETUP response",
                    name
                ));
                Err(RtspError::TuningFailed(format!("no {} header", name)).into())
            }
        }
    }

    /// PLAY the stream, optionally changing the tuning query.
    pub async fn play(&mut self, query: Option<&str>) -> Result<()> {
        self.discard_remote_closed().await;

        let (session_id, stream_id) = {
            let info = self.info.lock();
            (info.session_id.clone(), info.stream_id.clone())
        };
        let (Some(session_id), Some(stream_id)) = (session_id, stream_id) else {
            self.logger.warn("PLAY without a session");
            return Err(RtspError::NoSession.into());
        };

        let uri = match query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.stream_url(&stream_id), q),
            _ => self.stream_url(&stream_id),
        };
        let response = self
            .send(RtspRequest::play(uri).session(Some(&session_id)))
            .await?;
        apply_session_header(&self.info, &response, &self.logger, "PLAY");
        self.check_ok("PLAY", &response)?;

        match response.header("RTP-Info") {
            Some(rtp_info) => self.info.lock().rtp_info = Some(rtp_info.to_string()),
            None => self.logger.warn("PLAY response has no RTP-Info header"),
        }

        self.state = SessionState::Playing;
        self.logger.info(&format!("PLAY ok, stream {}", stream_id));
        Ok(())
    }

    /// OPTIONS probe against the server root. Returns the `Public` methods.
    pub async fn options(&mut self) -> Result<Option<String>> {
        let session_id = self.session_id();
        let response = self
            .send(RtspRequest::options(self.base_url.as_str()).session(session_id.as_deref()))
            .await?;
        if session_id.is_some() {
            apply_session_header(&self.info, &response, &self.logger, "OPTIONS");
        }
        self.check_ok("OPTIONS", &response)?;

        let public = response.header("Public").map(str::to_string);
        if public.is_some() {
            self.info.lock().public_methods = public.clone();
        }
        Ok(public)
    }

    /// DESCRIBE the stream (or the server, before SETUP) and extract
    /// reception figures from the SDP.
    pub async fn describe(&mut self) -> Result<SessionDescription> {
        let (session_id, stream_id) = {
            let info = self.info.lock();
            (info.session_id.clone(), info.stream_id.clone())
        };
        let uri = match (&session_id, &stream_id) {
            (Some(_), Some(stream_id)) => self.stream_url(stream_id),
            _ => self.base_url.clone(),
        };

        let response = self
            .send(RtspRequest::describe(uri).session(session_id.as_deref()))
            .await?;
        if session_id.is_some() {
            apply_session_header(&self.info, &response, &self.logger, "DESCRIBE");
        }
        self.check_ok("DESCRIBE", &response)?;

        let sdp = response.body_text();
        let reception = ReceptionInfo::from_tuner_string(&sdp);
        match reception {
            Some(info) => {
                self.info.lock().reception = Some(info);
                let _ = self.events_tx.send(SessionEvent::ReceptionChanged(info));
            }
            None => self.logger.verbose("DESCRIBE body has no tuner status"),
        }

        Ok(SessionDescription { sdp, reception })
    }

    /// TEARDOWN the session, stop background tasks and close the connection.
    ///
    /// Safe to call in any state.
    pub async fn teardown(&mut self) -> Result<()> {
        let (session_id, stream_id) = {
            let info = self.info.lock();
            (info.session_id.clone(), info.stream_id.clone())
        };
        let remote_closed = self.remote_closed.swap(false, Ordering::SeqCst);

        self.stop_background().await;

        let mut result = Ok(());
        if let (Some(session_id), Some(stream_id), false) = (&session_id, &stream_id, remote_closed)
        {
            let request = RtspRequest::teardown(self.stream_url(stream_id)).session(Some(session_id));
            result = match self.send(request).await {
                Ok(response) if response.is_ok() => {
                    self.logger.info(&format!("TEARDOWN ok, session {}", session_id));
                    Ok(())
                }
                Ok(response) => {
                    self.logger.warn(&format!(
                        "TEARDOWN returned {} {}",
                        response.status_code, response.status_text
                    ));
                    Ok(())
                }
                Err(e) => Err(e),
            };
        }

        if let Err(e) = self.transport.lock().await.close().await {
            self.logger.warn(&format!("Closing RTSP connection failed: {}", e));
        }
        *self.info.lock() = SessionInfo::default();
        self.state = SessionState::Idle;
        result
    }

    async fn start_background(&mut self) {
        let info = self.info();

        let (rtcp_tx, rtcp_rx) = mpsc::unbounded_channel();
        let listener_target = match info.mode {
            TransportMode::Unicast => info.client_ports.map(|ports| {
                (ListenerMode::Unicast { address: self.config.local_address }, ports.rtcp)
            }),
            TransportMode::Multicast => {
                let group = info
                    .destination
                    .as_deref()
                    .and_then(|d| d.parse::<Ipv4Addr>().ok());
                match (group, info.multicast_ports) {
                    (Some(group), Some(ports)) => {
                        Some((ListenerMode::Multicast { group }, ports.rtcp))
                    }
                    _ => {
                        self.logger.warn(
                            "Multicast SETUP response lacks group or ports, no RTCP listener",
                        );
                        None
                    }
                }
            }
        };

        if let Some((mode, port)) = listener_target {
            match RtcpListener::start(mode, port, self.config.listener, self.logger.clone(), rtcp_tx)
                .await
            {
                Ok(listener) => {
                    self.pump = Some(spawn_event_pump(
                        rtcp_rx,
                        self.info.clone(),
                        self.remote_closed.clone(),
                        self.events_tx.clone(),
                        self.logger.clone(),
                    ));
                    self.listener = Some(listener);
                }
                Err(e) => self
                    .logger
                    .error(&format!("RTCP listener on port {} failed: {}", port, e)),
            }
        }

        self.keepalive = Some(KeepAlive::start(
            self.transport.clone(),
            self.base_url.clone(),
            self.info.clone(),
            self.remote_closed.clone(),
            self.config.keepalive_margin,
            self.logger.clone(),
        ));
    }

    async fn stop_background(&mut self) {
        if let Some(mut keepalive) = self.keepalive.take() {
            if !keepalive.stop(self.config.read_timeout).await {
                // An abandoned OPTIONS leaves its response unread on the stream.
                let _ = self.transport.lock().await.close().await;
            }
        }
        if let Some(mut listener) = self.listener.take() {
            listener.stop().await;
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl<T: RtspTransport + 'static> Drop for RtspSession<T> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.info.lock().session_id.is_some() {
            self.logger.warn("RTSP session dropped without TEARDOWN");
        }
    }
}

/// Forward RTCP events to the session until BYE or the listener ends.
fn spawn_event_pump(
    mut rtcp_rx: mpsc::UnboundedReceiver<RtcpEvent>,
    info: Arc<StateMutex<SessionInfo>>,
    remote_closed: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    logger: SharedLogger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rtcp_rx.recv().await {
            match event {
                RtcpEvent::Reception(reception) => {
                    info.lock().reception = Some(reception);
                    let _ = events_tx.send(SessionEvent::ReceptionChanged(reception));
                }
                RtcpEvent::Packet(packet) => {
                    logger.verbose(&format!("RTCP packet type {}", packet.packet_type()));
                }
                RtcpEvent::Bye => {
                    logger.info("Server ended the session (RTCP BYE)");
                    remote_closed.store(true, Ordering::SeqCst);
                    let _ = events_tx.send(SessionEvent::RemoteClosed);
                    break;
                }
            }
        }
    })
}
