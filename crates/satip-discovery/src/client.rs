//! SSDP discovery client.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use satip_core::error::{DiscoveryError, Result};
use satip_core::{Device, DeviceId, SharedLogger, TracingLogger};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::description::{
    device_from_location, DescriptionFetcher, DeviceDescription, HttpFetcher,
    DEFAULT_FETCH_TIMEOUT,
};
use crate::message::{
    search_request, Announcement, SsdpMessage, SATIP_DEVICE_TYPE, SSDP_MULTICAST_ADDR, SSDP_PORT,
};
use crate::registry::DeviceRegistry;
use crate::traits::{Discovery, DiscoveryEvent, EventStream};

const RECV_BUFFER_SIZE: usize = 4096;

/// Discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Device type searched for and accepted in announcements.
    pub search_target: String,
    /// M-SEARCH copies sent per search.
    pub search_repeats: u32,
    /// Gap between M-SEARCH copies.
    pub search_interval: Duration,
    /// `MX` value of M-SEARCH.
    pub mx: u8,
    /// Where M-SEARCH is sent.
    pub search_addr: SocketAddr,
    /// Local address of the unicast listener.
    pub bind_address: IpAddr,
    /// Join the SSDP group to hear NOTIFY announcements.
    pub multicast: bool,
    pub multicast_port: u16,
    pub fetch_timeout: Duration,
    /// How long a single receive waits before re-checking the stop signal.
    pub receive_timeout: Duration,
    /// How long `stop` waits for each listener before aborting it.
    pub join_deadline: Duration,
    pub event_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            search_target: SATIP_DEVICE_TYPE.to_string(),
            search_repeats: 3,
            search_interval: Duration::from_millis(33),
            mx: 2,
            search_addr: SocketAddr::V4(SocketAddrV4::new(SSDP_MULTICAST_ADDR, SSDP_PORT)),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            multicast: true,
            multicast_port: SSDP_PORT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            receive_timeout: Duration::from_millis(400),
            join_deadline: Duration::from_millis(800),
            event_capacity: 64,
        }
    }
}

/// State reachable from the listener tasks.
struct Shared<F> {
    target: String,
    registry: DeviceRegistry,
    fetcher: F,
    events_tx: broadcast::Sender<DiscoveryEvent>,
    logger: SharedLogger,
}

impl<F: DescriptionFetcher + 'static> Shared<F> {
    /// Apply one datagram to the registry. Returns the description fetch
    /// task when the datagram announced a new device.
    fn handle_message(self: &Arc<Self>, text: &str, from: SocketAddr) -> Option<JoinHandle<()>> {
        let Some(message) = SsdpMessage::parse(text) else {
            self.logger.verbose(&format!("Ignoring non-SSDP datagram from {}", from));
            return None;
        };

        match message.announcement(&self.target)? {
            Announcement::ByeBye { id } => {
                if self.registry.remove(&id) {
                    self.logger.info(&format!("Device {} left", id));
                    let _ = self.events_tx.send(DiscoveryEvent::Lost(id));
                }
                None
            }
            Announcement::Alive { id, location } => {
                if !self.registry.reserve(&id) {
                    return None;
                }
                self.logger
                    .verbose(&format!("New device {} at {} (from {})", id, location, from));
                let shared = Arc::clone(self);
                Some(tokio::spawn(async move {
                    shared.register(id, location).await;
                }))
            }
        }
    }

    async fn register(&self, id: DeviceId, location: String) {
        let mut device = device_from_location(id, &location);

        match self.fetcher.fetch(&location).await {
            Ok(xml) => match DeviceDescription::parse(&xml) {
                Ok(description) => description.apply_to(&mut device),
                Err(e) => self.logger.error(&format!(
                    "Unreadable description for {} at {}: {}",
                    device.id, location, e
                )),
            },
            Err(e) => self.logger.error(&format!(
                "Description fetch for {} failed: {}",
                device.id, e
            )),
        }

        if self.registry.complete(device.clone()) {
            self.logger.info(&format!("Device found: {}", device));
            let _ = self.events_tx.send(DiscoveryEvent::Found(device));
        }
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    unicast: Arc<UdpSocket>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// SSDP client listening for SAT>IP servers.
///
/// Two listeners run while started: one on the SSDP multicast group for
/// NOTIFY announcements, one on a private port for search responses.
pub struct SsdpClient<F = HttpFetcher> {
    config: DiscoveryConfig,
    shared: Arc<Shared<F>>,
    running: Mutex<Option<Running>>,
}

impl SsdpClient<HttpFetcher> {
    /// Create a client that fetches descriptions over HTTP.
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.fetch_timeout)?;
        Ok(Self::with_fetcher(config, fetcher, TracingLogger::shared("ssdp")))
    }
}

impl<F: DescriptionFetcher + 'static> SsdpClient<F> {
    pub fn with_fetcher(config: DiscoveryConfig, fetcher: F, logger: SharedLogger) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            target: config.search_target.clone(),
            registry: DeviceRegistry::new(),
            fetcher,
            events_tx,
            logger,
        });
        Self {
            config,
            shared,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Local address of the unicast listener while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .as_ref()
            .and_then(|r| r.unicast.local_addr().ok())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Registered device with this uuid, with or without `uuid:`.
    pub fn find_by_udn(&self, uuid: &str) -> Option<Device> {
        self.shared.registry.find(uuid)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.shared.registry.all()
    }

    /// Bind both listeners and start their receive loops.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let logger = &self.shared.logger;
        let unicast = bind_unicast(SocketAddr::new(self.config.bind_address, 0))
            .map_err(|e| DiscoveryError::Socket(format!("unicast listener: {}", e)))?;
        let unicast = Arc::new(UdpSocket::from_std(unicast)?);
        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = Vec::new();

        if let Ok(addr) = unicast.local_addr() {
            logger.info(&format!("SSDP unicast listener on {}", addr));
        }
        tasks.push((
            "unicast",
            self.spawn_listener(Arc::clone(&unicast), None, shutdown_tx.subscribe()),
        ));

        if self.config.multicast {
            match bind_multicast(SSDP_MULTICAST_ADDR, self.config.multicast_port)
                .and_then(UdpSocket::from_std)
            {
                Ok(socket) => {
                    logger.info(&format!(
                        "SSDP multicast listener joined {}:{}",
                        SSDP_MULTICAST_ADDR, self.config.multicast_port
                    ));
                    tasks.push((
                        "multicast",
                        self.spawn_listener(
                            Arc::new(socket),
                            Some(SSDP_MULTICAST_ADDR),
                            shutdown_tx.subscribe(),
                        ),
                    ));
                }
                Err(e) => logger.error(&format!(
                    "Cannot join SSDP group on port {}, announcements will be missed: {}",
                    self.config.multicast_port, e
                )),
            }
        }

        let mut running = self.running.lock();
        if running.is_some() {
            // Lost a race with a concurrent start.
            let _ = shutdown_tx.send(true);
            for (_, task) in tasks {
                task.abort();
            }
            return Ok(());
        }
        *running = Some(Running {
            shutdown_tx,
            unicast,
            tasks,
        });
        Ok(())
    }

    /// Send M-SEARCH for `target` from the unicast listener.
    pub async fn find_by_type(&self, target: &str) -> Result<()> {
        let socket = self
            .running
            .lock()
            .as_ref()
            .map(|r| Arc::clone(&r.unicast))
            .ok_or(DiscoveryError::Stopped)?;

        let request = search_request(target, self.config.mx);
        for attempt in 0..self.config.search_repeats {
            if attempt > 0 {
                tokio::time::sleep(self.config.search_interval).await;
            }
            socket
                .send_to(request.as_bytes(), self.config.search_addr)
                .await
                .map_err(|e| DiscoveryError::Socket(format!("M-SEARCH send: {}", e)))?;
        }
        self.shared.logger.verbose(&format!(
            "Sent {} M-SEARCH for {} to {}",
            self.config.search_repeats, target, self.config.search_addr
        ));
        Ok(())
    }

    /// Start if needed, search, wait `timeout`, and return the registry.
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<Device>> {
        self.start().await?;
        let target = self.config.search_target.clone();
        self.find_by_type(&target).await?;
        tokio::time::sleep(timeout).await;
        Ok(self.devices())
    }

    /// Stream of events from now on. Lagged events are skipped.
    pub fn event_stream(&self) -> EventStream {
        let stream = BroadcastStream::new(self.subscribe()).filter_map(|event| event.ok());
        Box::new(Box::pin(stream))
    }

    /// Signal both listeners, wait for each up to the join deadline, then abort.
    ///
    /// The registry is kept. Safe to call more than once.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);

        for (name, mut handle) in running.tasks {
            match tokio::time::timeout(self.config.join_deadline, &mut handle).await {
                Ok(Ok(())) => self
                    .shared
                    .logger
                    .verbose(&format!("SSDP {} listener stopped", name)),
                Ok(Err(e)) => self
                    .shared
                    .logger
                    .error(&format!("SSDP {} listener task failed: {}", name, e)),
                Err(_) => {
                    self.shared.logger.warn(&format!(
                        "SSDP {} listener did not stop within {:?}, aborting",
                        name, self.config.join_deadline
                    ));
                    handle.abort();
                }
            }
        }
    }

    /// Feed one datagram through the announcement rules.
    pub(crate) fn handle_message(&self, text: &str, from: SocketAddr) -> Option<JoinHandle<()>> {
        self.shared.handle_message(text, from)
    }

    fn spawn_listener(
        &self,
        socket: Arc<UdpSocket>,
        group: Option<Ipv4Addr>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let receive_timeout = self.config.receive_timeout;

        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                tokio::select! {
                    result = tokio::time::timeout(receive_timeout, socket.recv_from(&mut buf)) => {
                        match result {
                            Err(_) => continue,
                            Ok(Err(e)) => {
                                shared.logger.error(&format!("SSDP receive failed: {}", e));
                                break;
                            }
                            Ok(Ok((len, from))) => {
                                let text = String::from_utf8_lossy(&buf[..len]);
                                shared.handle_message(&text, from);
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

            if let Some(group) = group {
                if let Err(e) = socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                    shared
                        .logger
                        .warn(&format!("Failed to leave multicast group {}: {}", group, e));
                }
            }
        })
    }
}

impl<F> Drop for SsdpClient<F> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown_tx.send(true);
            for (_, task) in running.tasks {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl<F: DescriptionFetcher + 'static> Discovery for SsdpClient<F> {
    async fn start(&self) -> Result<()> {
        SsdpClient::start(self).await
    }

    async fn find_by_type(&self, target: &str) -> Result<()> {
        SsdpClient::find_by_type(self, target).await
    }

    async fn scan(&self, timeout: Duration) -> Result<Vec<Device>> {
        SsdpClient::scan(self, timeout).await
    }

    fn events(&self) -> EventStream {
        self.event_stream()
    }

    fn find_by_udn(&self, uuid: &str) -> Option<Device> {
        SsdpClient::find_by_udn(self, uuid)
    }

    fn devices(&self) -> Vec<Device> {
        SsdpClient::devices(self)
    }

    async fn stop(&self) {
        SsdpClient::stop(self).await
    }
}

fn bind_unicast(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&addr.into())?;
    socket.set_multicast_ttl_v4(4)?;
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
