//! RTSP connection management.

use std::time::Duration;

use async_trait::async_trait;
use satip_core::error::{Error as CoreError, Result, RtspError};
use satip_core::{SharedLogger, TracingLogger};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::traits::RtspTransport;
use crate::{RtspRequest, RtspResponse};

/// How long to wait for a complete response.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest response body accepted. SDP from a tuner is a few hundred bytes.
pub const MAX_BODY_LEN: usize = 64 * 1024;

/// RTSP connection to a SAT>IP server.
///
/// The TCP stream is opened on the first request and dropped whenever the
/// server answers with `Connection: close`. CSeq numbering carries over
/// reconnects.
pub struct RtspConnection {
    host: String,
    port: u16,
    cseq: u32,
    read_timeout: Duration,
    stream: Option<BufReader<TcpStream>>,
    logger: SharedLogger,
}

impl RtspConnection {
    /// Create new connection (not yet connected).
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            cseq: 0,
            read_timeout: DEFAULT_READ_TIMEOUT,
            stream: None,
            logger: TracingLogger::shared("rtsp"),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Connect to the server.
    pub async fn connect(&mut self) -> Result<()> {
        let stream = match TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                self.logger.verbose(&format!(
                    "RTSP connect to {} failed: {}",
                    self.authority(),
                    e
                ));
                return Err(RtspError::ConnectionRefused.into());
            }
        };
        stream.set_nodelay(true)?;
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    /// Send request and receive response, connecting first if needed.
    pub async fn send(&mut self, request: RtspRequest) -> Result<RtspResponse> {
        if self.stream.is_none() {
            self.connect().await?;
        }

        let cseq = self.next_cseq();
        let request_data = request.serialize(cseq);
        self.logger.verbose(&format!(
            "RTSP -> {} {} (cseq={}, body_len={})",
            request.method.as_str(),
            request.uri,
            cseq,
            request.body.as_ref().map(|b| b.len()).unwrap_or(0)
        ));

        let read_timeout = self.read_timeout;
        let stream = self.stream.as_mut().ok_or(RtspError::ConnectionClosed)?;
        let exchange = async {
            stream.get_mut().write_all(&request_data).await?;
            stream.get_mut().flush().await?;
            read_response(stream).await
        };

        let response_data = match timeout(read_timeout, exchange).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                self.stream = None;
                return Err(e);
            }
            Err(_) => {
                self.stream = None;
                return Err(CoreError::Timeout);
            }
        };

        let response = RtspResponse::parse(&response_data)?;
        self.logger.verbose(&format!(
            "RTSP <- {} {} (cseq={:?})",
            response.status_code,
            response.status_text,
            response.cseq()
        ));

        // Verify CSeq matches (warning only, don't fail)
        if response.cseq() != Some(cseq) {
            self.logger.warn(&format!(
                "CSeq mismatch: expected {}, got {:?}",
                cseq,
                response.cseq()
            ));
        }

        if response.closes_connection() {
            self.logger.verbose(&format!(
                "{} closed RTSP connection after cseq={}",
                self.authority(),
                cseq
            ));
            self.stream = None;
        }

        Ok(response)
    }

    /// Get next CSeq number.
    pub fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    /// Close the connection.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
        }
        Ok(())
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// `host:port` of the server.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read one RTSP response: headers up to the blank line, then
/// `Content-Length` bytes of body.
async fn read_response(reader: &mut BufReader<TcpStream>) -> Result<Vec<u8>> {
    let mut response_data = Vec::new();

    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(RtspError::ConnectionClosed.into());
        }
        response_data.extend_from_slice(line.as_bytes());

        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    let header_str = String::from_utf8_lossy(&response_data);
    let content_length = header_str
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    if content_length > MAX_BODY_LEN {
        return Err(RtspError::InvalidResponse(format!(
            "Content-Length {} exceeds {} bytes",
            content_length, MAX_BODY_LEN
        ))
        .into());
    }
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        response_data.extend_from_slice(&body);
    }

    Ok(response_data)
}

#[async_trait]
impl RtspTransport for RtspConnection {
    async fn send(&mut self, request: RtspRequest) -> Result<RtspResponse> {
        self.send(request).await
    }

    fn is_connected(&self) -> bool {
        self.is_connected()
    }

    async fn close(&mut self) -> Result<()> {
        self.close().await
    }
}
