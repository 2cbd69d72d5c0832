//! RTSP request formatting.

use std::collections::HashMap;
use std::fmt::Write;

/// RTSP methods used by a SAT>IP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspMethod {
    Options,
    Describe,
    Setup,
    Play,
    Teardown,
}

/// RTSP request builder.
#[derive(Debug, Clone)]
pub struct RtspRequest {
    pub method: RtspMethod,
    pub uri: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl RtspRequest {
    pub fn new(method: RtspMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach the `Session` header when a session exists.
    pub fn session(self, session_id: Option<&str>) -> Self {
        match session_id {
            Some(id) if !id.is_empty() => self.header("Session", id),
            _ => self,
        }
    }

    /// Serialize to wire format.
    ///
    /// Format:
    /// ```text
    /// METHOD URI RTSP/1.0\r\n
    /// CSeq: N\r\n
    /// Content-Length: M\r\n  (if body present)
    /// Header: Value\r\n
    /// ...
    /// \r\n
    /// [body]
    /// ```
    pub fn serialize(&self, cseq: u32) -> Vec<u8> {
        let mut head = String::new();

        // Writing into a String cannot fail.
        let _ = write!(head, "{} {} RTSP/1.0\r\n", self.method.as_str(), self.uri);
        let _ = write!(head, "CSeq: {}\r\n", cseq);

        if let Some(ref body) = self.body {
            let _ = write!(head, "Content-Length: {}\r\n", body.len());
        }

        // Other headers (sorted for consistent output in tests)
        let mut sorted_headers: Vec<_> = self.headers.iter().collect();
        sorted_headers.sort_by(|a, b| a.0.cmp(b.0));

        for (key, value) in sorted_headers {
            let _ = write!(head, "{}: {}\r\n", key, value);
        }

        head.push_str("\r\n");

        let mut out = head.into_bytes();
        if let Some(ref body) = self.body {
            out.extend_from_slice(body);
        }
        out
    }

    // Factory methods for SAT>IP requests

    pub fn options(uri: impl Into<String>) -> Self {
        Self::new(RtspMethod::Options, uri)
    }

    pub fn describe(uri: impl Into<String>) -> Self {
        Self::new(RtspMethod::Describe, uri).header("Accept", "application/sdp")
    }

    pub fn setup(uri: impl Into<String>, transport: impl Into<String>) -> Self {
        Self::new(RtspMethod::Setup, uri).header("Transport", transport)
    }

    pub fn play(uri: impl Into<String>) -> Self {
        Self::new(RtspMethod::Play, uri)
    }

    pub fn teardown(uri: impl Into<String>) -> Self {
        Self::new(RtspMethod::Teardown, uri)
    }
}

impl RtspMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Describe => "DESCRIBE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Teardown => "TEARDOWN",
        }
    }
}
