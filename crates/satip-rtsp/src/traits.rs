//! Traits for RTSP transport abstraction.

use async_trait::async_trait;
use satip_core::error::Result;

use crate::{RtspRequest, RtspResponse};

/// RTSP transport trait for testability.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait RtspTransport: Send + Sync {
    /// Send RTSP request and receive response.
    async fn send(&mut self, request: RtspRequest) -> Result<RtspResponse>;

    /// Check if connected.
    fn is_connected(&self) -> bool;

    /// Close the connection.
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RtspMethod;
    use std::collections::HashMap;

    fn setup_reply() -> RtspResponse {
        let mut headers = HashMap::new();
        headers.insert("Session".to_string(), "12ab;timeout=60".to_string());
        headers.insert("com.ses.streamID".to_string(), "3".to_string());
        RtspResponse {
            status_code: 200,
            status_text: "OK".to_string(),
            headers,
            body: None,
        }
    }

    #[tokio::test]
    async fn mock_answers_setup_through_trait_object() {
        let mut mock = MockRtspTransport::new();
        mock.expect_send()
            .withf(|request| {
                request.method == RtspMethod::Setup
                    && request.uri.contains("?src=1&freq=11494")
                    && request.headers.get("Transport").map(String::as_str)
                        == Some("RTP/AVP;unicast;client_port=40000-40001")
            })
            .times(1)
            .returning(|_request| Box::pin(async { Ok(setup_reply()) }));

        let mut transport: Box<dyn RtspTransport> = Box::new(mock);
        let request = RtspRequest::setup(
            "rtsp://10.0.0.5:554/?src=1&freq=11494",
            "RTP/AVP;unicast;client_port=40000-40001",
        );
        let response = transport.send(request).await.unwrap();

        assert!(response.is_ok());
        assert_eq!(response.header("com.ses.streamID"), Some("3"));
    }

    #[tokio::test]
    async fn mock_close_after_refused_send() {
        let mut mock = MockRtspTransport::new();
        mock.expect_send().returning(|_request| {
            Box::pin(async {
                Err::<RtspResponse, satip_core::Error>(
                    satip_core::error::RtspError::ConnectionRefused.into(),
                )
            })
        });
        mock.expect_is_connected().return_const(false);
        mock.expect_close()
            .times(1)
            .returning(|| Box::pin(async { Ok(()) }));

        let err = mock.send(RtspRequest::options("rtsp://10.0.0.5:554/")).await;
        assert!(err.is_err());
        assert!(!mock.is_connected());
        mock.close().await.unwrap();
    }
}
