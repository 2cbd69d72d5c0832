//! Periodic OPTIONS probe that keeps a session from expiring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as StateMutex;
use satip_core::SharedLogger;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::session::{apply_session_header, SessionInfo};
use crate::traits::RtspTransport;
use crate::RtspRequest;

/// Shortest interval between probes.
pub const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_secs(1);

/// Probe interval for a session timeout in seconds.
pub fn keepalive_period(timeout_secs: u32, margin: Duration) -> Duration {
    Duration::from_secs(u64::from(timeout_secs))
        .saturating_sub(margin)
        .max(MIN_KEEPALIVE_PERIOD)
}

/// Handle to a running keep-alive task.
pub(crate) struct KeepAlive {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    logger: SharedLogger,
}

impl KeepAlive {
    /// Start probing `uri` on the shared transport.
    ///
    /// The period is recomputed from the session timeout before every
    /// probe, so a refreshed `;timeout=` takes effect on the next round.
    pub fn start<T: RtspTransport + 'static>(
        transport: Arc<Mutex<T>>,
        uri: String,
        info: Arc<StateMutex<SessionInfo>>,
        remote_closed: Arc<AtomicBool>,
        margin: Duration,
        logger: SharedLogger,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task_logger = logger.clone();
        let handle = tokio::spawn(async move {
            let logger = task_logger;
            loop {
                let period = keepalive_period(info.lock().timeout, margin);

                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if *shutdown_rx.borrow() {
                    break;
                }

                if remote_closed.load(Ordering::SeqCst) {
                    logger.verbose("Keep-alive stopping, session closed by server");
                    break;
                }

                let current = info.lock().session_id.clone();
                let Some(session_id) = current else {
                    break;
                };

                let request = RtspRequest::options(uri.as_str()).session(Some(&session_id));
                let result = transport.lock().await.send(request).await;
                match result {
                    Ok(response) if response.is_ok() => {
                        apply_session_header(&info, &response, &logger, "OPTIONS");
                    }
                    Ok(response) => logger.warn(&format!(
                        "Keep-alive OPTIONS returned {} {}",
                        response.status_code, response.status_text
                    )),
                    Err(e) => logger.warn(&format!("Keep-alive OPTIONS failed: {}", e)),
                }
            }
        });

        Self {
            shutdown_tx,
            handle: Some(handle),
            logger,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the task and wait up to `deadline` for it to exit.
    ///
    /// An OPTIONS already sent is allowed to read its response. Returns false
    /// when the task had to be aborted; the transport may then hold an
    /// unread response and must be reset by the caller.
    pub async fn stop(&mut self, deadline: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        let Some(mut handle) = self.handle.take() else {
            return true;
        };

        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.logger.error(&format!("Keep-alive task failed: {}", e));
                true
            }
            Err(_) => {
                self.logger.warn(&format!(
                    "Keep-alive did not stop within {:?}, aborting",
                    deadline
                ));
                handle.abort();
                let _ = handle.await;
                false
            }
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
