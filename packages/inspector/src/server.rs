//! Listener lifecycle for the catch-all capture server.

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_actix_web::TracingLogger;

use crate::config::{CaptureSettings, ServerSettings};
use crate::error::{CaptureError, CaptureResult};
use crate::handlers::{capture_handler, CaptureState};
use crate::models::RequestIdGenerator;
use crate::store::RequestSink;

/// Extra time allowed for workers to exit after the grace period
const STOP_SLACK: Duration = Duration::from_secs(1);

struct RunningServer {
    handle: ServerHandle,
    task: tokio::task::JoinHandle<std::io::Result<()>>,
    port: u16,
    /// Cleared when this run's server future finishes
    running: Arc<AtomicBool>,
}

/// Capture server that can be started and stopped from any task
pub struct CaptureServer {
    settings: ServerSettings,
    capture: CaptureSettings,
    ids: Arc<RequestIdGenerator>,
    current: Mutex<Option<RunningServer>>,
}

impl CaptureServer {
    pub fn new(
        settings: ServerSettings,
        capture: CaptureSettings,
        ids: Arc<RequestIdGenerator>,
    ) -> Self {
        Self {
            settings,
            capture,
            ids,
            current: Mutex::new(None),
        }
    }

    /// Bind the first free port starting at `preferred_port` and start serving.
    ///
    /// Every parsed request is handed to `sink`. Returns the bound port; if
    /// the server is already running its current port is returned. Must be
    /// called from within a Tokio runtime.
    pub fn start(&self, preferred_port: u16, sink: Arc<dyn RequestSink>) -> CaptureResult<u16> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = current.as_ref() {
            if existing.running.load(Ordering::SeqCst) {
                warn!(port = existing.port, "Capture server is already running");
                return Ok(existing.port);
            }
        }

        let host = self.settings.host.as_str();
        let listener = bind_with_fallback(host, preferred_port, self.settings.port_attempts)?;
        let port = listener
            .local_addr()
            .map_err(|e| bind_failure(host, preferred_port, e))?
            .port();

        let state = web::Data::new(CaptureState::new(
            sink,
            self.ids.clone(),
            self.capture.clone(),
        ));

        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .wrap(TracingLogger::default())
                .default_service(web::to(capture_handler))
        })
        .workers(self.settings.workers.max(1))
        .client_request_timeout(Duration::from_millis(self.settings.client_request_timeout_ms))
        .shutdown_timeout(self.settings.shutdown_grace_secs)
        .disable_signals()
        .listen(listener)
        .map_err(|e| bind_failure(host, port, e))?
        .run();

        let handle = server.handle();
        let running = Arc::new(AtomicBool::new(true));
        let finished = running.clone();

        let task = tokio::spawn(async move {
            let result = server.await;
            finished.store(false, Ordering::SeqCst);
            if let Err(e) = &result {
                error!(port, error = %e, "Capture server exited with error");
            }
            result
        });

        info!(host = %host, port, preferred_port, "Capture server started");

        *current = Some(RunningServer {
            handle,
            task,
            port,
            running,
        });
        Ok(port)
    }

    /// Stop accepting, let in-flight requests drain within the grace period,
    /// then release the port. Calling it on a stopped server is a no-op.
    pub async fn stop(&self) {
        let stopping = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(server) = stopping else {
            debug!("Capture server already stopped");
            return;
        };

        info!(port = server.port, "Stopping capture server");
        server.handle.stop(true).await;

        let wait = Duration::from_secs(self.settings.shutdown_grace_secs) + STOP_SLACK;
        match tokio::time::timeout(wait, server.task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Capture server stopped with error"),
            Ok(Err(e)) => warn!(error = %e, "Capture server task failed"),
            Err(_) => warn!("Capture server did not exit within the grace period"),
        }

        server.running.store(false, Ordering::SeqCst);
        info!(port = server.port, "Capture server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|server| server.running.load(Ordering::SeqCst))
    }

    pub fn port(&self) -> Option<u16> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|server| server.port)
    }
}

fn bind_failure(host: &str, port: u16, source: std::io::Error) -> CaptureError {
    CaptureError::BindFailure {
        addr: format!("{host}:{port}"),
        source,
    }
}

/// Linear probing: `preferred`, `preferred + 1`, ... for `attempts` ports.
///
/// Ports that are taken or not permitted are skipped; any other bind error
/// ends the search.
pub fn bind_with_fallback(host: &str, preferred: u16, attempts: u16) -> CaptureResult<TcpListener> {
    let attempts = attempts.max(1);
    let mut last = preferred;

    for offset in 0..attempts {
        let Some(port) = preferred.checked_add(offset) else {
            break;
        };
        last = port;

        match TcpListener::bind((host, port)) {
            Ok(listener) => {
                if offset > 0 {
                    info!(preferred, port, "Preferred port unavailable, using fallback");
                }
                return Ok(listener);
            }
            Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) => {
                debug!(port, error = %e, "Port unavailable, probing next");
            }
            Err(e) => return Err(bind_failure(host, port, e)),
        }
    }

    Err(CaptureError::PortExhaustion {
        first: preferred,
        last,
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn binds_preferred_port_when_free() {
        let port = free_port();
        let listener = bind_with_fallback("127.0.0.1", port, 10).unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[test]
    fn probes_past_occupied_port() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let listener = bind_with_fallback("127.0.0.1", port, 10).unwrap();
        let bound = listener.local_addr().unwrap().port();
        assert!(bound > port && bound < port + 10);
    }

    #[test]
    fn single_attempt_on_taken_port_is_exhaustion() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind_with_fallback("127.0.0.1", port, 1).unwrap_err();
        match err {
            CaptureError::PortExhaustion {
                first,
                last,
                attempts,
            } => {
                assert_eq!(first, port);
                assert_eq!(last, port);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unresolvable_host_is_bind_failure() {
        let err = bind_with_fallback("host.invalid", 9010, 3).unwrap_err();
        assert!(matches!(err, CaptureError::BindFailure { .. }));
    }

    #[test]
    fn probing_stops_at_port_space_end() {
        let taken = TcpListener::bind(("127.0.0.1", u16::MAX));
        if taken.is_err() {
            // someone else already holds the top port; nothing to assert
            return;
        }

        let err = bind_with_fallback("127.0.0.1", u16::MAX, 5).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::PortExhaustion { last: u16::MAX, .. }
        ));
    }
}
