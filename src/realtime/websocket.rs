//! WebSocket transport
//!
//! Provides the production transport with:
//! - Bearer token in the handshake, re-read on every reconnect
//! - Cookies from a shared jar on credentialed handshakes
//! - Handshake timeout
//! - Bounded reconnection with capped exponential backoff

use std::sync::Arc;

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::cookie::{CookieStore, Jar};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{
            header::{AUTHORIZATION, COOKIE},
            HeaderValue,
        },
        Error as WsError, Message as WsMessage,
    },
};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::transport::{ConnectOptions, Transport, TransportEvent, TransportSink};
use crate::config::TransportKind;
use crate::error::{Error, Result};
use crate::protocol::Frame;

/// Disconnect reasons reported to the manager
pub const REASON_CLIENT: &str = "io client disconnect";
pub const REASON_SERVER: &str = "io server disconnect";
pub const REASON_CLOSED: &str = "transport close";
pub const REASON_ERROR: &str = "transport error";

/// Handle on a running connection task
struct Session {
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Transport speaking JSON frames over a WebSocket
#[derive(Default)]
pub struct WebSocketTransport {
    session: Mutex<Option<Session>>,
    cookies: Option<Arc<Jar>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send cookies from `jar` on handshakes opened with credentials
    pub fn with_cookie_jar(mut self, jar: Arc<Jar>) -> Self {
        self.cookies = Some(jar);
        self
    }

    /// Whether a connection task is currently running
    pub fn is_running(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| !s.task.is_finished())
            .unwrap_or(false)
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, options: ConnectOptions, sink: TransportSink) -> Result<()> {
        if !options.transports.contains(&TransportKind::Websocket) {
            return Err(Error::Config(
                "WebSocket transport is not enabled in realtime.transports".to_string(),
            ));
        }

        let url = Url::parse(&options.url)
            .map_err(|e| Error::connection_failed(&options.url, e.to_string()))?;

        // Replace any previous session
        self.close();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let cookies = if options.with_credentials {
            self.cookies.clone()
        } else {
            None
        };

        let task = tokio::spawn(run_session(
            url,
            options,
            cookies,
            sink,
            outbound_rx,
            shutdown_rx,
        ));

        *self.session.lock() = Some(Session {
            outbound: outbound_tx,
            shutdown: Some(shutdown_tx),
            task,
        });

        Ok(())
    }

    fn send(&self, frame: Frame) -> Result<()> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(Error::NotConnected)?;
        session
            .outbound
            .send(frame)
            .map_err(|_| Error::NotConnected)
    }

    fn close(&self) {
        if let Some(mut session) = self.session.lock().take() {
            if let Some(shutdown) = session.shutdown.take() {
                let _ = shutdown.send(());
            }
            debug!("WebSocket session closed");
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.task.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection Loop
// ─────────────────────────────────────────────────────────────────

/// How a live connection ended
enum PumpEnd {
    /// Closed on our side; do not reconnect
    ClientClosed,
    /// Dropped by the server or the network
    Dropped(String),
}

/// Connect, pump, and reconnect until closed or out of attempts
async fn run_session(
    url: Url,
    options: ConnectOptions,
    cookies: Option<Arc<Jar>>,
    sink: TransportSink,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut backoff = ExponentialBackoff {
        current_interval: options.reconnection_delay,
        initial_interval: options.reconnection_delay,
        max_interval: options.reconnection_delay_max,
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut has_connected = false;
    let mut failures: u32 = 0;
    let mut handshakes: u32 = 0;

    loop {
        info!(url = %url, attempt = failures + 1, "Connecting to real-time server");

        handshakes += 1;
        let token = options.handshake_token(handshakes);
        let cookie = cookies.as_deref().and_then(|jar| handshake_cookies(jar, &url));
        let handshake = connect(&url, token.as_deref(), cookie);

        let attempt = tokio::select! {
            result = tokio::time::timeout(options.timeout, handshake) => result,
            _ = &mut shutdown_rx => {
                info!("Connection attempt cancelled");
                return;
            }
        };

        match attempt {
            Ok(Ok(ws_stream)) => {
                backoff.reset();
                let socket_id = Uuid::new_v4().to_string();

                if has_connected {
                    info!(socket_id = %socket_id, attempt = failures + 1, "Reconnected");
                    sink.emit(TransportEvent::Reconnected {
                        attempt: failures + 1,
                        socket_id,
                    });
                } else {
                    info!(socket_id = %socket_id, "WebSocket connection established");
                    sink.emit(TransportEvent::Connected { socket_id });
                }
                has_connected = true;
                failures = 0;

                match pump(ws_stream, &sink, &mut outbound_rx, &mut shutdown_rx).await {
                    PumpEnd::ClientClosed => {
                        sink.emit(TransportEvent::Disconnected {
                            reason: REASON_CLIENT.to_string(),
                        });
                        return;
                    }
                    PumpEnd::Dropped(reason) => {
                        warn!(reason = %reason, "Connection dropped");
                        sink.emit(TransportEvent::Disconnected { reason });
                    }
                }

                if !options.reconnection {
                    return;
                }
            }
            Ok(Err(e)) => {
                failures += 1;
                error!(error = %e, attempt = failures, "Failed to connect");
                report_failure(&sink, has_connected, e.to_string());
            }
            Err(_) => {
                failures += 1;
                let message = format!("handshake timed out after {}ms", options.timeout.as_millis());
                error!(attempt = failures, "{}", message);
                report_failure(&sink, has_connected, message);
            }
        }

        if failures > 0 {
            if !options.reconnection {
                return;
            }
            if failures >= options.reconnection_attempts {
                error!(attempts = failures, "Max reconnection attempts reached");
                return;
            }
        }

        let delay = backoff
            .next_backoff()
            .unwrap_or(options.reconnection_delay_max);

        info!(delay_ms = delay.as_millis() as u64, "Waiting before reconnection");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut shutdown_rx => {
                info!("Reconnection cancelled");
                return;
            }
        }
    }
}

fn report_failure(sink: &TransportSink, has_connected: bool, message: String) {
    if has_connected {
        sink.emit(TransportEvent::ReconnectError {
            message: message.clone(),
        });
    }
    sink.emit(TransportEvent::ConnectError { message });
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Cookies `jar` holds for the HTTP origin behind `url`
fn handshake_cookies(jar: &Jar, url: &Url) -> Option<HeaderValue> {
    let mut origin = url.clone();
    let scheme = if url.scheme() == "wss" { "https" } else { "http" };
    origin.set_scheme(scheme).ok()?;

    let value = jar.cookies(&origin)?;
    HeaderValue::from_bytes(value.as_bytes()).ok()
}

/// Perform the handshake, presenting `token` as a bearer credential
async fn connect(url: &Url, token: Option<&str>, cookie: Option<HeaderValue>) -> Result<WsStream> {
    let mut request = url.as_str().into_client_request()?;

    if let Some(cookie) = cookie {
        request.headers_mut().insert(COOKIE, cookie);
    }

    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::ProtocolMalformed {
                message: format!("token is not a valid header value: {}", e),
            })?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (ws_stream, _response) = connect_async(request).await?;
    Ok(ws_stream)
}

/// Shuttle frames between the socket and the sink until the connection ends
async fn pump(
    ws_stream: WsStream,
    sink: &TransportSink,
    outbound_rx: &mut mpsc::UnboundedReceiver<Frame>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> PumpEnd {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => match Frame::from_json(&text) {
                        Ok(frame) => {
                            debug!(event = %frame.event, "Received frame");
                            sink.emit(TransportEvent::Message(frame));
                        }
                        Err(e) => warn!(error = %e, "Failed to parse frame"),
                    },
                    Some(Ok(WsMessage::Binary(data))) => match Frame::from_json_bytes(&data) {
                        Ok(frame) => sink.emit(TransportEvent::Message(frame)),
                        Err(e) => warn!(error = %e, "Failed to parse binary frame"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = write.send(WsMessage::Pong(data)).await {
                            return PumpEnd::Dropped(format!("{}: {}", REASON_ERROR, e));
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(frame = ?frame, "Received close frame");
                        return PumpEnd::Dropped(REASON_SERVER.to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(WsError::ConnectionClosed)) | None => {
                        return PumpEnd::Dropped(REASON_CLOSED.to_string());
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        return PumpEnd::Dropped(format!("{}: {}", REASON_ERROR, e));
                    }
                }
            }

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return PumpEnd::ClientClosed;
                };
                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(event = %frame.event, error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(json)).await {
                    return PumpEnd::Dropped(format!("{}: {}", REASON_ERROR, e));
                }
            }

            _ = &mut *shutdown_rx => {
                debug!("Closing WebSocket");
                let _ = write.send(WsMessage::Close(None)).await;
                return PumpEnd::ClientClosed;
            }
        }
    }
}
