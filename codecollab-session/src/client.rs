//! WebSocket connection manager.
//!
//! One driver task owns the socket, the reconnect timer and the inbound
//! handler. Callers only talk to it through a command channel, so every
//! transport callback, timer firing and caller request is handled one at a
//! time, in order:
//!
//! ```text
//!  start / send / on_message / stop
//!            │  mpsc (call order)
//!            ▼
//!  ┌─────────────────────┐    event     ┌───────────┐
//!  │ driver task         │ ───────────► │ Lifecycle │
//!  │  select! {          │ ◄─────────── │ (pure)    │
//!  │    command,         │  Directive   └───────────┘
//!  │    connect result,  │
//!  │    inbound frame,   │ ───► handler(Envelope)
//!  │    reconnect timer, │
//!  │  }                  │ ───► watch<ConnectionStatus>
//!  └─────────────────────┘
//! ```
//!
//! Nothing is queued while disconnected: a `send` outside the `Open` state is
//! dropped with a warning and counted in [`ConnectionStatus::dropped_sends`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{Envelope, ProtocolError};
use crate::reconnect::{ConnectionError, ConnectionState, Directive, Lifecycle, ReconnectConfig};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingConnect = Pin<Box<dyn Future<Output = Result<Socket, String>> + Send>>;

/// Inbound message handler. Exactly one is active at a time.
pub type MessageHandler = Box<dyn FnMut(Envelope) + Send + 'static>;

/// Upper bound on the closing handshake during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connectivity snapshot published on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Reconnect attempts since the last successful open
    pub attempt: u32,
    /// Last transport error, or the terminal give-up error
    pub error: Option<ConnectionError>,
    /// Sends dropped because the connection was not open
    pub dropped_sends: u64,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            error: None,
            dropped_sends: 0,
        }
    }
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Not connected, but the manager is still trying.
    pub fn is_reconnecting(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Closed
        ) && self.terminal_error().is_none()
    }

    /// Set once the reconnect budget is spent.
    pub fn terminal_error(&self) -> Option<&ConnectionError> {
        self.error.as_ref().filter(|e| e.is_terminal())
    }
}

enum Command {
    Start { endpoint: String, enabled: bool },
    Send(Envelope),
    SetHandler(MessageHandler),
    Stop(oneshot::Sender<()>),
}

/// Owns at most one live connection to a session endpoint and recovers it
/// after unplanned closures.
///
/// Must be created inside a tokio runtime. Dropping it ends the driver task,
/// which closes the socket and cancels any pending reconnect.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    driver: JoinHandle<()>,
}

impl ConnectionManager {
    /// Spawn the driver task.
    pub fn new(config: ReconnectConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::default());
        let driver = tokio::spawn(Driver::new(config, command_rx, status_tx).run());
        Self {
            commands,
            status,
            driver,
        }
    }

    /// Connect to `endpoint` if `enabled`, or tear everything down if not.
    ///
    /// No-op while a connection is already open or opening.
    pub fn start(&self, endpoint: impl Into<String>, enabled: bool) {
        self.command(Command::Start {
            endpoint: endpoint.into(),
            enabled,
        });
    }

    /// Transmit `envelope` if the connection is open; drop it otherwise.
    pub fn send(&self, envelope: Envelope) {
        self.command(Command::Send(envelope));
    }

    /// Replace the inbound handler.
    pub fn on_message<F>(&self, handler: F)
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        self.command(Command::SetHandler(Box::new(handler)));
    }

    /// Close the connection and cancel any pending reconnect.
    ///
    /// Resolves once the driver has done so; the handler is not invoked
    /// afterwards until the next `start`. Safe to call repeatedly.
    pub async fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Stop(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Stop and wait for the driver task to exit.
    pub async fn shutdown(self) {
        self.stop().await;
        let Self {
            commands, driver, ..
        } = self;
        drop(commands);
        if let Err(e) = driver.await {
            log::error!("connection driver panicked: {e}");
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    /// Watch connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("connection driver has exited");
        }
    }
}

// ─── Driver ──────────────────────────────────────────────────────

enum Wake {
    Command(Option<Command>),
    Connected(Result<Socket, String>),
    Frame(Option<Result<Message, tungstenite::Error>>),
    ReconnectDue,
}

struct Driver {
    lifecycle: Lifecycle,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    endpoint: String,
    handler: Option<MessageHandler>,
    socket: Option<Socket>,
    connecting: Option<PendingConnect>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    connect_timeout: Duration,
    dropped_sends: u64,
}

impl Driver {
    fn new(
        config: ReconnectConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            lifecycle: Lifecycle::new(config),
            commands,
            status,
            endpoint: String::new(),
            handler: None,
            socket: None,
            connecting: None,
            reconnect_timer: None,
            dropped_sends: 0,
        }
    }

    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                biased;
                command = self.commands.recv() => Wake::Command(command),
                result = pending_connect(&mut self.connecting) => Wake::Connected(result),
                frame = next_frame(&mut self.socket) => Wake::Frame(frame),
                () = reconnect_timer(&mut self.reconnect_timer) => Wake::ReconnectDue,
            };

            match wake {
                Wake::Command(None) => {
                    let directives = self.lifecycle.stop();
                    self.apply(directives).await;
                    self.publish();
                    break;
                }
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Connected(result) => {
                    self.connecting = None;
                    self.handle_connect(result).await;
                }
                Wake::Frame(frame) => self.handle_frame(frame).await,
                Wake::ReconnectDue => {
                    self.reconnect_timer = None;
                    let directives = self.lifecycle.reconnect_due();
                    self.apply(directives).await;
                }
            }
            self.publish();
        }
        log::debug!("connection driver exiting");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { endpoint, enabled } => {
                self.endpoint = endpoint;
                let directives = self.lifecycle.start(enabled);
                self.apply(directives).await;
            }
            Command::Send(envelope) => self.transmit(envelope).await,
            Command::SetHandler(handler) => self.handler = Some(handler),
            Command::Stop(ack) => {
                let directives = self.lifecycle.stop();
                self.apply(directives).await;
                self.publish();
                let _ = ack.send(());
            }
        }
    }

    async fn handle_connect(&mut self, result: Result<Socket, String>) {
        match result {
            Ok(socket) => {
                self.socket = Some(socket);
                let directives = self.lifecycle.opened();
                self.apply(directives).await;
            }
            Err(reason) => {
                self.lifecycle.transport_error(reason);
                let directives = self.lifecycle.closed();
                self.apply(directives).await;
            }
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.dispatch(Envelope::decode(text.as_str())),
            Some(Ok(Message::Binary(bytes))) => self.dispatch(Envelope::decode_bytes(&bytes)),
            Some(Ok(Message::Close(reason))) => {
                log::info!("server closed the connection: {reason:?}");
                self.socket_closed().await;
            }
            // Ping/pong are answered by tungstenite itself
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                self.lifecycle.transport_error(e.to_string());
                self.socket_closed().await;
            }
            None => self.socket_closed().await,
        }
    }

    async fn socket_closed(&mut self) {
        self.socket = None;
        let directives = self.lifecycle.closed();
        self.apply(directives).await;
    }

    fn dispatch(&mut self, decoded: Result<Envelope, ProtocolError>) {
        match decoded {
            Ok(envelope) => {
                log::debug!("inbound {}", envelope.kind());
                match self.handler.as_mut() {
                    Some(handler) => handler(envelope),
                    None => log::debug!("no handler registered, dropping {}", envelope.kind()),
                }
            }
            Err(e) => log::warn!("discarding inbound frame: {e}"),
        }
    }

    async fn transmit(&mut self, envelope: Envelope) {
        let socket = match self.socket.as_mut() {
            Some(socket) if self.lifecycle.state() == ConnectionState::Open => socket,
            _ => {
                self.dropped_sends += 1;
                log::warn!(
                    "not connected ({}), dropping outbound {}",
                    self.lifecycle.state(),
                    envelope.kind()
                );
                return;
            }
        };

        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("failed to encode outbound {}: {e}", envelope.kind());
                return;
            }
        };

        // Closure is reported by the read half; only record the error here.
        if let Err(e) = socket.send(Message::Text(text.into())).await {
            self.lifecycle.transport_error(e.to_string());
        }
    }

    async fn apply(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::Open => self.open().await,
                Directive::Close => self.close().await,
                Directive::Schedule(delay) => {
                    self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
                }
                Directive::CancelTimer => self.reconnect_timer = None,
            }
        }
    }

    async fn open(&mut self) {
        self.close_socket().await;
        log::info!("connecting to {}", self.endpoint);
        let endpoint = self.endpoint.clone();
        let deadline = self.connect_timeout;
        self.connecting = Some(Box::pin(async move {
            match tokio::time::timeout(deadline, tokio_tungstenite::connect_async(endpoint)).await {
                Ok(Ok((socket, _response))) => Ok(socket),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("connect timed out after {deadline:?}")),
            }
        }));
    }

    async fn close(&mut self) {
        self.connecting = None;
        self.close_socket().await;
        if self.lifecycle.state() == ConnectionState::Closing {
            let directives = self.lifecycle.closed();
            debug_assert!(directives.is_empty());
        }
    }

    async fn close_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, socket.close(None)).await {
                Ok(Err(e)) => log::debug!("close handshake failed: {e}"),
                Err(_) => log::debug!("close handshake timed out"),
                Ok(Ok(())) => {}
            }
        }
    }

    fn publish(&self) {
        let status = ConnectionStatus {
            state: self.lifecycle.state(),
            attempt: self.lifecycle.attempt(),
            error: self.lifecycle.error().cloned(),
            dropped_sends: self.dropped_sends,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn pending_connect(
    connecting: &mut Option<PendingConnect>,
) -> Result<Socket, String> {
    match connecting {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(socket: &mut Option<Socket>) -> Option<Result<Message, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
