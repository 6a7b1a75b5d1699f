//! In-process session server for integration tests.
//!
//! Speaks the client wire protocol: `init` on connect, every edit stamped
//! with its author and broadcast to all participants (author included),
//! `user_join` / `user_leave` presence. Adds fault injection on top.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use codecollab_session::client::ConnectionStatus;
use codecollab_session::reconciler::SessionEvent;
use codecollab_session::{Envelope, Language, ParticipantId, ReconnectConfig, SessionConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

struct Room {
    code: String,
    language: Language,
    peers: HashMap<String, mpsc::UnboundedSender<Message>>,
    accepted: u64,
}

impl Room {
    fn broadcast(&self, envelope: &Envelope, skip: Option<&str>) {
        let text = envelope.encode().unwrap();
        for (id, tx) in &self.peers {
            if Some(id.as_str()) != skip {
                let _ = tx.send(Message::Text(text.clone().into()));
            }
        }
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    room: Arc<Mutex<Room>>,
    kill: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    /// Start on a free port with an empty Python document.
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0", "", Language::Python).await
    }

    pub async fn start_with(code: &str, language: Language) -> Self {
        Self::start_on("127.0.0.1:0", code, language).await
    }

    pub async fn start_on(addr: &str, code: &str, language: Language) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let room = Arc::new(Mutex::new(Room {
            code: code.to_string(),
            language,
            peers: HashMap::new(),
            accepted: 0,
        }));
        let (kill, _) = broadcast::channel(4);

        let accept_room = room.clone();
        let accept_kill = kill.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let room = accept_room.clone();
                let kill_rx = accept_kill.subscribe();
                tokio::spawn(handle_peer(stream, room, kill_rx));
            }
        });

        Self {
            addr,
            room,
            kill,
            accept_task,
        }
    }

    pub fn config(&self, reconnect: ReconnectConfig) -> SessionConfig {
        SessionConfig {
            api_base: format!("http://{}", self.addr),
            ws_base: format!("ws://{}", self.addr),
            reconnect,
            echo_guard_ms: 100,
        }
    }

    pub fn endpoint(&self, space_id: &str) -> String {
        format!("ws://{}/ws/{space_id}", self.addr)
    }

    /// Close every live connection from the server side.
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Push a raw text frame to every participant.
    pub async fn push_raw(&self, text: &str) {
        let room = self.room.lock().await;
        for tx in room.peers.values() {
            let _ = tx.send(Message::Text(text.to_string().into()));
        }
    }

    /// Connections accepted so far.
    pub async fn accepted(&self) -> u64 {
        self.room.lock().await.accepted
    }

    pub async fn participants(&self) -> usize {
        self.room.lock().await.peers.len()
    }

    pub async fn code(&self) -> String {
        self.room.lock().await.code.clone()
    }

    /// Stop listening and drop every connection; the port then refuses.
    pub async fn shutdown(mut self) {
        self.accept_task.abort();
        let _ = (&mut self.accept_task).await;
        self.drop_connections();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn handle_peer(stream: TcpStream, room: Arc<Mutex<Room>>, mut kill: broadcast::Receiver<()>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    {
        let mut room = room.lock().await;
        room.accepted += 1;
        room.peers.insert(id.clone(), tx.clone());
        let active_users = room.peers.len() as u32;
        let init = Envelope::Init {
            user_id: ParticipantId::new(id.clone()),
            code: room.code.clone(),
            language: room.language,
            active_users,
        };
        let _ = tx.send(Message::Text(init.encode().unwrap().into()));
        room.broadcast(&Envelope::UserJoin { active_users }, Some(&id));
    }

    loop {
        tokio::select! {
            _ = kill.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outbound = rx.recv() => match outbound {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let Ok(envelope) = Envelope::decode(text.as_str()) else {
                        continue;
                    };
                    let mut room = room.lock().await;
                    match envelope {
                        Envelope::CodeChange { code, .. } => {
                            room.code = code.clone();
                            room.broadcast(
                                &Envelope::CodeChange {
                                    user_id: Some(ParticipantId::new(id.clone())),
                                    code,
                                },
                                None,
                            );
                        }
                        Envelope::LanguageChange { language, .. } => {
                            room.language = language;
                            room.broadcast(
                                &Envelope::LanguageChange {
                                    user_id: Some(ParticipantId::new(id.clone())),
                                    language,
                                },
                                None,
                            );
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let mut room = room.lock().await;
    room.peers.remove(&id);
    let active_users = room.peers.len() as u32;
    room.broadcast(&Envelope::UserLeave { active_users }, None);
}

/// Reconnect settings fast enough for tests.
pub fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        max_attempts,
        base_delay_ms: 20,
        max_delay_ms: 50,
        ..ReconnectConfig::default()
    }
}

/// A local port with nothing listening on it.
pub async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for a status matching `pred`.
pub async fn wait_status<F>(status: &mut watch::Receiver<ConnectionStatus>, pred: F) -> ConnectionStatus
where
    F: FnMut(&ConnectionStatus) -> bool,
{
    timeout(Duration::from_secs(5), status.wait_for(pred))
        .await
        .expect("status should be reached within timeout")
        .expect("connection driver alive")
        .clone()
}

/// Skip events until one matches `pred`.
pub async fn wait_event<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("event should arrive within timeout")
            .expect("event channel open");
        if pred(&event) {
            return event;
        }
    }
}

/// Collect everything that arrives within `window`.
pub async fn drain_events(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    window: Duration,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = timeout(window, events.recv()).await {
        seen.push(event);
    }
    seen
}
