//! The conversation WebSocket session: dialog messages (`text`, `sound`,
//! `audio`, `askSpecial`, ...), the ping heartbeat, and the `protocol:audio`
//! extension channel.
//!
//! Four auth modes gate how the initial connection is established —
//! `None`/`Bearer`/`Cookie` connect directly with a header, `HomeAssistant`
//! first exchanges the long-lived token for an ingress session cookie, and
//! `OAuth2` verifies (and, if needed, refreshes) a bearer token before
//! connecting. All four converge on the same `connect_direct`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::audio_subprotocol::{self, RawAudioMessage};
use super::ConnectionError;
use crate::bus::EventBus;
use crate::config::{AuthMode, GeneralConfig};
use crate::events::{Event, SpotifyCredentials};
use crate::player::Sound;

/// Per-connection dedup/correlation state the main protocol parser keeps
/// across messages (reset on every reconnect, mirroring a fresh session).
struct SessionState {
    last_said_text_id: i64,
    ask_special_text_id: i64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            last_said_text_id: -1,
            ask_special_text_id: -1,
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A cloneable sender used to push a reply back onto the conversation
/// socket from wherever the reply is produced (e.g. an audio-subprotocol
/// handler running on a different task).
#[derive(Debug, Clone)]
pub struct OutgoingSender(mpsc::UnboundedSender<Value>);

impl OutgoingSender {
    pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self(tx)
    }

    pub fn send(&self, value: Value) -> Result<(), ConnectionError> {
        self.0
            .send(value)
            .map_err(|_| ConnectionError::Closed)
    }
}

/// A handle to a running conversation client. Cloneable; dropping every
/// handle does not stop the background task (call `shutdown` explicitly).
#[derive(Clone)]
pub struct ConversationClient {
    outgoing: OutgoingSender,
    ready: Arc<AtomicBool>,
}

impl ConversationClient {
    /// Start the connection loop in the background and return a handle.
    pub fn spawn(config: GeneralConfig, bus: EventBus) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outgoing = OutgoingSender::new(tx);
        let ready = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run(config, bus, outgoing.clone(), rx, ready.clone()));

        (Self { outgoing, ready }, handle)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn send_command(&self, text: &str) -> Result<(), ConnectionError> {
        self.outgoing.send(json!({ "type": "command", "text": text }))
    }

    pub fn send_thingtalk(&self, code: &str) -> Result<(), ConnectionError> {
        self.outgoing.send(json!({ "type": "tt", "code": code }))
    }

    /// Handle for code that needs to answer `protocol:audio` requests.
    pub fn outgoing_sender(&self) -> OutgoingSender {
        self.outgoing.clone()
    }

    /// A client with no background connection task, for exercising callers
    /// (like the dialog state machine) without opening a real socket.
    #[cfg(test)]
    pub fn disconnected_for_test() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        Self {
            outgoing: OutgoingSender::new(tx),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }
}

async fn run(
    config: GeneralConfig,
    bus: EventBus,
    outgoing: OutgoingSender,
    mut outgoing_rx: mpsc::UnboundedReceiver<Value>,
    ready: Arc<AtomicBool>,
) {
    let http = reqwest::Client::new();
    // Messages queued before the socket is open and subprotocols negotiated.
    let mut pending: Vec<Value> = Vec::new();

    loop {
        ready.store(false, Ordering::Release);

        let mut socket = match open_socket(&config, &http).await {
            Ok(s) => s,
            Err(e) => {
                warn!("conversation connect failed: {e}");
                tokio::time::sleep(Duration::from_millis(config.retry_interval_ms)).await;
                continue;
            }
        };

        info!("conversation socket connected");
        let mut session = SessionState::default();

        // Negotiate the audio subprotocol before declaring ready — the
        // outgoing queue stays gated until both the socket is open and
        // this request has gone out.
        let negotiate = json!({
            "type": "req-subproto",
            "proto": "audio",
            "caps": Value::Array(vec![]),
        });
        if socket.send(Message::Text(negotiate.to_string())).await.is_err() {
            continue;
        }
        ready.store(true, Ordering::Release);

        for msg in pending.drain(..) {
            let _ = socket.send(Message::Text(msg.to_string())).await;
        }

        let mut ping_timer = tokio::time::interval(Duration::from_secs(30));
        ping_timer.tick().await; // first tick fires immediately; discard

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    if socket.send(Message::Text(json!({"type": "ping"}).to_string())).await.is_err() {
                        break;
                    }
                }
                outgoing = outgoing_rx.recv() => {
                    match outgoing {
                        Some(value) => {
                            if !ready.load(Ordering::Acquire) {
                                pending.push(value);
                            } else if socket.send(Message::Text(value.to_string())).await.is_err() {
                                break;
                            }
                        }
                        None => return,
                    }
                }
                incoming = socket.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            handle_incoming(&text, &bus, &outgoing, &mut session);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = socket.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("conversation socket error: {e}");
                            break;
                        }
                        None => {
                            warn!("conversation socket closed by peer");
                            break;
                        }
                    }
                }
            }
        }

        ready.store(false, Ordering::Release);
        tokio::time::sleep(Duration::from_millis(config.retry_interval_ms)).await;
    }
}

fn handle_incoming(text: &str, bus: &EventBus, outgoing: &OutgoingSender, session: &mut SessionState) {
    debug!(%text, "conversation message received");
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("malformed conversation message: {e}");
            return;
        }
    };

    let msg_type = value.get("type").and_then(Value::as_str).unwrap_or("");

    if let Some(extension) = msg_type.strip_prefix("protocol:") {
        if extension == "audio" {
            if let Ok(raw) = serde_json::from_value::<RawAudioMessage>(value) {
                let request = audio_subprotocol::parse(raw, outgoing.clone());
                bus.push(Event::AudioRequest(request));
            }
        } else {
            warn!(extension, "unexpected extension protocol message");
        }
        return;
    }

    match msg_type {
        "id" => {
            debug!("received conversation id acknowledgement");
        }
        "error" => {
            if let Some(err) = value.get("error").and_then(Value::as_str) {
                warn!(error = err, "conversation server reported an error");
            }
        }
        "ping" => {
            let _ = outgoing.send(json!({ "type": "pong" }));
        }
        "askSpecial" => {
            let ask = value.get("ask").and_then(Value::as_str).unwrap_or("").to_string();
            let text_id = session.ask_special_text_id;
            if text_id != -1 {
                session.ask_special_text_id = -1;
            }
            bus.push(Event::AskSpecial {
                text_id: text_id.max(0) as u64,
                special: ask,
            });
        }
        "new-device" => {
            if let Some(state) = value.get("state") {
                let kind = state.get("kind").and_then(Value::as_str).unwrap_or("");
                if kind == "com.spotify" {
                    if let (Some(token), Some(username)) = (
                        state.get("accessToken").and_then(Value::as_str),
                        state.get("id").and_then(Value::as_str),
                    ) {
                        bus.push(Event::SpotifyCredentials(SpotifyCredentials {
                            username: username.to_string(),
                            access_token: token.to_string(),
                            expires_in_secs: 0,
                        }));
                    }
                }
            }
        }
        "text" | "sound" | "audio" => {
            let id = value.get("id").and_then(Value::as_i64).unwrap_or(0);
            match msg_type {
                "text" => {
                    if id <= session.last_said_text_id {
                        debug!(id, last = session.last_said_text_id, "skipping already-said text message");
                        return;
                    }
                    let text = value.get("text").and_then(Value::as_str).unwrap_or("").to_string();
                    session.ask_special_text_id = id;
                    session.last_said_text_id = id;
                    bus.push(Event::TextMessage { text_id: id as u64, text, follow_up: false });
                }
                "sound" => {
                    let name = value.get("name").and_then(Value::as_str).unwrap_or("");
                    match Sound::from_name(name) {
                        Some(_) => bus.push(Event::SoundMessage { name: name.to_string() }),
                        None => warn!(name, "unrecognized sound name, dropping"),
                    }
                }
                "audio" => {
                    let url = value.get("url").and_then(Value::as_str).unwrap_or("").to_string();
                    bus.push(Event::AudioMessage { text_id: id as u64, url, follow_up: false });
                }
                _ => unreachable!(),
            }
        }
        "command" | "new-program" | "rdl" | "link" | "button" | "video" | "picture" | "choice" => {
            debug!(msg_type, "ignored conversation message kind");
        }
        other => {
            warn!(msg_type = other, "unhandled conversation message kind");
        }
    }
}

async fn open_socket(config: &GeneralConfig, http: &reqwest::Client) -> Result<WsStream, ConnectionError> {
    match config.auth_mode {
        AuthMode::None | AuthMode::Bearer | AuthMode::Cookie => {
            let token = config.access_token.as_deref().unwrap_or("");
            connect_direct(config, config.auth_mode, token).await
        }
        AuthMode::HomeAssistant => {
            let session = fetch_home_assistant_session(config, http).await?;
            connect_direct(config, AuthMode::Cookie, &format!("ingress_session={session}")).await
        }
        AuthMode::OAuth2 => {
            let token = verify_or_refresh_oauth2(config, http).await?;
            connect_direct(config, AuthMode::Bearer, &token).await
        }
    }
}

async fn connect_direct(config: &GeneralConfig, auth_mode: AuthMode, token: &str) -> Result<WsStream, ConnectionError> {
    let mut url = Url::parse(&config.url)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("skip_history", "1");
        query.append_pair("sync_devices", "1");
        if let Some(id) = &config.conversation_id {
            query.append_pair("id", id);
        }
    }

    let mut request = url.as_str().into_client_request()?;
    match auth_mode {
        AuthMode::Bearer => {
            request.headers_mut().insert(
                http::header::AUTHORIZATION,
                format!("Bearer {token}").parse().expect("valid header value"),
            );
        }
        AuthMode::Cookie => {
            request.headers_mut().insert(
                http::header::COOKIE,
                token.parse().expect("valid header value"),
            );
        }
        _ => {}
    }

    let (socket, _response) = connect_async(request).await?;
    Ok(socket)
}

async fn fetch_home_assistant_session(config: &GeneralConfig, http: &reqwest::Client) -> Result<String, ConnectionError> {
    let mut url = Url::parse(&config.url)?;
    url.set_path("/api/hassio/ingress/session");
    let _ = url.set_scheme(if url.scheme() == "wss" { "https" } else { "http" });

    let token = config.access_token.as_deref().unwrap_or("");
    let response = http
        .post(url)
        .bearer_auth(token)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ConnectionError::AuthHandshakeFailed { status, body });
    }

    let body: Value = response.json().await?;
    body.get("data")
        .and_then(|d| d.get("session"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ConnectionError::MissingOAuthToken)
}

async fn verify_or_refresh_oauth2(config: &GeneralConfig, http: &reqwest::Client) -> Result<String, ConnectionError> {
    let token = config.access_token.as_deref().ok_or(ConnectionError::MissingOAuthToken)?;

    let mut verify_url = Url::parse(&config.url)?;
    verify_url.set_path("/me/api/profile");
    let _ = verify_url.set_scheme(if verify_url.scheme() == "wss" { "https" } else { "http" });

    let response = http.get(verify_url).bearer_auth(token).send().await?;

    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return refresh_oauth2_token(config, http).await;
    }
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ConnectionError::AuthHandshakeFailed { status, body });
    }

    Ok(token.to_string())
}

async fn refresh_oauth2_token(config: &GeneralConfig, http: &reqwest::Client) -> Result<String, ConnectionError> {
    let refresh_token = config.access_token.as_deref().ok_or(ConnectionError::MissingOAuthToken)?;

    let mut url = Url::parse(&config.url)?;
    url.set_path("/me/api/oauth2/token");
    let _ = url.set_scheme(if url.scheme() == "wss" { "https" } else { "http" });

    let response = http
        .post(url)
        .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ConnectionError::AuthHandshakeFailed { status, body });
    }

    let body: Value = response.json().await?;
    body.get("access_token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ConnectionError::MissingOAuthToken)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_without_type_is_ignored_not_panicking() {
        let bus = EventBus::new(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        let outgoing = OutgoingSender::new(tx);
        let mut session = SessionState::default();
        handle_incoming("{}", &bus, &outgoing, &mut session);
        assert!(bus.is_empty());
    }

    #[test]
    fn text_message_dispatches_event() {
        let bus = EventBus::new(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        let outgoing = OutgoingSender::new(tx);
        let mut session = SessionState::default();
        handle_incoming(r#"{"type":"text","id":5,"text":"hello"}"#, &bus, &outgoing, &mut session);
        match bus.recv() {
            Event::TextMessage { text_id, text, .. } => {
                assert_eq!(text_id, 5);
                assert_eq!(text, "hello");
            }
            other => panic!("wrong event: {other:?}"),
        }
        assert_eq!(session.last_said_text_id, 5);
    }

    #[test]
    fn stale_text_id_is_skipped() {
        let bus = EventBus::new(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        let outgoing = OutgoingSender::new(tx);
        let mut session = SessionState { last_said_text_id: 10, ask_special_text_id: -1 };
        handle_incoming(r#"{"type":"text","id":3,"text":"stale"}"#, &bus, &outgoing, &mut session);
        assert!(bus.is_empty());
    }

    #[test]
    fn unrecognized_sound_name_is_dropped() {
        let bus = EventBus::new(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        let outgoing = OutgoingSender::new(tx);
        let mut session = SessionState::default();
        handle_incoming(r#"{"type":"sound","id":1,"name":"whoosh"}"#, &bus, &outgoing, &mut session);
        assert!(bus.is_empty());
    }

    #[test]
    fn ping_elicits_immediate_pong() {
        let bus = EventBus::new(4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outgoing = OutgoingSender::new(tx);
        let mut session = SessionState::default();
        handle_incoming(r#"{"type":"ping"}"#, &bus, &outgoing, &mut session);
        let sent = rx.try_recv().expect("pong expected");
        assert_eq!(sent["type"], json!("pong"));
    }
}
