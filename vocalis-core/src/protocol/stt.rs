//! The speech-to-text session: one short-lived WebSocket connection per
//! utterance. A `hello` frame opens it, raw 16-bit PCM frames stream in as
//! binary messages, and the very first reply — success or failure — closes
//! it. There is no back-and-forth beyond that single round trip.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

/// What the server decided about the utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttOutcome {
    Recognized(String),
    NoMatch,
    ConnectionFailed(String),
}

/// One in-flight recognition request.
pub struct SttSession {
    frame_tx: mpsc::UnboundedSender<Vec<i16>>,
    result_rx: Option<oneshot::Receiver<SttOutcome>>,
}

impl SttSession {
    /// Open a new session against `{nl_url}/{locale}/voice/stream`.
    ///
    /// `nl_url` is expected in `http(s)://` form; it is rewritten to
    /// `ws(s)://` the same way the conversation URL already arrives as one.
    pub fn begin(nl_url: &str, locale: &str) -> Self {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();

        let ws_url = to_ws_scheme(nl_url);
        let locale = locale.to_string();

        tokio::spawn(async move {
            let outcome = run_session(ws_url, locale, frame_rx).await;
            let _ = result_tx.send(outcome);
        });

        Self {
            frame_tx,
            result_rx: Some(result_rx),
        }
    }

    /// Queue one frame of 16-bit PCM audio for transmission.
    pub fn send_frame(&self, samples: Vec<i16>) {
        let _ = self.frame_tx.send(samples);
    }

    /// Signal end of utterance (an empty frame is the sentinel the server
    /// uses to flush whatever audio remains and start recognizing) and wait
    /// for the single outcome message.
    pub async fn finish(mut self) -> SttOutcome {
        let _ = self.frame_tx.send(Vec::new());
        match self.result_rx.take() {
            Some(rx) => rx.await.unwrap_or(SttOutcome::ConnectionFailed(
                "session task ended without a result".into(),
            )),
            None => SttOutcome::ConnectionFailed("finish() called twice".into()),
        }
    }

    /// Abort the session without waiting for a result.
    pub fn abort(self) {
        drop(self.frame_tx);
    }
}

fn to_ws_scheme(nl_url: &str) -> String {
    if let Some(rest) = nl_url.strip_prefix("https") {
        format!("wss{rest}")
    } else if let Some(rest) = nl_url.strip_prefix("http") {
        format!("ws{rest}")
    } else {
        nl_url.to_string()
    }
}

async fn run_session(
    ws_url: String,
    locale: String,
    mut frame_rx: mpsc::UnboundedReceiver<Vec<i16>>,
) -> SttOutcome {
    let url = match Url::parse(&ws_url).and_then(|u| u.join(&format!("{locale}/voice/stream"))) {
        Ok(u) => u,
        Err(e) => return SttOutcome::ConnectionFailed(e.to_string()),
    };

    let (mut socket, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok(s) => s,
        Err(e) => return SttOutcome::ConnectionFailed(e.to_string()),
    };

    if socket
        .send(Message::Text(r#"{ "ver": 1 }"#.to_string()))
        .await
        .is_err()
    {
        return SttOutcome::ConnectionFailed("failed to send hello".into());
    }

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                match frame {
                    Some(samples) => {
                        let last = samples.is_empty();
                        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
                        if socket.send(Message::Binary(bytes)).await.is_err() {
                            return SttOutcome::ConnectionFailed("send failed".into());
                        }
                        if last {
                            // Keep reading until the server replies; frame_rx
                            // is dropped by the caller after `finish`.
                        }
                    }
                    None => return SttOutcome::ConnectionFailed("caller dropped the session".into()),
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        debug!(%text, "stt reply received");
                        let outcome = parse_reply(&text);
                        let _ = socket.close(None).await;
                        return outcome;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return SttOutcome::ConnectionFailed(e.to_string()),
                    None => return SttOutcome::ConnectionFailed("connection closed before a reply".into()),
                }
            }
        }
    }
}

fn parse_reply(text: &str) -> SttOutcome {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("malformed stt reply: {e}");
            return SttOutcome::ConnectionFailed(e.to_string());
        }
    };

    let status = value.get("status").and_then(Value::as_i64).unwrap_or(-1);
    if status != 0 {
        return SttOutcome::NoMatch;
    }

    match value.get("result").and_then(Value::as_str) {
        Some("ok") => {
            let text = value.get("text").and_then(Value::as_str).unwrap_or("").to_string();
            SttOutcome::Recognized(text)
        }
        _ => SttOutcome::NoMatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_url_becomes_ws() {
        assert_eq!(to_ws_scheme("http://example.com"), "ws://example.com");
        assert_eq!(to_ws_scheme("https://example.com"), "wss://example.com");
    }

    #[test]
    fn reply_with_nonzero_status_is_no_match() {
        let outcome = parse_reply(r#"{"status": 1}"#);
        assert_eq!(outcome, SttOutcome::NoMatch);
    }

    #[test]
    fn reply_with_ok_result_extracts_text() {
        let outcome = parse_reply(r#"{"status": 0, "result": "ok", "text": "turn on the lights"}"#);
        assert_eq!(outcome, SttOutcome::Recognized("turn on the lights".to_string()));
    }
}
