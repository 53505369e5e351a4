//! `protocol:audio` — the conversation server's secondary channel for
//! controlling local playback (check capability, prepare a stream, stop,
//! play raw URLs, set volume, set mute).
//!
//! Every inbound request carries a `req` id and must get exactly one
//! response. `PendingAudioRequest` enforces that at the type level: it
//! holds the `req` id and is consumed by `resolve`/`reject`, so a request
//! that is dropped without either has a `Drop` impl that sends a generic
//! rejection rather than leaving the server hanging forever.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use super::conversation::OutgoingSender;

pub const PROTOCOL_NAME: &str = "protocol:audio";

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub struct RawAudioMessage {
    pub req: i64,
    pub op: String,
    #[serde(flatten)]
    pub body: Value,
}

/// A player spec as sent in `check`/`prepare` requests.
#[derive(Debug, Clone)]
pub enum PlayerSpec {
    Url,
    Spotify { username: String, access_token: String },
    Custom,
}

fn parse_spec(body: &Value) -> Option<PlayerSpec> {
    let spec = body.get("spec")?;
    match spec.get("type")?.as_str()? {
        "url" => Some(PlayerSpec::Url),
        "custom" => Some(PlayerSpec::Custom),
        "spotify" => Some(PlayerSpec::Spotify {
            username: spec.get("username")?.as_str()?.to_string(),
            access_token: spec.get("accessToken")?.as_str()?.to_string(),
        }),
        _ => None,
    }
}

/// The decoded operation requested by the server, paired with the
/// not-yet-answered handle the dialog layer must resolve or reject.
#[derive(Debug)]
pub enum AudioRequest {
    Check { spec: Option<PlayerSpec>, pending: PendingAudioRequest },
    Prepare { spec: Option<PlayerSpec>, pending: PendingAudioRequest },
    Stop { pending: PendingAudioRequest },
    PlayUrls { urls: Vec<String>, pending: PendingAudioRequest },
    SetVolume { volume: i32, pending: PendingAudioRequest },
    SetMute { mute: bool, pending: PendingAudioRequest },
}

/// Parse one `protocol:audio` frame into a dispatchable `AudioRequest`.
pub fn parse(msg: RawAudioMessage, sender: OutgoingSender) -> AudioRequest {
    let pending = PendingAudioRequest {
        req: msg.req,
        sender: Some(sender),
    };

    match msg.op.as_str() {
        "check" => AudioRequest::Check {
            spec: parse_spec(&msg.body),
            pending,
        },
        "prepare" => AudioRequest::Prepare {
            spec: parse_spec(&msg.body),
            pending,
        },
        "stop" => AudioRequest::Stop { pending },
        "play-urls" => {
            let urls = msg
                .body
                .get("urls")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            AudioRequest::PlayUrls { urls, pending }
        }
        "set-volume" => {
            let volume = msg.body.get("volume").and_then(Value::as_i64).unwrap_or(0) as i32;
            AudioRequest::SetVolume { volume, pending }
        }
        "set-mute" => {
            let mute = msg.body.get("mute").and_then(Value::as_bool).unwrap_or(false);
            AudioRequest::SetMute { mute, pending }
        }
        other => {
            warn!(op = other, "unknown protocol:audio operation");
            let mut pending = pending;
            pending.reject("ENOSYS", "Unknown operation");
            AudioRequest::Stop {
                pending: PendingAudioRequest { req: msg.req, sender: None },
            }
        }
    }
}

/// An audio-protocol request awaiting exactly one response.
#[derive(Debug)]
pub struct PendingAudioRequest {
    req: i64,
    sender: Option<OutgoingSender>,
}

impl PendingAudioRequest {
    fn envelope(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), json!(PROTOCOL_NAME));
        map.insert("req".into(), json!(self.req));
        map
    }

    /// Resolve a `check` request with an ok/detail pair.
    pub fn resolve_check(mut self, ok: bool, detail: &str) {
        let mut body = self.envelope();
        body.insert("ok".into(), json!(ok));
        if !detail.is_empty() {
            body.insert("detail".into(), json!(detail));
        }
        self.send(Value::Object(body));
    }

    /// Resolve any other request with no payload beyond the envelope.
    pub fn resolve(mut self) {
        let body = self.envelope();
        self.send(Value::Object(body));
    }

    pub fn reject(&mut self, code: &str, message: &str) {
        let mut body = self.envelope();
        let mut error = serde_json::Map::new();
        error.insert("code".into(), json!(code));
        error.insert("message".into(), json!(message));
        body.insert("error".into(), Value::Object(error));
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Value::Object(body));
        }
    }

    fn send(&mut self, value: Value) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(value);
        }
    }

    /// A pending request with nowhere to send its response, for exercising
    /// callers that only care about the side effect, not the reply.
    #[cfg(test)]
    pub fn for_test(req: i64) -> Self {
        Self { req, sender: None }
    }
}

impl Drop for PendingAudioRequest {
    fn drop(&mut self) {
        if self.sender.is_some() {
            warn!(req = self.req, "audio request dropped without a response");
            self.reject("EINTERNAL", "request dropped without a response");
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SetVolumeAck {
    pub ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel() -> (OutgoingSender, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutgoingSender::new(tx), rx)
    }

    #[test]
    fn parse_play_urls_extracts_string_array() {
        let msg = RawAudioMessage {
            req: 1,
            op: "play-urls".into(),
            body: json!({ "urls": ["https://a", "https://b"] }),
        };
        let (tx, _rx) = channel();
        match parse(msg, tx) {
            AudioRequest::PlayUrls { urls, .. } => {
                assert_eq!(urls, vec!["https://a".to_string(), "https://b".to_string()])
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn dropped_request_sends_rejection() {
        let (tx, mut rx) = channel();
        {
            let _pending = PendingAudioRequest {
                req: 7,
                sender: Some(tx),
            };
        }
        let sent = rx.try_recv().expect("a rejection should have been sent");
        assert_eq!(sent["req"], json!(7));
        assert!(sent["error"].is_object());
    }

    #[test]
    fn unknown_op_rejects_with_enosys() {
        let msg = RawAudioMessage {
            req: 3,
            op: "frobnicate".into(),
            body: json!({}),
        };
        let (tx, mut rx) = channel();
        let _ = parse(msg, tx);
        let sent = rx.try_recv().expect("rejection expected");
        assert_eq!(sent["error"]["code"], json!("ENOSYS"));
    }
}
