//! Inbound event records and frame decoding.
//!
//! The protocol defines dozens of event shapes, so events are kept as open
//! JSON records with typed accessors for the handful of fields the client
//! itself inspects (`type`, `subtype`, `channel`, `user`, `ts`). Consumers
//! that need full structure call [`Event::decode`] with their own shape; the
//! exact bytes received are retained for that purpose.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    error::{RtmError, RtmResult},
    types::RequestId,
};

/// Sent by the server as the first frame of every session.
pub const HELLO: &str = "hello";
/// Chat messages, including join/leave notices carried as subtypes.
pub const MESSAGE: &str = "message";
/// Application-level keepalive request.
pub const PING: &str = "ping";
/// Keepalive answer; also synthesized for transport-level pong frames.
pub const PONG: &str = "pong";
/// Typing indicator.
pub const TYPING: &str = "typing";

/// An immutable inbound protocol message.
#[derive(Clone, Debug)]
pub struct Event {
    kind: String,
    subtype: Option<String>,
    fields: Map<String, Value>,
    raw: Bytes,
}

impl Event {
    /// Decode an event from the bytes of a text frame.
    pub fn from_json(raw: Bytes) -> RtmResult<Self> {
        let value: Value = serde_json::from_slice(&raw)?;
        let Value::Object(fields) = value else {
            return Err(RtmError::decode("frame is not a JSON object"));
        };
        Self::with_raw(fields, raw)
    }

    /// Build an event from already-parsed fields. The raw form is re-encoded.
    pub fn from_fields(fields: Map<String, Value>) -> RtmResult<Self> {
        let raw = Bytes::from(serde_json::to_vec(&fields)?);
        Self::with_raw(fields, raw)
    }

    fn with_raw(fields: Map<String, Value>, raw: Bytes) -> RtmResult<Self> {
        let kind = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RtmError::decode("event has no type"))?
            .to_string();
        let subtype = fields
            .get("subtype")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            kind,
            subtype,
            fields,
            raw,
        })
    }

    /// Minimal event standing in for a transport-level pong frame.
    pub fn pong() -> Self {
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::from(PONG));
        Self {
            kind: PONG.to_string(),
            subtype: None,
            fields,
            raw: Bytes::from_static(br#"{"type":"pong"}"#),
        }
    }

    /// The `type` discriminator.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The optional `subtype`.
    pub fn subtype(&self) -> Option<&str> {
        self.subtype.as_deref()
    }

    /// Check the discriminator.
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn channel(&self) -> Option<&str> {
        self.str_field("channel")
    }

    pub fn user(&self) -> Option<&str> {
        self.str_field("user")
    }

    pub fn ts(&self) -> Option<&str> {
        self.str_field("ts")
    }

    pub fn text(&self) -> Option<&str> {
        self.str_field("text")
    }

    /// Look up any field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Look up a string field.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// All fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// The exact bytes received (or synthesized).
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Strictly decode the raw payload into a caller-supplied shape.
    pub fn decode<T: DeserializeOwned>(&self) -> RtmResult<T> {
        Ok(serde_json::from_slice(&self.raw)?)
    }
}

/// Error object carried by a failed reply.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct ReplyErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

/// A reply to a client-initiated request.
#[derive(Clone, Debug)]
pub struct Reply {
    reply_to: RequestId,
    ok: bool,
    error: Option<ReplyErrorBody>,
    fields: Map<String, Value>,
}

impl Reply {
    fn from_fields(reply_to: RequestId, fields: Map<String, Value>) -> Self {
        let ok = fields.get("ok").and_then(Value::as_bool).unwrap_or(false);
        let error = fields
            .get("error")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        Self {
            reply_to,
            ok,
            error,
            fields,
        }
    }

    /// The correlation id this reply answers.
    pub fn reply_to(&self) -> RequestId {
        self.reply_to
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn error(&self) -> Option<&ReplyErrorBody> {
        self.error.as_ref()
    }

    pub fn ts(&self) -> Option<&str> {
        self.fields.get("ts").and_then(Value::as_str)
    }

    pub fn text(&self) -> Option<&str> {
        self.fields.get("text").and_then(Value::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Turn a rejection into [`RtmError::Reply`].
    pub fn into_result(self) -> RtmResult<Self> {
        if self.ok {
            return Ok(self);
        }
        let (code, message) = match &self.error {
            Some(body) => (body.code, body.msg.clone()),
            None => (0, "request rejected without error body".to_string()),
        };
        Err(RtmError::reply(code, message))
    }
}

/// A decoded inbound frame.
#[derive(Clone, Debug)]
pub enum Inbound {
    /// An event for the dispatcher.
    Event(Event),
    /// A reply for a pending request.
    Reply(Reply),
    /// A transport-level ping that needs a pong.
    Ping(Bytes),
}

/// Decode one transport frame.
///
/// Text frames carry JSON objects; a pong frame becomes a synthetic `pong`
/// event. Any other frame type is a decode error, and a close frame reports
/// the connection as closed.
pub fn decode_frame(message: Message) -> RtmResult<Inbound> {
    match message {
        Message::Text(text) => decode_text(Bytes::copy_from_slice(text.as_bytes())),
        Message::Pong(_) => Ok(Inbound::Event(Event::pong())),
        Message::Ping(data) => Ok(Inbound::Ping(data)),
        Message::Close(frame) => Err(RtmError::connection_closed(
            frame.map(|f| format!("peer closed: {} {}", u16::from(f.code), f.reason.as_str())),
        )),
        Message::Binary(_) => Err(RtmError::decode("unexpected binary frame")),
        Message::Frame(_) => Err(RtmError::decode("unexpected raw frame")),
    }
}

/// Decode the payload of a text frame.
pub fn decode_text(raw: Bytes) -> RtmResult<Inbound> {
    let value: Value = serde_json::from_slice(&raw)?;
    let Value::Object(fields) = value else {
        return Err(RtmError::decode("frame is not a JSON object"));
    };

    // Replies always carry `ok`; a bare `reply_to` on a typed event is not one.
    if let Some(reply_to) = fields.get("reply_to").and_then(Value::as_u64)
        && fields.contains_key("ok")
    {
        return Ok(Inbound::Reply(Reply::from_fields(
            RequestId::new(reply_to),
            fields,
        )));
    }

    Event::with_raw(fields, raw).map(Inbound::Event)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[test]
    fn test_event_accessors() {
        let raw = Bytes::from_static(
            br#"{"type":"message","subtype":"channel_join","channel":"C1","user":"U1","ts":"1.0","text":"hi"}"#,
        );
        let event = Event::from_json(raw.clone()).expect("decode");
        assert_eq!(event.kind(), "message");
        assert!(event.is(MESSAGE));
        assert_eq!(event.subtype(), Some("channel_join"));
        assert_eq!(event.channel(), Some("C1"));
        assert_eq!(event.user(), Some("U1"));
        assert_eq!(event.ts(), Some("1.0"));
        assert_eq!(event.text(), Some("hi"));
        assert_eq!(event.raw(), &raw);
    }

    #[test]
    fn test_event_decode_into_caller_shape() {
        #[derive(Deserialize)]
        struct Reaction {
            reaction: String,
            item: Item,
        }
        #[derive(Deserialize)]
        struct Item {
            channel: String,
        }

        let event = Event::from_json(Bytes::from_static(
            br#"{"type":"reaction_added","reaction":"wave","item":{"channel":"C9"}}"#,
        ))
        .expect("decode");
        let reaction: Reaction = event.decode().expect("strict decode");
        assert_eq!(reaction.reaction, "wave");
        assert_eq!(reaction.item.channel, "C9");
    }

    #[test]
    fn test_decode_text_reply() {
        let inbound = decode_text(Bytes::from_static(
            br#"{"ok":true,"reply_to":7,"ts":"123.4","text":"hello"}"#,
        ))
        .expect("decode");
        let Inbound::Reply(reply) = inbound else {
            panic!("expected reply");
        };
        assert_eq!(reply.reply_to(), RequestId::new(7));
        assert!(reply.is_ok());
        assert_eq!(reply.ts(), Some("123.4"));
        assert!(reply.into_result().is_ok());
    }

    #[test]
    fn test_decode_text_reply_error() {
        let inbound = decode_text(Bytes::from_static(
            br#"{"ok":false,"reply_to":3,"error":{"code":2,"msg":"message text is missing"}}"#,
        ))
        .expect("decode");
        let Inbound::Reply(reply) = inbound else {
            panic!("expected reply");
        };
        assert_eq!(
            reply.error(),
            Some(&ReplyErrorBody {
                code: 2,
                msg: "message text is missing".to_string()
            })
        );
        match reply.into_result() {
            Err(RtmError::Reply { code, message }) => {
                assert_eq!(code, 2);
                assert_eq!(message, "message text is missing");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_typed_event_with_reply_to_is_an_event() {
        let inbound = decode_text(Bytes::from_static(
            br#"{"type":"message","reply_to":4,"channel":"C1","text":"last"}"#,
        ))
        .expect("decode");
        assert!(matches!(inbound, Inbound::Event(e) if e.is(MESSAGE)));
    }

    #[test]
    fn test_decode_frame_variants() {
        let inbound = decode_frame(Message::text(r#"{"type":"hello"}"#)).expect("text");
        assert!(matches!(inbound, Inbound::Event(e) if e.is(HELLO)));

        let inbound = decode_frame(Message::Pong(Bytes::new())).expect("pong");
        assert!(matches!(inbound, Inbound::Event(e) if e.is(PONG)));

        let inbound = decode_frame(Message::Ping(Bytes::from_static(b"p"))).expect("ping");
        assert!(matches!(inbound, Inbound::Ping(data) if data.as_ref() == b"p"));

        let err = decode_frame(Message::Binary(Bytes::from_static(b"\x00"))).unwrap_err();
        assert!(matches!(err, RtmError::Decode { .. }));

        let err = decode_frame(Message::Close(None)).unwrap_err();
        assert!(matches!(err, RtmError::ConnectionClosed { .. }));
    }

    #[test]
    fn test_decode_rejects_untyped_and_non_objects() {
        assert!(matches!(
            decode_text(Bytes::from_static(br#"{"channel":"C1"}"#)),
            Err(RtmError::Decode { .. })
        ));
        assert!(matches!(
            decode_text(Bytes::from_static(b"[1,2]")),
            Err(RtmError::Decode { .. })
        ));
        assert!(matches!(
            decode_text(Bytes::from_static(b"not json")),
            Err(RtmError::Serialization(_))
        ));
    }
}
