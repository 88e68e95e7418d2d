//! The connection header exchanged once per streaming connection before any message is sent.
//!
//! ```ascii
//! frame length (u32 LE)
//!   field length (u32 LE) "callerid=/talker"
//!   field length (u32 LE) "topic=/chatter"
//!   ...
//! ```
//!
//! A peer rejecting the connection replies with a header whose first field is `error=<reason>`.

use anyhow::bail;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::topic::message::WILDCARD;
use crate::topic::topic_info::TopicInfo;
use crate::util::buf::{put_string, try_get_len};
use crate::wire::frame::{write_frame, FrameReader};

pub const CALLER_ID: &str = "callerid";
pub const TOPIC: &str = "topic";
pub const TYPE: &str = "type";
pub const MD5SUM: &str = "md5sum";
pub const MESSAGE_DEFINITION: &str = "message_definition";
pub const TCP_NODELAY: &str = "tcp_nodelay";
pub const LATCHING: &str = "latching";
pub const PERSISTENT: &str = "persistent";
pub const ERROR: &str = "error";

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HandshakeError {
    #[error("the remote side rejected the connection: {0}")]
    Rejected(String),
    #[error("handshake field '{field}' mismatch: expected {expected:?}, was {actual:?}")]
    Mismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },
    #[error("handshake is missing field '{0}'")]
    MissingField(&'static str),
    #[error("malformed handshake: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ConnectionHeader {
    fields: Vec<(String, String)>,
}

impl ConnectionHeader {
    pub fn new() -> ConnectionHeader {
        Default::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> ConnectionHeader {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    pub fn error(reason: &str) -> ConnectionHeader {
        ConnectionHeader::new().with(ERROR, reason)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, key: &'static str) -> Result<&str, HandshakeError> {
        self.get(key)
            .ok_or(HandshakeError::MissingField(key))
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("1")
    }

    /// The reason if the first field signals an error, `None` otherwise
    pub fn error_reason(&self) -> Option<&str> {
        match self.fields.first() {
            Some((k, v)) if k == ERROR => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        for (k, v) in &self.fields {
            put_string(buf, &format!("{}={}", k, v));
        }
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<ConnectionHeader> {
        let mut fields = Vec::new();
        while buf.has_remaining() {
            let len = try_get_len(&mut buf)?;
            let field = std::str::from_utf8(&buf[..len])?;
            buf.advance(len);

            match field.split_once('=') {
                Some((k, v)) => fields.push((k.to_string(), v.to_string())),
                None => bail!(HandshakeError::Malformed(format!("field without '=': {:?}", field))),
            }
        }
        Ok(ConnectionHeader { fields })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        write_frame(stream, &buf).await
    }

    /// Reads a header frame; a clean close before the header is an error at this point
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut FrameReader, stream: &mut R) -> anyhow::Result<ConnectionHeader> {
        match reader.read_frame(stream).await? {
            Some(payload) => ConnectionHeader::deser(payload),
            None => bail!(HandshakeError::Malformed("connection closed before the handshake completed".to_string())),
        }
    }

    /// The header a subscribing (consuming) side sends to open a connection
    pub fn for_subscriber(topic_info: &TopicInfo, tcp_nodelay: bool) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(CALLER_ID, &topic_info.caller_id)
            .with(TOPIC, &topic_info.topic)
            .with(TYPE, &topic_info.type_name)
            .with(MD5SUM, &topic_info.md5sum)
            .with(MESSAGE_DEFINITION, &topic_info.definition)
            .with(TCP_NODELAY, if tcp_nodelay { "1" } else { "0" })
            .with(PERSISTENT, "0")
    }

    /// The header a publishing (producing) side replies with after accepting a subscriber
    pub fn for_publisher(topic_info: &TopicInfo, latching: bool) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(CALLER_ID, &topic_info.caller_id)
            .with(TOPIC, &topic_info.topic)
            .with(TYPE, &topic_info.type_name)
            .with(MD5SUM, &topic_info.md5sum)
            .with(MESSAGE_DEFINITION, &topic_info.definition)
            .with(LATCHING, if latching { "1" } else { "0" })
    }

    /// Producer side validation of a subscriber's header. `expected_caller_id` is the caller that
    ///  requested this connection via `requestTopic`, if known.
    ///
    /// NB: A subscriber sending `*` for type or checksum is accepted regardless of the advertised
    ///      type, i.e. without any integrity check.
    pub fn validate_subscriber(&self, advertised: &TopicInfo, expected_caller_id: Option<&str>) -> Result<(), HandshakeError> {
        if let Some(reason) = self.error_reason() {
            return Err(HandshakeError::Rejected(reason.to_string()));
        }

        let caller_id = self.require(CALLER_ID)?;
        if let Some(expected) = expected_caller_id {
            check_field(CALLER_ID, expected, caller_id)?;
        }
        check_field(TOPIC, &advertised.topic, self.require(TOPIC)?)?;
        check_wildcard_field(TYPE, &advertised.type_name, self.require(TYPE)?)?;
        check_wildcard_field(MD5SUM, &advertised.md5sum, self.require(MD5SUM)?)?;
        Ok(())
    }

    /// Consumer side validation of a publisher's reply. Our own wildcard type accepts any reply.
    pub fn validate_publisher(&self, subscribed: &TopicInfo) -> Result<(), HandshakeError> {
        if let Some(reason) = self.error_reason() {
            return Err(HandshakeError::Rejected(reason.to_string()));
        }

        self.require(CALLER_ID)?;
        if subscribed.type_name != WILDCARD {
            check_field(TYPE, &subscribed.type_name, self.require(TYPE)?)?;
        }
        if subscribed.md5sum != WILDCARD {
            check_field(MD5SUM, &subscribed.md5sum, self.require(MD5SUM)?)?;
        }
        Ok(())
    }
}

fn check_field(field: &'static str, expected: &str, actual: &str) -> Result<(), HandshakeError> {
    if expected != actual {
        return Err(HandshakeError::Mismatch {
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn check_wildcard_field(field: &'static str, expected: &str, actual: &str) -> Result<(), HandshakeError> {
    if actual == WILDCARD {
        return Ok(());
    }
    check_field(field, expected, actual)
}
