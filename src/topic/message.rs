use std::fmt::Debug;

use bytes::BytesMut;

/// Wildcard value for the `type` and `md5sum` handshake fields.
pub const WILDCARD: &str = "*";

/// The contract between this transport layer and generated message types. The transport never
///  looks inside a payload: it only asks for its length, serializes it into a frame and hands
///  received frame payloads back to [Message::deser].
pub trait Message: Debug + Send + Sync + 'static {
    /// fully qualified type name, e.g. `std_msgs/String`
    const TYPE_NAME: &'static str;
    const MD5SUM: &'static str;
    /// the message definition text, transmitted in the handshake for introspection
    const DEFINITION: &'static str;

    fn byte_len(&self) -> usize;

    fn ser(&self, buf: &mut BytesMut);

    fn deser(buf: &[u8]) -> anyhow::Result<Self> where Self: Sized;
}

/// Object-safe view on a [Message] that outbound queues work with, independent of the concrete
///  message type.
pub trait WireMessage: Debug + Send + Sync + 'static {
    fn byte_len(&self) -> usize;

    fn ser(&self, buf: &mut BytesMut);
}

impl <T: Message> WireMessage for T {
    fn byte_len(&self) -> usize {
        Message::byte_len(self)
    }

    fn ser(&self, buf: &mut BytesMut) {
        Message::ser(self, buf)
    }
}

/// A message of unknown type, kept as raw payload bytes. Subscribing with this type uses the
///  wildcard handshake, accepting any publisher on the topic.
///
/// NB: In wildcard mode there is no type or checksum check at all - a publisher of an entirely
///      unrelated type is accepted, and interpreting the payload is the caller's responsibility.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct DynamicMessage {
    pub payload: Vec<u8>,
}

impl Message for DynamicMessage {
    const TYPE_NAME: &'static str = WILDCARD;
    const MD5SUM: &'static str = WILDCARD;
    const DEFINITION: &'static str = "";

    fn byte_len(&self) -> usize {
        self.payload.len()
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.payload);
    }

    fn deser(buf: &[u8]) -> anyhow::Result<Self> {
        Ok(DynamicMessage { payload: buf.to_vec() })
    }
}
