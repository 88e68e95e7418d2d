use bytes::{BufMut, BytesMut};

use crate::topic::message::Message;
use crate::util::buf::{put_string, try_get_string};

/// Wire compatible with `std_msgs/String`
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct StringMessage {
    pub data: String,
}

impl StringMessage {
    pub fn new(data: &str) -> StringMessage {
        StringMessage { data: data.to_string() }
    }
}

impl Message for StringMessage {
    const TYPE_NAME: &'static str = "std_msgs/String";
    const MD5SUM: &'static str = "992ce8a1687cec8c8bd883ec73ca41d1";
    const DEFINITION: &'static str = "string data\n";

    fn byte_len(&self) -> usize {
        std::mem::size_of::<u32>() + self.data.len()
    }

    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.data);
    }

    fn deser(mut buf: &[u8]) -> anyhow::Result<Self> {
        Ok(StringMessage {
            data: try_get_string(&mut buf)?,
        })
    }
}

/// Wire compatible with `std_msgs/Int32`, used to provoke type mismatches
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct Int32Message {
    pub data: i32,
}

impl Message for Int32Message {
    const TYPE_NAME: &'static str = "std_msgs/Int32";
    const MD5SUM: &'static str = "da5909fbe378aeaf85e547e830cc1bb7";
    const DEFINITION: &'static str = "int32 data\n";

    fn byte_len(&self) -> usize {
        std::mem::size_of::<i32>()
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.data);
    }

    fn deser(mut buf: &[u8]) -> anyhow::Result<Self> {
        Ok(Int32Message {
            data: bytes::Buf::try_get_i32_le(&mut buf)?,
        })
    }
}
