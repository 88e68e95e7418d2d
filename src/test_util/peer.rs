use tokio::net::{TcpListener, TcpStream};

use crate::topic::endpoint::Endpoint;
use crate::wire::frame::{FrameReader, DEFAULT_MAX_FRAME_LEN};
use crate::wire::handshake::ConnectionHeader;

/// Connects to a sender's streaming endpoint the way a remote subscriber does, returning the
///  stream (with a reader for the frames that follow) and the sender's handshake reply.
pub async fn connect_as_subscriber(endpoint: &Endpoint, header: &ConnectionHeader) -> anyhow::Result<(TcpStream, FrameReader, ConnectionHeader)> {
    let mut stream = TcpStream::connect(endpoint.socket_addr_string()).await?;
    header.write_to(&mut stream).await?;

    let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_LEN);
    let reply = ConnectionHeader::read_from(&mut reader, &mut stream).await?;
    Ok((stream, reader, reply))
}

/// A listening socket that plays the publishing side of streaming connections
pub struct FakePublisher {
    listener: TcpListener,
    endpoint: Endpoint,
}

impl FakePublisher {
    pub async fn bind() -> anyhow::Result<FakePublisher> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr()?.port());
        Ok(FakePublisher { listener, endpoint })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accepts one connection, reads the subscriber's header and answers with `reply`
    pub async fn accept(&self, reply: &ConnectionHeader) -> anyhow::Result<(TcpStream, ConnectionHeader)> {
        let (mut stream, _) = self.listener.accept().await?;
        let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_LEN);
        let subscriber_header = ConnectionHeader::read_from(&mut reader, &mut stream).await?;
        reply.write_to(&mut stream).await?;
        Ok((stream, subscriber_header))
    }
}
