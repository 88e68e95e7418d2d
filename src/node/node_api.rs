use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::debug;

use crate::rpc::rpc_client::RpcClient;
use crate::rpc::rpc_value::RpcValue;
use crate::topic::endpoint::Endpoint;

pub const TCPROS: &str = "TCPROS";

/// Calls on a remote peer node's RPC server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeApi: Send + Sync + 'static {
    /// Asks the node at `node_uri` for a streaming endpoint for `topic`. `Ok(None)` means the
    ///  node answered, but declined.
    async fn request_topic(&self, node_uri: &str, topic: &str) -> anyhow::Result<Option<Endpoint>>;
}

pub struct NodeClient {
    caller_id: String,
    timeout: Duration,
    max_body_len: usize,
}

impl NodeClient {
    pub fn new(caller_id: &str, timeout: Duration, max_body_len: usize) -> NodeClient {
        NodeClient {
            caller_id: caller_id.to_string(),
            timeout,
            max_body_len,
        }
    }
}

#[async_trait]
impl NodeApi for NodeClient {
    async fn request_topic(&self, node_uri: &str, topic: &str) -> anyhow::Result<Option<Endpoint>> {
        let node = Endpoint::parse_uri(node_uri)?;
        let client = RpcClient::new(node, self.timeout, self.max_body_len);

        let protocols = RpcValue::Array(vec![vec![TCPROS].into()]);
        let response = client.call("requestTopic", vec![self.caller_id.as_str().into(), topic.into(), protocols]).await?;
        if !response.is_success() {
            debug!("node {} declined requestTopic for {}: {}", node_uri, topic, response.message);
            return Ok(None);
        }

        match response.payload.as_array()? {
            [protocol, host, port] => {
                if protocol.as_str()? != TCPROS {
                    bail!("node {} offered unsupported protocol {:?}", node_uri, protocol);
                }
                let port = u16::try_from(port.as_int()?)?;
                Ok(Some(Endpoint::new(host.as_str()?, port)))
            }
            other => bail!("malformed requestTopic response from {}: {:?}", node_uri, other),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::rpc::rpc_server::{RpcHandler, RpcServer};
    use crate::rpc::rpc_value::{RpcRequest, RpcResponse};
    use crate::wire::frame::DEFAULT_MAX_FRAME_LEN;

    struct FakeNode;

    #[async_trait]
    impl RpcHandler for FakeNode {
        async fn handle_call(&self, request: RpcRequest) -> RpcResponse {
            assert_eq!(request.method, "requestTopic");
            assert_eq!(request.args[0], RpcValue::str("/listener"));
            match request.args[1].as_str().unwrap() {
                "/chatter" => RpcResponse::success("ready", RpcValue::Array(vec![TCPROS.into(), "talker-host".into(), 4711.into()])),
                "/weird" => RpcResponse::success("ready", RpcValue::Array(vec!["UDPROS".into(), "h".into(), 1.into()])),
                "/broken" => RpcResponse::success("ready", RpcValue::Array(vec![TCPROS.into(), "h".into(), 99999.into()])),
                _ => RpcResponse::failure("no such topic"),
            }
        }
    }

    #[tokio::test]
    async fn test_request_topic() {
        let server = RpcServer::start("127.0.0.1:0", Arc::new(FakeNode), DEFAULT_MAX_FRAME_LEN, Duration::from_secs(1)).await.unwrap();
        let uri = Endpoint::new("127.0.0.1", server.local_addr().port()).to_uri();
        let client = NodeClient::new("/listener", Duration::from_secs(5), DEFAULT_MAX_FRAME_LEN);

        assert_eq!(client.request_topic(&uri, "/chatter").await.unwrap(), Some(Endpoint::new("talker-host", 4711)));
        assert_eq!(client.request_topic(&uri, "/unknown").await.unwrap(), None);
        assert!(client.request_topic(&uri, "/weird").await.is_err());
        assert!(client.request_topic(&uri, "/broken").await.is_err());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_request_topic_malformed_uri() {
        let client = NodeClient::new("/listener", Duration::from_secs(1), DEFAULT_MAX_FRAME_LEN);
        assert!(client.request_topic("not a uri", "/chatter").await.is_err());
    }
}
