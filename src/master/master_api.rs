//! The client side of the naming / discovery registry ("master"). Registry unavailability is
//!  never an error for callers: every operation degrades to an empty or neutral result, and the
//!  problem is logged.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, warn};

use crate::rpc::rpc_client::RpcClient;
use crate::rpc::rpc_value::RpcValue;
use crate::topic::endpoint::Endpoint;

/// A topic (or service) together with the nodes that take part in it
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct TopicParticipants {
    pub topic: String,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct SystemState {
    pub publishers: Vec<TopicParticipants>,
    pub subscribers: Vec<TopicParticipants>,
    pub services: Vec<TopicParticipants>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TopicType {
    pub topic: String,
    pub type_name: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MasterApi: Send + Sync + 'static {
    fn master_uri(&self) -> String;

    /// returns the URIs of the topic's current publishers
    async fn register_subscriber(&self, topic: &str, type_name: &str) -> Vec<String>;
    async fn unregister_subscriber(&self, topic: &str) -> bool;

    /// returns the URIs of the topic's current subscribers
    async fn register_publisher(&self, topic: &str, type_name: &str) -> Vec<String>;
    async fn unregister_publisher(&self, topic: &str) -> bool;

    async fn lookup_node(&self, node_name: &str) -> Option<String>;
    async fn lookup_service(&self, service: &str) -> Option<String>;
    async fn get_published_topics(&self, subgraph: &str) -> Vec<TopicType>;
    async fn get_system_state(&self) -> SystemState;
}

pub struct MasterClient {
    caller_id: String,
    caller_uri: String,
    rpc: RpcClient,
}

impl MasterClient {
    pub fn new(caller_id: &str, caller_uri: &str, master: Endpoint, timeout: Duration, max_body_len: usize) -> MasterClient {
        MasterClient {
            caller_id: caller_id.to_string(),
            caller_uri: caller_uri.to_string(),
            rpc: RpcClient::new(master, timeout, max_body_len),
        }
    }

    /// Returns the payload of a successful call, `None` otherwise
    async fn call_degraded(&self, method: &str, args: Vec<RpcValue>) -> Option<RpcValue> {
        match self.rpc.call(method, args).await {
            Ok(response) if response.is_success() => Some(response.payload),
            Ok(response) => {
                debug!("master call '{}' returned {:?}: {}", method, response.code, response.message);
                None
            }
            Err(e) => {
                warn!("master call '{}' to {} failed: {}", method, self.rpc.endpoint(), e);
                None
            }
        }
    }

    async fn call_for_uri_list(&self, method: &str, args: Vec<RpcValue>) -> Vec<String> {
        let Some(payload) = self.call_degraded(method, args).await else {
            return Vec::new();
        };
        payload.as_str_vec()
            .unwrap_or_else(|e| {
                warn!("master returned a malformed URI list for '{}': {}", method, e);
                Vec::new()
            })
    }

    async fn call_for_string(&self, method: &str, args: Vec<RpcValue>) -> Option<String> {
        let payload = self.call_degraded(method, args).await?;
        match payload.as_str() {
            Ok(s) => Some(s.to_string()),
            Err(e) => {
                warn!("master returned a malformed string for '{}': {}", method, e);
                None
            }
        }
    }
}

#[async_trait]
impl MasterApi for MasterClient {
    fn master_uri(&self) -> String {
        self.rpc.endpoint().to_uri()
    }

    async fn register_subscriber(&self, topic: &str, type_name: &str) -> Vec<String> {
        self.call_for_uri_list("registerSubscriber", vec![
            self.caller_id.as_str().into(), topic.into(), type_name.into(), self.caller_uri.as_str().into(),
        ]).await
    }

    async fn unregister_subscriber(&self, topic: &str) -> bool {
        self.call_degraded("unregisterSubscriber", vec![
            self.caller_id.as_str().into(), topic.into(), self.caller_uri.as_str().into(),
        ]).await.is_some()
    }

    async fn register_publisher(&self, topic: &str, type_name: &str) -> Vec<String> {
        self.call_for_uri_list("registerPublisher", vec![
            self.caller_id.as_str().into(), topic.into(), type_name.into(), self.caller_uri.as_str().into(),
        ]).await
    }

    async fn unregister_publisher(&self, topic: &str) -> bool {
        self.call_degraded("unregisterPublisher", vec![
            self.caller_id.as_str().into(), topic.into(), self.caller_uri.as_str().into(),
        ]).await.is_some()
    }

    async fn lookup_node(&self, node_name: &str) -> Option<String> {
        self.call_for_string("lookupNode", vec![self.caller_id.as_str().into(), node_name.into()]).await
    }

    async fn lookup_service(&self, service: &str) -> Option<String> {
        self.call_for_string("lookupService", vec![self.caller_id.as_str().into(), service.into()]).await
    }

    async fn get_published_topics(&self, subgraph: &str) -> Vec<TopicType> {
        let Some(payload) = self.call_degraded("getPublishedTopics", vec![self.caller_id.as_str().into(), subgraph.into()]).await else {
            return Vec::new();
        };
        parse_topic_types(&payload)
            .unwrap_or_else(|e| {
                warn!("master returned a malformed topic list: {}", e);
                Vec::new()
            })
    }

    async fn get_system_state(&self) -> SystemState {
        let Some(payload) = self.call_degraded("getSystemState", vec![self.caller_id.as_str().into()]).await else {
            return SystemState::default();
        };
        parse_system_state(&payload)
            .unwrap_or_else(|e| {
                warn!("master returned a malformed system state: {}", e);
                SystemState::default()
            })
    }
}

fn parse_topic_types(payload: &RpcValue) -> anyhow::Result<Vec<TopicType>> {
    payload.as_array()?
        .iter()
        .map(|entry| {
            let pair = entry.as_str_vec()?;
            match pair.as_slice() {
                [topic, type_name] => Ok(TopicType { topic: topic.clone(), type_name: type_name.clone() }),
                _ => Err(anyhow::anyhow!("expected [topic, type], was {:?}", pair)),
            }
        })
        .collect()
}

fn parse_participants(value: &RpcValue) -> anyhow::Result<Vec<TopicParticipants>> {
    value.as_array()?
        .iter()
        .map(|entry| match entry.as_array()? {
            [topic, nodes] => Ok(TopicParticipants {
                topic: topic.as_str()?.to_string(),
                nodes: nodes.as_str_vec()?,
            }),
            other => Err(anyhow::anyhow!("expected [topic, [nodes]], was {:?}", other)),
        })
        .collect()
}

fn parse_system_state(payload: &RpcValue) -> anyhow::Result<SystemState> {
    match payload.as_array()? {
        [publishers, subscribers, services] => Ok(SystemState {
            publishers: parse_participants(publishers)?,
            subscribers: parse_participants(subscribers)?,
            services: parse_participants(services)?,
        }),
        other => Err(anyhow::anyhow!("expected three lists, got {}", other.len())),
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::net::TcpListener;

    use super::*;
    use crate::rpc::rpc_server::{RpcHandler, RpcServer};
    use crate::rpc::rpc_value::{RpcRequest, RpcResponse};
    use crate::wire::frame::DEFAULT_MAX_FRAME_LEN;

    struct FakeMaster;

    #[async_trait]
    impl RpcHandler for FakeMaster {
        async fn handle_call(&self, request: RpcRequest) -> RpcResponse {
            match request.method.as_str() {
                "registerSubscriber" => {
                    assert_eq!(request.args[0], RpcValue::str("/me"));
                    assert_eq!(request.args[3], RpcValue::str("http://me:1/"));
                    RpcResponse::success("subscribed", vec!["http://a:1/", "http://b:2/"])
                }
                "unregisterSubscriber" => RpcResponse::success("", 1),
                "registerPublisher" => RpcResponse::success("", RpcValue::Int(3)),
                "lookupNode" => RpcResponse::failure("unknown node"),
                "lookupService" => RpcResponse::success("", "http://srv:5/"),
                "getPublishedTopics" => RpcResponse::success("", RpcValue::Array(vec![
                    vec!["/chatter", "std_msgs/String"].into(),
                ])),
                "getSystemState" => RpcResponse::success("", RpcValue::Array(vec![
                    RpcValue::Array(vec![RpcValue::Array(vec!["/chatter".into(), vec!["/talker"].into()])]),
                    RpcValue::Array(vec![]),
                    RpcValue::Array(vec![RpcValue::Array(vec!["/srv".into(), vec!["/a", "/b"].into()])]),
                ])),
                _ => RpcResponse::error("unknown method"),
            }
        }
    }

    async fn client_for_fake_master() -> (RpcServer, MasterClient) {
        let server = RpcServer::start("127.0.0.1:0", Arc::new(FakeMaster), DEFAULT_MAX_FRAME_LEN, Duration::from_secs(1)).await.unwrap();
        let client = MasterClient::new("/me", "http://me:1/", Endpoint::new("127.0.0.1", server.local_addr().port()), Duration::from_secs(5), DEFAULT_MAX_FRAME_LEN);
        (server, client)
    }

    #[tokio::test]
    async fn test_successful_calls() {
        let (server, client) = client_for_fake_master().await;

        assert_eq!(client.register_subscriber("/chatter", "std_msgs/String").await, vec!["http://a:1/".to_string(), "http://b:2/".to_string()]);
        assert!(client.unregister_subscriber("/chatter").await);
        assert_eq!(client.lookup_service("/srv").await, Some("http://srv:5/".to_string()));
        assert_eq!(client.get_published_topics("").await, vec![TopicType { topic: "/chatter".to_string(), type_name: "std_msgs/String".to_string() }]);

        let state = client.get_system_state().await;
        assert_eq!(state.publishers, vec![TopicParticipants { topic: "/chatter".to_string(), nodes: vec!["/talker".to_string()] }]);
        assert!(state.subscribers.is_empty());
        assert_eq!(state.services[0].nodes.len(), 2);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_failure_and_malformed_payloads_degrade() {
        let (server, client) = client_for_fake_master().await;

        assert_eq!(client.lookup_node("/nobody").await, None);
        assert!(client.register_publisher("/chatter", "std_msgs/String").await.is_empty());
        assert!(!client.unregister_publisher("/chatter").await);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unresponsive_master_degrades_to_empty_state() {
        // accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _holder = tokio::spawn(async move {
            let mut connections = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                connections.push(stream);
            }
        });

        let client = MasterClient::new("/me", "http://me:1/", Endpoint::new("127.0.0.1", port), Duration::from_millis(200), DEFAULT_MAX_FRAME_LEN);

        let state = client.get_system_state().await;
        assert_eq!(state, SystemState::default());
        assert!(client.register_subscriber("/scan", "sensor_msgs/LaserScan").await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_master_degrades() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = MasterClient::new("/me", "http://me:1/", Endpoint::new("127.0.0.1", port), Duration::from_secs(1), DEFAULT_MAX_FRAME_LEN);
        assert_eq!(client.get_system_state().await, SystemState::default());
        assert_eq!(client.lookup_node("/talker").await, None);
    }

    #[test]
    fn test_parse_system_state_rejects_wrong_shape() {
        assert!(parse_system_state(&RpcValue::Array(vec![RpcValue::Array(vec![])])).is_err());
        assert!(parse_system_state(&RpcValue::Int(1)).is_err());
    }
}
