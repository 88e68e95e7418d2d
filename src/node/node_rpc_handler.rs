//! The peer-callable RPC methods of this node.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::client::client_events::{ClientEvent, ParamUpdatedData, ShutdownRequestedData};
use crate::client::ros_client::ClientCore;
use crate::node::node_api::TCPROS;
use crate::rpc::rpc_server::RpcHandler;
use crate::rpc::rpc_value::{RpcRequest, RpcResponse, RpcValue};
use crate::transport::tcp_receiver::ReceiverState;
use crate::transport::tcp_sender::SenderState;
use crate::util::safe_converter::SaturatingCast;

pub struct NodeRpcHandler {
    core: Arc<ClientCore>,
}

#[async_trait]
impl RpcHandler for NodeRpcHandler {
    async fn handle_call(&self, request: RpcRequest) -> RpcResponse {
        let result = match request.method.as_str() {
            "requestTopic" => self.request_topic(&request).await,
            "publisherUpdate" => self.publisher_update(&request).await,
            "getPid" => Ok(RpcResponse::success("", rpc_int(std::process::id()))),
            "getBusInfo" => self.get_bus_info().await,
            "getBusStats" => self.get_bus_stats().await,
            "shutdown" => self.shutdown(&request),
            "paramUpdate" => self.param_update(&request),
            "getMasterUri" => Ok(RpcResponse::success("", self.core.master.master_uri())),
            "getSubscriptions" => Ok(self.get_subscriptions().await),
            "getPublications" => Ok(self.get_publications().await),
            other => {
                debug!("call to unknown method {}", other);
                return RpcResponse::error(format!("unknown method {}", other));
            }
        };

        result.unwrap_or_else(|e| {
            debug!("call to {} failed: {}", request.method, e);
            RpcResponse::error(e.to_string())
        })
    }
}

fn arg<'a>(request: &'a RpcRequest, index: usize) -> anyhow::Result<&'a RpcValue> {
    request.args.get(index)
        .ok_or_else(|| anyhow!("{} expects at least {} arguments", request.method, index + 1))
}

fn rpc_int(value: impl SaturatingCast<i32>) -> RpcValue {
    RpcValue::Int(value.saturating_cast())
}

fn str_arg<'a>(request: &'a RpcRequest, index: usize) -> anyhow::Result<&'a str> {
    arg(request, index)?.as_str()
}

impl NodeRpcHandler {
    pub(crate) fn new(core: Arc<ClientCore>) -> NodeRpcHandler {
        NodeRpcHandler { core }
    }

    /// A peer wants to subscribe: create a sender for it and tell it where to connect
    async fn request_topic(&self, request: &RpcRequest) -> anyhow::Result<RpcResponse> {
        let caller_id = str_arg(request, 0)?;
        let topic = str_arg(request, 1)?;

        let supports_tcpros = arg(request, 2)?.as_array()?
            .iter()
            .filter_map(|protocol| protocol.as_array().ok())
            .any(|protocol| matches!(protocol.first(), Some(RpcValue::Str(name)) if name == TCPROS));
        if !supports_tcpros {
            return Ok(RpcResponse::failure("no supported protocol"));
        }

        let Some(publisher) = self.core.publisher(topic).await else {
            return Ok(RpcResponse::failure(format!("{} is not a publisher of {}", self.core.config.caller_id, topic)));
        };

        let endpoint = publisher.request_topic(caller_id).await?;
        Ok(RpcResponse::success(
            &format!("ready on {}", endpoint),
            RpcValue::Array(vec![TCPROS.into(), endpoint.hostname.as_str().into(), i32::from(endpoint.port).into()]),
        ))
    }

    /// The registry pushes the current list of publishers for a topic we subscribe to
    async fn publisher_update(&self, request: &RpcRequest) -> anyhow::Result<RpcResponse> {
        let topic = str_arg(request, 1)?;
        let publisher_uris = arg(request, 2)?.as_str_vec()?;

        match self.core.subscriber(topic).await {
            Some(subscriber) => {
                debug!("publisher update for {}: {:?}", topic, publisher_uris);
                subscriber.manager().update_publishers(&publisher_uris).await;
                Ok(RpcResponse::success("publisher update received", 0))
            }
            None => Ok(RpcResponse::success(&format!("not subscribed to {}, ignoring", topic), 0)),
        }
    }

    /// rows of `[connection id, destination, direction, transport, topic, connected]`
    async fn get_bus_info(&self) -> anyhow::Result<RpcResponse> {
        let mut rows = Vec::new();

        let subscribers: Vec<_> = self.core.subscribers.read().await.values().cloned().collect();
        for subscriber in subscribers {
            for receiver in subscriber.manager().receivers().await {
                rows.push(RpcValue::Array(vec![
                    rpc_int(receiver.connection_id()),
                    receiver.remote_uri().into(),
                    "i".into(),
                    TCPROS.into(),
                    receiver.topic().into(),
                    (receiver.state() == ReceiverState::Active).into(),
                ]));
            }
        }

        let publishers: Vec<_> = self.core.publishers.read().await.values().cloned().collect();
        for publisher in publishers {
            for sender in publisher.manager().senders() {
                rows.push(RpcValue::Array(vec![
                    rpc_int(sender.connection_id()),
                    sender.remote_caller_id().into(),
                    "o".into(),
                    TCPROS.into(),
                    sender.topic().into(),
                    (sender.state() == SenderState::Active).into(),
                ]));
            }
        }

        Ok(RpcResponse::success("bus info", RpcValue::Array(rows)))
    }

    /// `[publish stats, subscribe stats, service stats]`
    async fn get_bus_stats(&self) -> anyhow::Result<RpcResponse> {
        let mut publish_stats = Vec::new();
        let publishers: Vec<_> = self.core.publishers.read().await.values().cloned().collect();
        for publisher in publishers {
            let mut total_bytes = 0;
            let mut connections = Vec::new();
            for sender in publisher.manager().senders() {
                let stats = sender.stats();
                total_bytes += stats.bytes_sent;
                connections.push(RpcValue::Array(vec![
                    rpc_int(sender.connection_id()),
                    rpc_int(stats.bytes_sent),
                    rpc_int(stats.num_sent),
                    (sender.state() == SenderState::Active).into(),
                ]));
            }
            publish_stats.push(RpcValue::Array(vec![
                publisher.topic_info().topic.as_str().into(),
                rpc_int(total_bytes),
                RpcValue::Array(connections),
            ]));
        }

        let mut subscribe_stats = Vec::new();
        let subscribers: Vec<_> = self.core.subscribers.read().await.values().cloned().collect();
        for subscriber in subscribers {
            let mut connections = Vec::new();
            for receiver in subscriber.manager().receivers().await {
                let stats = receiver.stats();
                connections.push(RpcValue::Array(vec![
                    rpc_int(receiver.connection_id()),
                    rpc_int(stats.bytes_received),
                    // drop estimate: not known on the receiving side
                    RpcValue::Int(-1),
                    (receiver.state() == ReceiverState::Active).into(),
                ]));
            }
            subscribe_stats.push(RpcValue::Array(vec![
                subscriber.topic_info().topic.as_str().into(),
                RpcValue::Array(connections),
            ]));
        }

        let service_stats = RpcValue::Array(vec![0.into(), 0.into(), 0.into()]);
        Ok(RpcResponse::success("bus stats", RpcValue::Array(vec![
            RpcValue::Array(publish_stats),
            RpcValue::Array(subscribe_stats),
            service_stats,
        ])))
    }

    fn shutdown(&self, request: &RpcRequest) -> anyhow::Result<RpcResponse> {
        let caller_id = str_arg(request, 0)?;
        let reason = match request.args.get(1) {
            Some(reason) => reason.as_str()?.to_string(),
            None => String::new(),
        };
        info!("{} requested shutdown: {}", caller_id, reason);

        self.core.events.send_event(ClientEvent::ShutdownRequested(ShutdownRequestedData {
            caller_id: caller_id.to_string(),
            reason,
        }));
        Ok(RpcResponse::success("shutdown", 0))
    }

    fn param_update(&self, request: &RpcRequest) -> anyhow::Result<RpcResponse> {
        let key = str_arg(request, 1)?;
        let value = arg(request, 2)?.clone();
        debug!("parameter {} updated to {:?}", key, value);

        self.core.params.lock()
            .expect("lock poisoned")
            .insert(key.to_string(), value);
        self.core.events.send_event(ClientEvent::ParamUpdated(ParamUpdatedData {
            key: key.to_string(),
        }));
        Ok(RpcResponse::success("", 0))
    }

    async fn get_subscriptions(&self) -> RpcResponse {
        let mut topics: Vec<RpcValue> = self.core.subscribers.read().await
            .values()
            .map(|s| vec![s.topic_info().topic.as_str(), s.topic_info().type_name.as_str()].into())
            .collect();
        sort_by_topic(&mut topics);
        RpcResponse::success("subscriptions", RpcValue::Array(topics))
    }

    async fn get_publications(&self) -> RpcResponse {
        let mut topics: Vec<RpcValue> = self.core.publishers.read().await
            .values()
            .map(|p| vec![p.topic_info().topic.as_str(), p.topic_info().type_name.as_str()].into())
            .collect();
        sort_by_topic(&mut topics);
        RpcResponse::success("publications", RpcValue::Array(topics))
    }
}

fn sort_by_topic(topics: &mut [RpcValue]) {
    topics.sort_by(|a, b| {
        let topic_of = |v: &RpcValue| v.as_array().ok()
            .and_then(|pair| pair.first())
            .and_then(|t| t.as_str().ok())
            .map(|t| t.to_string());
        topic_of(a).cmp(&topic_of(b))
    });
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::client::client_config::ClientConfig;
    use crate::client::ros_client::RosClient;
    use crate::master::master_api::MockMasterApi;
    use crate::node::node_api::MockNodeApi;
    use crate::rpc::rpc_client::RpcClient;
    use crate::rpc::rpc_value::StatusCode;
    use crate::test_util::message::{Int32Message, StringMessage};
    use crate::topic::message::Message;
    use crate::topic::endpoint::Endpoint;
    use crate::wire::frame::DEFAULT_MAX_FRAME_LEN;

    async fn start_client() -> (RosClient, RpcClient) {
        let mut master = MockMasterApi::new();
        master.expect_master_uri().return_const("http://master:11311/".to_string());
        master.expect_register_subscriber().returning(|_, _| Vec::new());
        master.expect_unregister_subscriber().return_const(true);
        master.expect_register_publisher().returning(|_, _| Vec::new());
        master.expect_unregister_publisher().return_const(true);

        let mut config = ClientConfig::new("/viz", Endpoint::new("127.0.0.1", 11311));
        config.bind_host = "127.0.0.1".to_string();
        let client = RosClient::with_apis(config, Arc::new(master), Arc::new(MockNodeApi::new())).await.unwrap();
        let rpc = RpcClient::new(Endpoint::parse_uri(client.uri()).unwrap(), Duration::from_secs(2), DEFAULT_MAX_FRAME_LEN);
        (client, rpc)
    }

    #[tokio::test]
    async fn test_simple_methods() {
        let (client, rpc) = start_client().await;

        let response = rpc.call("getPid", vec!["/test".into()]).await.unwrap();
        assert_eq!(response.payload, RpcValue::Int(std::process::id() as i32));

        let response = rpc.call("getMasterUri", vec!["/test".into()]).await.unwrap();
        assert_eq!(response.payload, RpcValue::str("http://master:11311/"));

        let response = rpc.call("noSuchMethod", vec![]).await.unwrap();
        assert_eq!(response.code, StatusCode::Error);

        client.close().await;
    }

    #[rstest]
    #[case::missing_args("requestTopic", vec![RpcValue::str("/test")])]
    #[case::wrong_arg_type("publisherUpdate", vec![RpcValue::str("/test"), RpcValue::Int(1), RpcValue::Int(2)])]
    #[case::param_without_value("paramUpdate", vec![RpcValue::str("/test"), RpcValue::str("/key")])]
    #[tokio::test]
    async fn test_malformed_arguments_are_errors(#[case] method: &str, #[case] args: Vec<RpcValue>) {
        let (client, rpc) = start_client().await;
        let response = rpc.call(method, args).await.unwrap();
        assert_eq!(response.code, StatusCode::Error);
        client.close().await;
    }

    #[tokio::test]
    async fn test_request_topic_failures() {
        let (client, rpc) = start_client().await;
        client.advertise::<StringMessage>("/chatter").await.unwrap();

        let response = rpc.call("requestTopic", vec!["/listener".into(), "/unknown".into(), RpcValue::Array(vec![vec![TCPROS].into()])]).await.unwrap();
        assert_eq!(response.code, StatusCode::Failure);

        let response = rpc.call("requestTopic", vec!["/listener".into(), "/chatter".into(), RpcValue::Array(vec![vec!["UDPROS"].into()])]).await.unwrap();
        assert_eq!(response.code, StatusCode::Failure);

        let response = rpc.call("requestTopic", vec!["/listener".into(), "/chatter".into(), RpcValue::Array(vec![vec!["UDPROS"].into(), vec![TCPROS].into()])]).await.unwrap();
        assert!(response.is_success());
        let payload = response.payload.as_array().unwrap();
        assert_eq!(payload[0], RpcValue::str(TCPROS));
        assert_eq!(payload[1], RpcValue::str("127.0.0.1"));

        client.close().await;
    }

    #[tokio::test]
    async fn test_publisher_update_for_unknown_topic_is_ignored() {
        let (client, rpc) = start_client().await;
        let response = rpc.call("publisherUpdate", vec!["/master".into(), "/nothing".into(), vec!["http://a:1/"].into()]).await.unwrap();
        assert!(response.is_success());
        client.close().await;
    }

    #[tokio::test]
    async fn test_param_update_and_shutdown_notify() {
        let (client, rpc) = start_client().await;
        let mut events = client.subscribe_events();

        let response = rpc.call("paramUpdate", vec!["/master".into(), "/rate".into(), RpcValue::Double(2.5)]).await.unwrap();
        assert!(response.is_success());
        assert_eq!(client.cached_param("/rate"), Some(RpcValue::Double(2.5)));
        assert_eq!(events.recv().await.unwrap(), ClientEvent::ParamUpdated(ParamUpdatedData { key: "/rate".to_string() }));

        let response = rpc.call("shutdown", vec!["/master".into(), "going down".into()]).await.unwrap();
        assert!(response.is_success());
        assert_eq!(events.recv().await.unwrap(), ClientEvent::ShutdownRequested(ShutdownRequestedData {
            caller_id: "/master".to_string(),
            reason: "going down".to_string(),
        }));

        client.close().await;
    }

    #[tokio::test]
    async fn test_introspection() {
        let (client, rpc) = start_client().await;
        client.subscribe("/scan", |_: &StringMessage| {}).await.unwrap();
        client.advertise::<Int32Message>("/count").await.unwrap();
        client.advertise::<StringMessage>("/chatter").await.unwrap();

        let response = rpc.call("getSubscriptions", vec!["/test".into()]).await.unwrap();
        assert_eq!(response.payload, RpcValue::Array(vec![vec!["/scan", StringMessage::TYPE_NAME].into()]));

        let response = rpc.call("getPublications", vec!["/test".into()]).await.unwrap();
        assert_eq!(response.payload, RpcValue::Array(vec![
            vec!["/chatter", StringMessage::TYPE_NAME].into(),
            vec!["/count", Int32Message::TYPE_NAME].into(),
        ]));

        rpc.call("requestTopic", vec!["/listener".into(), "/chatter".into(), RpcValue::Array(vec![vec![TCPROS].into()])]).await.unwrap();

        let response = rpc.call("getBusInfo", vec!["/test".into()]).await.unwrap();
        let rows = response.payload.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        let row = rows[0].as_array().unwrap();
        assert_eq!(row[1], RpcValue::str("/listener"));
        assert_eq!(row[2], RpcValue::str("o"));
        assert_eq!(row[4], RpcValue::str("/chatter"));
        assert_eq!(row[5], RpcValue::Bool(false));

        let response = rpc.call("getBusStats", vec!["/test".into()]).await.unwrap();
        let stats = response.payload.as_array().unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].as_array().unwrap().len(), 2);
        assert_eq!(stats[1].as_array().unwrap().len(), 1);

        client.close().await;
    }
}
