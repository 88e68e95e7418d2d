use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::client_config::ClientConfig;
use crate::client::client_events::{ClientEvent, ClientEventNotifier, Direction, NumConnectionsChangedData};
use crate::node::node_api::NodeApi;
use crate::topic::topic_info::TopicInfo;
use crate::transport::tcp_receiver::{MessageSink, TcpReceiver};

/// Keeps one receiver per remote publisher of a topic, reconciling against the publisher
///  lists the registry hands out.
pub struct ReceiverManager {
    config: Arc<ClientConfig>,
    topic_info: Arc<TopicInfo>,
    tcp_nodelay: bool,
    node_api: Arc<dyn NodeApi>,
    sink: Arc<dyn MessageSink>,
    events: Arc<ClientEventNotifier>,
    /// publisher node URI -> receiver
    connections: Mutex<FxHashMap<String, Arc<TcpReceiver>>>,
    last_known_count: AtomicUsize,
}

impl ReceiverManager {
    pub fn new(
        config: Arc<ClientConfig>,
        topic_info: Arc<TopicInfo>,
        tcp_nodelay: bool,
        node_api: Arc<dyn NodeApi>,
        sink: Arc<dyn MessageSink>,
        events: Arc<ClientEventNotifier>,
    ) -> ReceiverManager {
        ReceiverManager {
            config,
            topic_info,
            tcp_nodelay,
            node_api,
            sink,
            events,
            connections: Default::default(),
            last_known_count: AtomicUsize::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic_info.topic
    }

    /// Reconciles the connections with a new, authoritative list of publisher URIs: connections
    ///  to publishers that are not in the list are disposed, and new publishers are asked for
    ///  their streaming endpoints (concurrently) and connected to.
    pub async fn update_publishers(&self, publisher_uris: &[String]) {
        let mut connections = self.connections.lock().await;

        // a dead connection does not count as existing, so a listed publisher gets a fresh one
        connections.retain(|_, receiver| receiver.is_alive());

        let new_uris: FxHashSet<&str> = publisher_uris.iter()
            .map(String::as_str)
            .collect();

        let to_remove: Vec<String> = connections.keys()
            .filter(|uri| !new_uris.contains(uri.as_str()))
            .cloned()
            .collect();
        for uri in to_remove {
            if let Some(receiver) = connections.remove(&uri) {
                debug!("publisher {} is gone from {}", uri, self.topic_info.topic);
                receiver.dispose().await;
            }
        }

        let mut resolutions = JoinSet::new();
        for uri in new_uris.into_iter().filter(|uri| !connections.contains_key(*uri)) {
            let uri = uri.to_string();
            let node_api = self.node_api.clone();
            let topic = self.topic_info.topic.clone();
            resolutions.spawn(async move {
                let result = node_api.request_topic(&uri, &topic).await;
                (uri, result)
            });
        }

        while let Some(joined) = resolutions.join_next().await {
            match joined {
                Ok((uri, Ok(Some(endpoint)))) => {
                    info!("connecting to publisher {} of {} at {:?}", uri, self.topic_info.topic, endpoint);
                    let receiver = TcpReceiver::start(
                        self.config.clone(),
                        self.topic_info.clone(),
                        &uri,
                        endpoint,
                        self.tcp_nodelay,
                        self.node_api.clone(),
                        self.sink.clone(),
                    );
                    connections.insert(uri, Arc::new(receiver));
                }
                Ok((uri, Ok(None))) => debug!("publisher {} declined {}", uri, self.topic_info.topic),
                Ok((uri, Err(e))) => warn!("could not request {} from publisher {}: {}", self.topic_info.topic, uri, e),
                Err(e) => warn!("endpoint resolution task failed: {}", e),
            }
        }

        self.purge_dead(&mut connections);
    }

    /// Removes connections whose worker terminated
    pub async fn cleanup(&self) {
        let mut connections = self.connections.lock().await;
        self.purge_dead(&mut connections);
    }

    fn purge_dead(&self, connections: &mut FxHashMap<String, Arc<TcpReceiver>>) {
        connections.retain(|uri, receiver| {
            let alive = receiver.is_alive();
            if !alive {
                debug!("removing dead connection to {}", uri);
            }
            alive
        });
        self.update_count(connections.len());
    }

    fn update_count(&self, count: usize) {
        let previous = self.last_known_count.swap(count, Ordering::Relaxed);
        if previous != count {
            self.events.send_event(ClientEvent::NumConnectionsChanged(NumConnectionsChangedData {
                topic: self.topic_info.topic.clone(),
                direction: Direction::Inbound,
                count,
            }));
        }
    }

    /// Number of live connections. If the manager is busy reconciling, this reports the last
    ///  known count instead of waiting.
    pub async fn num_connections(&self) -> usize {
        match tokio::time::timeout(self.config.connection_count_lock_timeout, self.connections.lock()).await {
            Ok(connections) => connections.values()
                .filter(|r| r.is_alive())
                .count(),
            Err(_) => self.last_known_count.load(Ordering::Relaxed),
        }
    }

    pub async fn receivers(&self) -> Vec<Arc<TcpReceiver>> {
        self.connections.lock().await
            .values()
            .cloned()
            .collect()
    }

    pub async fn publisher_uris(&self) -> Vec<String> {
        let mut result: Vec<String> = self.connections.lock().await
            .keys()
            .cloned()
            .collect();
        result.sort();
        result
    }

    pub async fn stop(&self) {
        let mut connections = self.connections.lock().await;
        for (_, receiver) in connections.drain() {
            receiver.dispose().await;
        }
        self.update_count(0);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use mockall::predicate::{always, eq};

    use super::*;
    use crate::node::node_api::MockNodeApi;
    use crate::test_util::message::StringMessage;
    use crate::topic::endpoint::Endpoint;
    use crate::transport::tcp_receiver::ReceiverState;

    struct NullSink;
    impl MessageSink for NullSink {
        fn on_message(&self, _payload: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn uri(n: u16) -> String {
        format!("http://u{}:{}/", n, n)
    }

    /// receivers created by this config stay alive, waiting to retry
    fn config() -> Arc<ClientConfig> {
        let mut config = ClientConfig::new("/viz", Endpoint::new("127.0.0.1", 11311));
        config.receiver_connect_timeout = Duration::from_millis(100);
        config.receiver_reconnect_backoff = Duration::from_secs(3600);
        Arc::new(config)
    }

    fn manager(node_api: MockNodeApi) -> (ReceiverManager, Arc<ClientEventNotifier>) {
        let events = Arc::new(ClientEventNotifier::new());
        let manager = ReceiverManager::new(
            config(),
            Arc::new(TopicInfo::for_message::<StringMessage>("/viz", "/scan")),
            false,
            Arc::new(node_api),
            Arc::new(NullSink),
            events.clone(),
        );
        (manager, events)
    }

    /// an endpoint nobody listens on
    fn unreachable_endpoint() -> Endpoint {
        Endpoint::new("127.0.0.1", 1)
    }

    #[tokio::test]
    async fn test_reconciles_publisher_list() {
        let mut node_api = MockNodeApi::new();
        for n in [1, 2, 3] {
            node_api.expect_request_topic()
                .with(eq(uri(n)), eq("/scan"))
                .times(1)
                .returning(|_, _| Ok(Some(unreachable_endpoint())));
        }
        let (manager, events) = manager(node_api);
        let mut event_receiver = events.subscribe();

        manager.update_publishers(&[uri(1), uri(2)]).await;
        assert_eq!(manager.publisher_uris().await, vec![uri(1), uri(2)]);
        assert_eq!(event_receiver.recv().await.unwrap(), ClientEvent::NumConnectionsChanged(NumConnectionsChangedData {
            topic: "/scan".to_string(),
            direction: Direction::Inbound,
            count: 2,
        }));

        let receivers = manager.receivers().await;
        let u1 = receivers.iter().find(|r| r.remote_uri() == uri(1)).unwrap().clone();
        let u2 = receivers.iter().find(|r| r.remote_uri() == uri(2)).unwrap().clone();

        manager.update_publishers(&[uri(2), uri(3)]).await;
        assert_eq!(manager.publisher_uris().await, vec![uri(2), uri(3)]);

        assert_eq!(u1.state(), ReceiverState::Dead);
        let u2_after = manager.receivers().await.into_iter().find(|r| r.remote_uri() == uri(2)).unwrap();
        assert!(Arc::ptr_eq(&u2, &u2_after));
        assert!(u2_after.is_alive());

        manager.stop().await;
        assert!(manager.publisher_uris().await.is_empty());
        assert_eq!(manager.num_connections().await, 0);
    }

    #[tokio::test]
    async fn test_repeated_update_does_not_duplicate_connections() {
        let mut node_api = MockNodeApi::new();
        node_api.expect_request_topic()
            .times(1)
            .returning(|_, _| Ok(Some(unreachable_endpoint())));
        let (manager, _) = manager(node_api);

        manager.update_publishers(&[uri(1), uri(1)]).await;
        manager.update_publishers(&[uri(1)]).await;
        assert_eq!(manager.num_connections().await, 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_failed_resolution_creates_no_connection() {
        let mut node_api = MockNodeApi::new();
        node_api.expect_request_topic()
            .with(eq(uri(1)), always())
            .returning(|_, _| Ok(None));
        node_api.expect_request_topic()
            .with(eq(uri(2)), always())
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));
        let (manager, _) = manager(node_api);

        manager.update_publishers(&[uri(1), uri(2)]).await;
        assert!(manager.publisher_uris().await.is_empty());
    }

    #[tokio::test]
    async fn test_dead_connections_are_purged_and_recreated() {
        let mut node_api = MockNodeApi::new();
        node_api.expect_request_topic()
            .times(2)
            .returning(|_, _| Ok(Some(unreachable_endpoint())));
        let (manager, _) = manager(node_api);

        manager.update_publishers(&[uri(1)]).await;
        let first = manager.receivers().await.pop().unwrap();
        first.dispose().await;

        manager.cleanup().await;
        assert!(manager.publisher_uris().await.is_empty());

        manager.update_publishers(&[uri(1)]).await;
        let second = manager.receivers().await.pop().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_count_reports_last_known_value_while_busy() {
        let mut node_api = MockNodeApi::new();
        node_api.expect_request_topic()
            .returning(|_, _| Ok(Some(unreachable_endpoint())));
        let (manager, _) = manager(node_api);
        manager.update_publishers(&[uri(1), uri(2)]).await;

        let guard = manager.connections.lock().await;
        assert_eq!(manager.num_connections().await, 2);
        drop(guard);

        manager.stop().await;
    }
}
