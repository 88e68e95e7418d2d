use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::client::client_config::ClientConfig;
use crate::client::client_events::{ClientEvent, ClientEventNotifier};
use crate::client::publisher::{AnyPublisher, Publisher};
use crate::client::ros_error::RosError;
use crate::client::subscriber::{AnySubscriber, Subscriber};
use crate::master::master_api::{MasterApi, MasterClient, SystemState, TopicType};
use crate::node::node_api::{NodeApi, NodeClient};
use crate::node::node_rpc_handler::NodeRpcHandler;
use crate::rpc::rpc_server::RpcServer;
use crate::rpc::rpc_value::RpcValue;
use crate::topic::endpoint::Endpoint;
use crate::topic::message::Message;
use crate::topic::names::resolve_name;
use crate::topic::topic_info::TopicInfo;

/// The state shared between the client facade and its local RPC server
pub(crate) struct ClientCore {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) caller_uri: String,
    pub(crate) master: Arc<dyn MasterApi>,
    pub(crate) node_api: Arc<dyn NodeApi>,
    pub(crate) events: Arc<ClientEventNotifier>,
    pub(crate) subscribers: RwLock<FxHashMap<String, Arc<dyn AnySubscriber>>>,
    pub(crate) publishers: RwLock<FxHashMap<String, Arc<dyn AnyPublisher>>>,
    /// subscription id -> topic, changed only while holding the write lock on `subscribers`
    subscription_topics: std::sync::Mutex<FxHashMap<String, String>>,
    /// advertisement id -> topic, changed only while holding the write lock on `publishers`
    advert_topics: std::sync::Mutex<FxHashMap<String, String>>,
    pub(crate) params: std::sync::Mutex<FxHashMap<String, RpcValue>>,
}

impl ClientCore {
    pub(crate) async fn subscriber(&self, topic: &str) -> Option<Arc<dyn AnySubscriber>> {
        self.subscribers.read().await
            .get(topic)
            .cloned()
    }

    pub(crate) async fn publisher(&self, topic: &str) -> Option<Arc<dyn AnyPublisher>> {
        self.publishers.read().await
            .get(topic)
            .cloned()
    }
}

/// The entry point to publish / subscribe: it registers with the registry ("master"), answers
///  peer requests on its own RPC server and owns all of this node's subscriptions and
///  advertisements.
///
/// Message callbacks are invoked on connection worker tasks, never on the caller's thread.
pub struct RosClient {
    core: Arc<ClientCore>,
    rpc_server: RpcServer,
    closed: AtomicBool,
}

impl RosClient {
    pub async fn new(config: ClientConfig) -> anyhow::Result<RosClient> {
        let config = Self::prepare_config(config)?;
        let (listener, caller_uri) = Self::bind(&config).await?;

        let master = Arc::new(MasterClient::new(&config.caller_id, &caller_uri, config.master_addr.clone(), config.rpc_timeout, config.max_frame_len));
        let node_api = Arc::new(NodeClient::new(&config.caller_id, config.rpc_timeout, config.max_frame_len));
        Self::start(config, listener, caller_uri, master, node_api)
    }

    /// Uses the given registry and peer clients instead of the RPC based ones
    pub async fn with_apis(config: ClientConfig, master: Arc<dyn MasterApi>, node_api: Arc<dyn NodeApi>) -> anyhow::Result<RosClient> {
        let config = Self::prepare_config(config)?;
        let (listener, caller_uri) = Self::bind(&config).await?;
        Self::start(config, listener, caller_uri, master, node_api)
    }

    fn prepare_config(mut config: ClientConfig) -> anyhow::Result<Arc<ClientConfig>> {
        config.validate()?;
        config.caller_id = resolve_name(&config.caller_id)?;
        Ok(Arc::new(config))
    }

    async fn bind(config: &ClientConfig) -> anyhow::Result<(TcpListener, String)> {
        let listener = TcpListener::bind((config.bind_host.as_str(), config.rpc_port)).await?;
        let caller_uri = Endpoint::new(config.advertised_host.clone(), listener.local_addr()?.port()).to_uri();
        Ok((listener, caller_uri))
    }

    fn start(config: Arc<ClientConfig>, listener: TcpListener, caller_uri: String, master: Arc<dyn MasterApi>, node_api: Arc<dyn NodeApi>) -> anyhow::Result<RosClient> {
        info!("starting client {} at {}, registry at {}", config.caller_id, caller_uri, master.master_uri());

        let core = Arc::new(ClientCore {
            config: config.clone(),
            caller_uri,
            master,
            node_api,
            events: Arc::new(ClientEventNotifier::new()),
            subscribers: Default::default(),
            publishers: Default::default(),
            subscription_topics: Default::default(),
            advert_topics: Default::default(),
            params: Default::default(),
        });

        let handler = Arc::new(NodeRpcHandler::new(core.clone()));
        let rpc_server = RpcServer::start_with_listener(listener, handler, config.max_frame_len, config.dispose_timeout)?;

        Ok(RosClient {
            core,
            rpc_server,
            closed: AtomicBool::new(false),
        })
    }

    pub fn caller_id(&self) -> &str {
        &self.core.config.caller_id
    }

    /// the URI of this node's RPC server, as registered with the registry
    pub fn uri(&self) -> &str {
        &self.core.caller_uri
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.core.events.subscribe()
    }

    fn check_open(&self) -> Result<(), RosError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RosError::Closed);
        }
        Ok(())
    }

    pub async fn subscribe<T: Message>(&self, topic: &str, callback: impl Fn(&T) + Send + Sync + 'static) -> anyhow::Result<String> {
        self.subscribe_with_options(topic, false, callback).await
    }

    /// Adds a callback for a topic, returning its subscription id. The first subscription to a
    ///  topic registers with the registry and connects to the topic's publishers, later ones
    ///  share those connections and must use the same message type.
    ///
    /// `tcp_nodelay` only takes effect for the first subscription to a topic.
    pub async fn subscribe_with_options<T: Message>(&self, topic: &str, tcp_nodelay: bool, callback: impl Fn(&T) + Send + Sync + 'static) -> anyhow::Result<String> {
        self.check_open()?;
        let topic = resolve_name(topic)?;

        let (subscriber, id, is_new) = {
            let mut subscribers = self.core.subscribers.write().await;
            let (subscriber, is_new) = match subscribers.get(&topic) {
                Some(existing) => (downcast_subscriber::<T>(&topic, existing.clone())?, false),
                None => {
                    let topic_info = Arc::new(TopicInfo::for_message::<T>(&self.core.config.caller_id, &topic));
                    let subscriber = Arc::new(Subscriber::<T>::new(
                        self.core.config.clone(),
                        topic_info,
                        tcp_nodelay,
                        self.core.node_api.clone(),
                        self.core.events.clone(),
                    ));
                    subscribers.insert(topic.clone(), subscriber.clone());
                    (subscriber, true)
                }
            };

            let id = subscriber.add_callback(Arc::new(callback));
            self.core.subscription_topics.lock()
                .expect("lock poisoned")
                .insert(id.clone(), topic.clone());
            (subscriber, id, is_new)
        };

        if is_new {
            let publisher_uris = self.core.master.register_subscriber(&topic, T::TYPE_NAME).await;
            debug!("subscribed to {}, publishers: {:?}", topic, publisher_uris);
            subscriber.manager().update_publishers(&publisher_uris).await;
        }
        Ok(id)
    }

    /// Removes a subscription. The last subscription to a topic unregisters from the registry
    ///  and closes the topic's connections. Returns `false` for an unknown id.
    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = {
            let mut subscribers = self.core.subscribers.write().await;
            let topic = self.core.subscription_topics.lock()
                .expect("lock poisoned")
                .remove(subscription_id);
            let Some(topic) = topic else {
                return false;
            };
            let Some(subscriber) = subscribers.get(&topic).cloned() else {
                return false;
            };

            subscriber.remove_callback(subscription_id);
            if subscriber.num_callbacks() > 0 {
                return true;
            }
            subscribers.remove(&topic);
            (topic, subscriber)
        };

        let (topic, subscriber) = removed;
        debug!("last subscription to {} removed", topic);
        self.core.master.unregister_subscriber(&topic).await;
        subscriber.dispose().await;
        true
    }

    pub async fn advertise<T: Message>(&self, topic: &str) -> anyhow::Result<(Arc<Publisher<T>>, String)> {
        self.advertise_with_options(topic, false).await
    }

    /// Advertises a topic, returning the publisher handle and an advertisement id. Advertising
    ///  a topic again returns the existing publisher with a new id; `latching` only takes
    ///  effect for the first advertisement.
    pub async fn advertise_with_options<T: Message>(&self, topic: &str, latching: bool) -> anyhow::Result<(Arc<Publisher<T>>, String)> {
        self.check_open()?;
        let topic = resolve_name(topic)?;

        let (publisher, id, is_new) = {
            let mut publishers = self.core.publishers.write().await;
            let (publisher, is_new) = match publishers.get(&topic) {
                Some(existing) => (downcast_publisher::<T>(&topic, existing.clone())?, false),
                None => {
                    let topic_info = Arc::new(TopicInfo::for_message::<T>(&self.core.config.caller_id, &topic));
                    let publisher = Arc::new(Publisher::<T>::new(
                        self.core.config.clone(),
                        topic_info,
                        latching,
                        self.core.events.clone(),
                    ));
                    publishers.insert(topic.clone(), publisher.clone());
                    (publisher, true)
                }
            };

            let id = publisher.add_advert_id();
            self.core.advert_topics.lock()
                .expect("lock poisoned")
                .insert(id.clone(), topic.clone());
            (publisher, id, is_new)
        };

        if is_new {
            let subscriber_uris = self.core.master.register_publisher(&topic, T::TYPE_NAME).await;
            debug!("advertised {}, subscribers: {:?}", topic, subscriber_uris);
        }
        Ok((publisher, id))
    }

    pub fn publish<T: Message>(&self, publisher: &Publisher<T>, message: T) -> Result<(), RosError> {
        self.check_open()?;
        publisher.publish(message);
        Ok(())
    }

    /// Removes an advertisement. The last advertisement of a topic unregisters from the
    ///  registry and closes the topic's connections. Returns `false` for an unknown id.
    pub async fn unadvertise(&self, advert_id: &str) -> bool {
        let removed = {
            let mut publishers = self.core.publishers.write().await;
            let topic = self.core.advert_topics.lock()
                .expect("lock poisoned")
                .remove(advert_id);
            let Some(topic) = topic else {
                return false;
            };
            let Some(publisher) = publishers.get(&topic).cloned() else {
                return false;
            };

            publisher.remove_advert_id(advert_id);
            if publisher.num_advert_ids() > 0 {
                return true;
            }
            publishers.remove(&topic);
            (topic, publisher)
        };

        let (topic, publisher) = removed;
        debug!("last advertisement of {} removed", topic);
        self.core.master.unregister_publisher(&topic).await;
        publisher.dispose().await;
        true
    }

    pub async fn get_system_state(&self) -> SystemState {
        self.core.master.get_system_state().await
    }

    pub async fn get_published_topics(&self, subgraph: &str) -> Vec<TopicType> {
        self.core.master.get_published_topics(subgraph).await
    }

    pub async fn lookup_node(&self, node_name: &str) -> Option<String> {
        self.core.master.lookup_node(node_name).await
    }

    pub async fn lookup_service(&self, service: &str) -> Option<String> {
        self.core.master.lookup_service(service).await
    }

    pub async fn subscribed_topics(&self) -> Vec<String> {
        let mut result: Vec<String> = self.core.subscribers.read().await
            .keys()
            .cloned()
            .collect();
        result.sort();
        result
    }

    pub async fn advertised_topics(&self) -> Vec<String> {
        let mut result: Vec<String> = self.core.publishers.read().await
            .keys()
            .cloned()
            .collect();
        result.sort();
        result
    }

    /// number of publishers this client is connected to for a subscribed topic
    pub async fn num_publishers(&self, topic: &str) -> usize {
        let Ok(topic) = resolve_name(topic) else {
            return 0;
        };
        match self.core.subscriber(&topic).await {
            Some(subscriber) => subscriber.manager().num_connections().await,
            None => 0,
        }
    }

    /// number of subscribers connected to an advertised topic
    pub async fn num_subscribers(&self, topic: &str) -> usize {
        let Ok(topic) = resolve_name(topic) else {
            return 0;
        };
        match self.core.publisher(&topic).await {
            Some(publisher) => publisher.manager().num_connections(),
            None => 0,
        }
    }

    /// the last value a `paramUpdate` call delivered for a key
    pub fn cached_param(&self, key: &str) -> Option<RpcValue> {
        self.core.params.lock()
            .expect("lock poisoned")
            .get(key)
            .cloned()
    }

    /// Unregisters and closes all subscriptions and advertisements, and stops the RPC server.
    ///  Closing a closed client does nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing client {}", self.core.config.caller_id);
        self.rpc_server.stop().await;

        let subscribers: Vec<(String, Arc<dyn AnySubscriber>)> = {
            let mut subscribers = self.core.subscribers.write().await;
            self.core.subscription_topics.lock()
                .expect("lock poisoned")
                .clear();
            subscribers.drain().collect()
        };
        for (topic, subscriber) in subscribers {
            self.core.master.unregister_subscriber(&topic).await;
            subscriber.dispose().await;
        }

        let publishers: Vec<(String, Arc<dyn AnyPublisher>)> = {
            let mut publishers = self.core.publishers.write().await;
            self.core.advert_topics.lock()
                .expect("lock poisoned")
                .clear();
            publishers.drain().collect()
        };
        for (topic, publisher) in publishers {
            self.core.master.unregister_publisher(&topic).await;
            publisher.dispose().await;
        }
    }
}

fn downcast_subscriber<T: Message>(topic: &str, existing: Arc<dyn AnySubscriber>) -> Result<Arc<Subscriber<T>>, RosError> {
    let existing_type = existing.topic_info().type_name.clone();
    existing.into_any()
        .downcast::<Subscriber<T>>()
        .map_err(|_| RosError::TypeMismatch {
            topic: topic.to_string(),
            existing: existing_type,
            requested: T::TYPE_NAME.to_string(),
        })
}

fn downcast_publisher<T: Message>(topic: &str, existing: Arc<dyn AnyPublisher>) -> Result<Arc<Publisher<T>>, RosError> {
    let existing_type = existing.topic_info().type_name.clone();
    existing.into_any()
        .downcast::<Publisher<T>>()
        .map_err(|_| RosError::TypeMismatch {
            topic: topic.to_string(),
            existing: existing_type,
            requested: T::TYPE_NAME.to_string(),
        })
}
