use std::any::Any;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::client::client_config::ClientConfig;
use crate::client::client_events::ClientEventNotifier;
use crate::manager::receiver_manager::ReceiverManager;
use crate::node::node_api::NodeApi;
use crate::topic::message::Message;
use crate::topic::topic_info::TopicInfo;
use crate::transport::tcp_receiver::MessageSink;
use crate::util::cancellation::{await_termination, CancellationSource, CancellationToken};

/// A message delivery callback. It is called on a connection's worker task, i.e. on an
///  arbitrary thread; consumers that need a specific thread have to hand the message over
///  themselves.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Subscription id -> callback. Delivering a message works on a snapshot of the callbacks, so
///  callbacks may (un)subscribe without deadlocking.
struct CallbackRegistry<T: Message> {
    callbacks: RwLock<FxHashMap<String, Callback<T>>>,
}

impl<T: Message> MessageSink for CallbackRegistry<T> {
    fn on_message(&self, payload: &[u8]) -> anyhow::Result<()> {
        let message = T::deser(payload)?;
        let callbacks: Vec<Callback<T>> = self.callbacks.read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(&message);
        }
        Ok(())
    }
}

/// All subscriptions of a client to one topic, sharing the connections to the topic's
///  publishers.
pub struct Subscriber<T: Message> {
    topic_info: Arc<TopicInfo>,
    tcp_nodelay: bool,
    registry: Arc<CallbackRegistry<T>>,
    manager: Arc<ReceiverManager>,
    cleanup_cancel: CancellationSource,
    cleanup_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    dispose_timeout: std::time::Duration,
}

impl<T: Message> Subscriber<T> {
    pub(crate) fn new(config: Arc<ClientConfig>, topic_info: Arc<TopicInfo>, tcp_nodelay: bool, node_api: Arc<dyn NodeApi>, events: Arc<ClientEventNotifier>) -> Subscriber<T> {
        let registry = Arc::new(CallbackRegistry {
            callbacks: Default::default(),
        });
        let manager = Arc::new(ReceiverManager::new(config.clone(), topic_info.clone(), tcp_nodelay, node_api, registry.clone(), events));

        let cleanup_cancel = CancellationSource::new();
        let cleanup_task = tokio::spawn(
            periodic_cleanup(manager.clone(), config.cleanup_interval, cleanup_cancel.token())
                .instrument(tracing::debug_span!("subscriber_cleanup", topic = %topic_info.topic))
        );

        Subscriber {
            topic_info,
            tcp_nodelay,
            registry,
            manager,
            cleanup_cancel,
            cleanup_task: std::sync::Mutex::new(Some(cleanup_task)),
            dispose_timeout: config.dispose_timeout,
        }
    }

    /// Registers a callback, returning its new subscription id
    pub fn add_callback(&self, callback: Callback<T>) -> String {
        let id = Uuid::new_v4().to_string();
        self.registry.callbacks.write()
            .expect("lock poisoned")
            .insert(id.clone(), callback);
        id
    }
}

/// The type independent view on a [Subscriber] that the client's topic table works with
#[async_trait]
pub trait AnySubscriber: Send + Sync + 'static {
    fn topic_info(&self) -> &TopicInfo;
    fn tcp_nodelay(&self) -> bool;
    fn manager(&self) -> &Arc<ReceiverManager>;

    /// returns `true` if the id was registered here
    fn remove_callback(&self, id: &str) -> bool;
    fn num_callbacks(&self) -> usize;

    /// Stops all connections. The subscriber is unusable afterwards.
    async fn dispose(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<T: Message> AnySubscriber for Subscriber<T> {
    fn topic_info(&self) -> &TopicInfo {
        &self.topic_info
    }

    fn tcp_nodelay(&self) -> bool {
        self.tcp_nodelay
    }

    fn manager(&self) -> &Arc<ReceiverManager> {
        &self.manager
    }

    fn remove_callback(&self, id: &str) -> bool {
        self.registry.callbacks.write()
            .expect("lock poisoned")
            .remove(id)
            .is_some()
    }

    fn num_callbacks(&self) -> usize {
        self.registry.callbacks.read()
            .expect("lock poisoned")
            .len()
    }

    async fn dispose(&self) {
        self.cleanup_cancel.cancel();
        let task = self.cleanup_task.lock()
            .expect("lock poisoned")
            .take();
        if let Some(task) = task {
            await_termination(task, self.dispose_timeout, "subscriber cleanup").await;
        }
        self.manager.stop().await;
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: Message> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.cleanup_cancel.cancel();
    }
}

async fn periodic_cleanup(manager: Arc<ReceiverManager>, interval: std::time::Duration, token: CancellationToken) {
    let mut ticks = tokio::time::interval(interval);
    ticks.tick().await;
    while token.guard(ticks.tick()).await.is_ok() {
        manager.cleanup().await;
    }
    debug!("periodic cleanup stopped");
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::BytesMut;

    use super::*;
    use crate::node::node_api::MockNodeApi;
    use crate::test_util::message::StringMessage;
    use crate::topic::endpoint::Endpoint;

    fn subscriber() -> Subscriber<StringMessage> {
        let config = Arc::new(ClientConfig::new("/viz", Endpoint::new("127.0.0.1", 11311)));
        Subscriber::new(
            config,
            Arc::new(TopicInfo::for_message::<StringMessage>("/viz", "/chatter")),
            false,
            Arc::new(MockNodeApi::new()),
            Arc::new(ClientEventNotifier::new()),
        )
    }

    fn payload(s: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        Message::ser(&StringMessage::new(s), &mut buf);
        buf
    }

    #[tokio::test]
    async fn test_delivers_to_all_callbacks_until_removed() {
        let subscriber = subscriber();
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));

        let id_a = {
            let count_a = count_a.clone();
            subscriber.add_callback(Arc::new(move |msg: &StringMessage| {
                assert_eq!(msg.data, "hi");
                count_a.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let id_b = {
            let count_b = count_b.clone();
            subscriber.add_callback(Arc::new(move |_: &StringMessage| {
                count_b.fetch_add(1, Ordering::SeqCst);
            }))
        };
        assert_ne!(id_a, id_b);
        assert_eq!(subscriber.num_callbacks(), 2);

        subscriber.registry.on_message(&payload("hi")).unwrap();
        assert!(subscriber.remove_callback(&id_a));
        assert!(!subscriber.remove_callback(&id_a));
        assert_eq!(subscriber.num_callbacks(), 1);
        subscriber.registry.on_message(&payload("hi")).unwrap();

        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 2);

        subscriber.dispose().await;
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_an_error() {
        let subscriber = subscriber();
        subscriber.add_callback(Arc::new(|_: &StringMessage| panic!("must not be called")));
        assert!(subscriber.registry.on_message(b"\x01").is_err());
        subscriber.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_stops_cleanup_task() {
        let subscriber = subscriber();
        tokio::time::sleep(Duration::from_secs(12)).await;
        subscriber.dispose().await;
        assert!(subscriber.cleanup_task.lock().unwrap().is_none());
    }
}
