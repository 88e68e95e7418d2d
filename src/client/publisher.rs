use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::client::client_config::ClientConfig;
use crate::client::client_events::ClientEventNotifier;
use crate::manager::sender_manager::SenderManager;
use crate::topic::endpoint::Endpoint;
use crate::topic::message::Message;
use crate::topic::topic_info::TopicInfo;
use crate::util::cancellation::{await_termination, CancellationSource, CancellationToken};

/// All advertisements of a client for one topic. This is the handle that messages are
///  published through; it can be used from any thread.
pub struct Publisher<T: Message> {
    topic_info: Arc<TopicInfo>,
    latching: bool,
    manager: Arc<SenderManager>,
    advert_ids: Mutex<FxHashSet<String>>,
    cleanup_cancel: CancellationSource,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    dispose_timeout: std::time::Duration,
    _message_type: PhantomData<fn(T)>,
}

impl<T: Message> Publisher<T> {
    pub(crate) fn new(config: Arc<ClientConfig>, topic_info: Arc<TopicInfo>, latching: bool, events: Arc<ClientEventNotifier>) -> Publisher<T> {
        let manager = Arc::new(SenderManager::new(config.clone(), topic_info.clone(), latching, events));

        let cleanup_cancel = CancellationSource::new();
        let cleanup_task = tokio::spawn(
            periodic_cleanup(manager.clone(), config.cleanup_interval, cleanup_cancel.token())
                .instrument(tracing::debug_span!("publisher_cleanup", topic = %topic_info.topic))
        );

        Publisher {
            topic_info,
            latching,
            manager,
            advert_ids: Default::default(),
            cleanup_cancel,
            cleanup_task: Mutex::new(Some(cleanup_task)),
            dispose_timeout: config.dispose_timeout,
            _message_type: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic_info.topic
    }

    /// Queues the message for every connected subscriber. On a latching topic, the message is
    ///  also retained for subscribers that connect later.
    pub fn publish(&self, message: T) {
        self.manager.publish(Arc::new(message));
    }

    pub fn num_subscribers(&self) -> usize {
        self.manager.num_connections()
    }
}

/// The type independent view on a [Publisher] that the client's topic table works with
#[async_trait]
pub trait AnyPublisher: Send + Sync + 'static {
    fn topic_info(&self) -> &TopicInfo;
    fn latching(&self) -> bool;
    fn manager(&self) -> &Arc<SenderManager>;

    /// Creates a sender for a subscriber, returning the endpoint it should connect to
    async fn request_topic(&self, remote_caller_id: &str) -> anyhow::Result<Endpoint>;

    fn add_advert_id(&self) -> String;
    fn remove_advert_id(&self, id: &str) -> bool;
    fn num_advert_ids(&self) -> usize;

    async fn dispose(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<T: Message> AnyPublisher for Publisher<T> {
    fn topic_info(&self) -> &TopicInfo {
        &self.topic_info
    }

    fn latching(&self) -> bool {
        self.latching
    }

    fn manager(&self) -> &Arc<SenderManager> {
        &self.manager
    }

    async fn request_topic(&self, remote_caller_id: &str) -> anyhow::Result<Endpoint> {
        self.manager.request_topic(remote_caller_id).await
    }

    fn add_advert_id(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.advert_ids.lock()
            .expect("lock poisoned")
            .insert(id.clone());
        id
    }

    fn remove_advert_id(&self, id: &str) -> bool {
        self.advert_ids.lock()
            .expect("lock poisoned")
            .remove(id)
    }

    fn num_advert_ids(&self) -> usize {
        self.advert_ids.lock()
            .expect("lock poisoned")
            .len()
    }

    async fn dispose(&self) {
        self.cleanup_cancel.cancel();
        let task = self.cleanup_task.lock()
            .expect("lock poisoned")
            .take();
        if let Some(task) = task {
            await_termination(task, self.dispose_timeout, "publisher cleanup").await;
        }
        self.manager.stop().await;
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: Message> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.cleanup_cancel.cancel();
    }
}

impl<T: Message> Debug for Publisher<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Publisher{{topic:{}, latching:{}}}", self.topic_info.topic, self.latching)
    }
}

async fn periodic_cleanup(manager: Arc<SenderManager>, interval: std::time::Duration, token: CancellationToken) {
    let mut ticks = tokio::time::interval(interval);
    ticks.tick().await;
    while token.guard(ticks.tick()).await.is_ok() {
        manager.cleanup();
    }
    debug!("periodic cleanup stopped");
}
