use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::client::client_config::ClientConfig;
use crate::client::client_events::{ClientEvent, ClientEventNotifier, Direction, NumConnectionsChangedData};
use crate::topic::endpoint::Endpoint;
use crate::topic::message::WireMessage;
use crate::topic::topic_info::TopicInfo;
use crate::transport::tcp_sender::TcpSender;

/// Keeps one sender per remote subscriber (by caller id) of an advertised topic.
///
/// The state is never locked across an `.await`, so publishing is synchronous.
pub struct SenderManager {
    config: Arc<ClientConfig>,
    topic_info: Arc<TopicInfo>,
    latching: bool,
    events: Arc<ClientEventNotifier>,
    state: Mutex<SenderTable>,
    last_known_count: AtomicUsize,
}

/// The latched message lives under the same lock as the senders: a new sender is either
///  registered before a publish (and gets it through fan-out), or after it (and gets it as the
///  latched message).
#[derive(Default)]
struct SenderTable {
    /// remote caller id -> sender
    senders: FxHashMap<String, Arc<TcpSender>>,
    latched: Option<Arc<dyn WireMessage>>,
}

impl SenderManager {
    pub fn new(config: Arc<ClientConfig>, topic_info: Arc<TopicInfo>, latching: bool, events: Arc<ClientEventNotifier>) -> SenderManager {
        SenderManager {
            config,
            topic_info,
            latching,
            events,
            state: Default::default(),
            last_known_count: AtomicUsize::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic_info.topic
    }

    /// Creates a sender for a subscriber that requested the topic, returning the endpoint it
    ///  should connect to. An existing sender for the same subscriber is replaced. On a latching
    ///  topic, the latest message is queued into the new sender before anything else.
    pub async fn request_topic(&self, remote_caller_id: &str) -> anyhow::Result<Endpoint> {
        let previous = self.lock().senders.remove(remote_caller_id);
        if let Some(previous) = previous {
            debug!("replacing the sender for {} on {}", remote_caller_id, self.topic_info.topic);
            previous.dispose().await;
        }

        let sender = Arc::new(TcpSender::start(self.config.clone(), self.topic_info.clone(), remote_caller_id, self.latching).await?);
        let endpoint = sender.endpoint().clone();
        info!("subscriber {} requested {}, waiting on {:?}", remote_caller_id, self.topic_info.topic, endpoint);

        // a concurrent request by the same subscriber may have won - the displaced sender is
        //  cancelled when it is dropped
        let mut state = self.lock();
        if let Some(latched) = &state.latched {
            sender.publish(latched.clone());
        }
        state.senders.insert(remote_caller_id.to_string(), sender);
        self.purge_dead(&mut state.senders);
        Ok(endpoint)
    }

    /// Queues the message for every sender. On a latching topic, the message is also retained
    ///  for subscribers that connect later.
    pub fn publish(&self, message: Arc<dyn WireMessage>) {
        let mut state = self.lock();
        if self.latching {
            state.latched = Some(message.clone());
        }
        for sender in state.senders.values() {
            sender.publish(message.clone());
        }
    }

    pub fn cleanup(&self) {
        let mut state = self.lock();
        self.purge_dead(&mut state.senders);
    }

    fn purge_dead(&self, senders: &mut FxHashMap<String, Arc<TcpSender>>) {
        senders.retain(|caller_id, sender| {
            let alive = sender.is_alive();
            if !alive {
                debug!("removing dead connection to {}", caller_id);
            }
            alive
        });
        self.update_count(senders.len());
    }

    fn update_count(&self, count: usize) {
        let previous = self.last_known_count.swap(count, Ordering::Relaxed);
        if previous != count {
            self.events.send_event(ClientEvent::NumConnectionsChanged(NumConnectionsChangedData {
                topic: self.topic_info.topic.clone(),
                direction: Direction::Outbound,
                count,
            }));
        }
    }

    pub fn num_connections(&self) -> usize {
        self.lock()
            .senders
            .values()
            .filter(|s| s.is_alive())
            .count()
    }

    pub fn senders(&self) -> Vec<Arc<TcpSender>> {
        self.lock()
            .senders
            .values()
            .cloned()
            .collect()
    }

    pub async fn stop(&self) {
        let senders: Vec<Arc<TcpSender>> = self.lock()
            .senders
            .drain()
            .map(|(_, s)| s)
            .collect();
        for sender in senders {
            sender.dispose().await;
        }
        self.update_count(0);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SenderTable> {
        self.state.lock()
            .expect("lock poisoned")
    }
}
