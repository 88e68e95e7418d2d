use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use crate::client::client_config::ClientConfig;
use crate::node::node_api::NodeApi;
use crate::topic::endpoint::Endpoint;
use crate::topic::topic_info::TopicInfo;
use crate::transport::next_connection_id;
use crate::util::cancellation::{await_termination, is_cancellation, CancellationSource, CancellationToken};
use crate::util::safe_converter::SafeCast;
use crate::wire::frame::FrameReader;
use crate::wire::handshake::{ConnectionHeader, LATCHING};

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ReceiverState {
    Connecting,
    Active,
    /// waiting to retry after a failed connection attempt
    Reconnecting,
    Dead,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReceiverStats {
    pub num_received: u64,
    pub bytes_received: u64,
    pub connection_attempts: u64,
}

/// Where a receiver delivers the payloads of received frames. This is called on the receiver's
///  worker task, so implementations must not block.
pub trait MessageSink: Send + Sync + 'static {
    fn on_message(&self, payload: &[u8]) -> anyhow::Result<()>;
}

#[derive(Default)]
struct SharedStats {
    num_received: AtomicU64,
    bytes_received: AtomicU64,
    connection_attempts: AtomicU64,
}

struct ReceiverShared {
    state: AtomicU8,
    stats: SharedStats,
    latching: AtomicBool,
    endpoint: Mutex<Endpoint>,
}
impl ReceiverShared {
    fn set_state(&self, state: ReceiverState) {
        self.state.store(state.into(), Ordering::Release);
    }

    fn state(&self) -> ReceiverState {
        ReceiverState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ReceiverState::Dead)
    }
}

/// The streaming connection to a single remote publisher. It connects out to the publisher's
///  streaming endpoint, retrying (and asking the publisher node for its current endpoint)
///  within a fixed budget of attempts.
///
/// Once an established session ends, the receiver is `Dead`: it takes a new publisher list
///  from the registry to create a fresh one.
pub struct TcpReceiver {
    connection_id: u32,
    topic: String,
    remote_uri: String,
    shared: Arc<ReceiverShared>,
    cancel: CancellationSource,
    task: Mutex<Option<JoinHandle<()>>>,
    dispose_timeout: Duration,
}

impl TcpReceiver {
    /// `remote_uri` is the publisher node's URI, `endpoint` the streaming endpoint it handed out
    pub fn start(
        config: Arc<ClientConfig>,
        topic_info: Arc<TopicInfo>,
        remote_uri: &str,
        endpoint: Endpoint,
        tcp_nodelay: bool,
        node_api: Arc<dyn NodeApi>,
        sink: Arc<dyn MessageSink>,
    ) -> TcpReceiver {
        let shared = Arc::new(ReceiverShared {
            state: AtomicU8::new(ReceiverState::Connecting.into()),
            stats: Default::default(),
            latching: AtomicBool::new(false),
            endpoint: Mutex::new(endpoint),
        });
        let cancel = CancellationSource::new();

        let dispose_timeout = config.dispose_timeout;
        let worker = ReceiverWorker {
            config,
            topic_info: topic_info.clone(),
            remote_uri: remote_uri.to_string(),
            tcp_nodelay,
            node_api,
            sink,
            shared: shared.clone(),
        };
        let span = tracing::info_span!("receiver", topic = %topic_info.topic, remote = %remote_uri);
        let task = tokio::spawn(worker.run(cancel.token()).instrument(span));

        TcpReceiver {
            connection_id: next_connection_id(),
            topic: topic_info.topic.clone(),
            remote_uri: remote_uri.to_string(),
            shared,
            cancel,
            task: Mutex::new(Some(task)),
            dispose_timeout,
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn remote_uri(&self) -> &str {
        &self.remote_uri
    }

    /// the streaming endpoint currently used, which can change on reconnection
    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint.lock()
            .expect("lock poisoned")
            .clone()
    }

    pub fn state(&self) -> ReceiverState {
        self.shared.state()
    }

    pub fn is_alive(&self) -> bool {
        self.state() != ReceiverState::Dead
    }

    /// whether the publisher announced a latching topic in its handshake
    pub fn latching(&self) -> bool {
        self.shared.latching.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ReceiverStats {
        let stats = &self.shared.stats;
        ReceiverStats {
            num_received: stats.num_received.load(Ordering::Relaxed),
            bytes_received: stats.bytes_received.load(Ordering::Relaxed),
            connection_attempts: stats.connection_attempts.load(Ordering::Relaxed),
        }
    }

    pub async fn dispose(&self) {
        self.cancel.cancel();
        let task = self.task.lock()
            .expect("lock poisoned")
            .take();
        if let Some(task) = task {
            let what = format!("receiver for {} from {}", self.topic, self.remote_uri);
            await_termination(task, self.dispose_timeout, &what).await;
        }
        self.shared.set_state(ReceiverState::Dead);
    }
}

impl Drop for TcpReceiver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ReceiverWorker {
    config: Arc<ClientConfig>,
    topic_info: Arc<TopicInfo>,
    remote_uri: String,
    tcp_nodelay: bool,
    node_api: Arc<dyn NodeApi>,
    sink: Arc<dyn MessageSink>,
    shared: Arc<ReceiverShared>,
}

impl ReceiverWorker {
    async fn run(self, token: CancellationToken) {
        match self.session(&token).await {
            Ok(()) => info!("publisher closed the connection"),
            Err(e) if is_cancellation(&e) => debug!("receiver was cancelled"),
            Err(e) => warn!("receiver terminated: {}", e),
        }
        self.shared.set_state(ReceiverState::Dead);
    }

    fn current_endpoint(&self) -> Endpoint {
        self.shared.endpoint.lock()
            .expect("lock poisoned")
            .clone()
    }

    async fn session(&self, token: &CancellationToken) -> anyhow::Result<()> {
        let mut attempts = 0;
        loop {
            self.shared.set_state(ReceiverState::Connecting);
            attempts += 1;
            self.shared.stats.connection_attempts.fetch_add(1, Ordering::Relaxed);

            let endpoint = self.current_endpoint();
            let e = match self.connect(&endpoint, token).await {
                Ok((stream, reader)) => {
                    debug!("connected to {:?}", endpoint);
                    self.shared.set_state(ReceiverState::Active);
                    return self.read_messages(stream, reader, token).await;
                }
                Err(e) if is_cancellation(&e) => return Err(e),
                Err(e) => e,
            };

            if attempts >= self.config.receiver_max_connect_attempts {
                bail!("giving up after {} connection attempts, last error: {}", attempts, e);
            }
            debug!("connection attempt {} to {:?} failed: {} - retrying in {:?}", attempts, endpoint, e, self.config.receiver_reconnect_backoff);

            self.shared.set_state(ReceiverState::Reconnecting);
            token.guard(tokio::time::sleep(self.config.receiver_reconnect_backoff)).await?;
            self.resolve_endpoint(token).await?;
        }
    }

    /// Asks the publisher node for its current streaming endpoint, keeping the previous one if
    ///  that does not produce a new one
    async fn resolve_endpoint(&self, token: &CancellationToken) -> anyhow::Result<()> {
        match token.guard(self.node_api.request_topic(&self.remote_uri, &self.topic_info.topic)).await? {
            Ok(Some(endpoint)) => {
                let mut current = self.shared.endpoint.lock()
                    .expect("lock poisoned");
                if *current != endpoint {
                    info!("publisher moved from {:?} to {:?}", *current, endpoint);
                    *current = endpoint;
                }
            }
            Ok(None) => debug!("publisher declined to resolve the topic, keeping the previous endpoint"),
            Err(e) => debug!("could not resolve the publisher's endpoint: {}", e),
        }
        Ok(())
    }

    async fn connect(&self, endpoint: &Endpoint, token: &CancellationToken) -> anyhow::Result<(TcpStream, FrameReader)> {
        let timeout = self.config.receiver_connect_timeout;

        let mut stream = guarded_with_timeout(token, timeout, async {
            Ok::<_, anyhow::Error>(TcpStream::connect(endpoint.socket_addr_string()).await?)
        }).await?;
        if self.tcp_nodelay {
            stream.set_nodelay(true)?;
        }

        let mut reader = FrameReader::new(self.config.max_frame_len);
        let reply = guarded_with_timeout(token, timeout, async {
            ConnectionHeader::for_subscriber(&self.topic_info, self.tcp_nodelay)
                .write_to(&mut stream)
                .await?;
            ConnectionHeader::read_from(&mut reader, &mut stream).await
        }).await?;
        trace!("publisher header: {:?}", reply);

        reply.validate_publisher(&self.topic_info)?;
        self.shared.latching.store(reply.flag(LATCHING), Ordering::Relaxed);

        Ok((stream, reader))
    }

    /// Returns `Ok(())` when the publisher closes the connection
    async fn read_messages(&self, mut stream: TcpStream, mut reader: FrameReader, token: &CancellationToken) -> anyhow::Result<()> {
        loop {
            match token.guard(reader.read_frame(&mut stream)).await?? {
                None => return Ok(()),
                Some(payload) if payload.is_empty() => trace!("keep-alive"),
                Some(payload) => {
                    self.shared.stats.num_received.fetch_add(1, Ordering::Relaxed);
                    self.shared.stats.bytes_received.fetch_add(payload.len().safe_cast(), Ordering::Relaxed);

                    if let Err(e) = self.sink.on_message(payload) {
                        warn!("skipping a message that could not be processed: {}", e);
                    }
                }
            }
        }
    }
}

async fn guarded_with_timeout<T>(token: &CancellationToken, timeout: Duration, f: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    match token.guard(tokio::time::timeout(timeout, f)).await? {
        Ok(result) => result,
        Err(_) => bail!("timed out after {:?}", timeout),
    }
}
