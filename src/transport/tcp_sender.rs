use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use crate::client::client_config::ClientConfig;
use crate::topic::endpoint::Endpoint;
use crate::topic::message::WireMessage;
use crate::topic::topic_info::TopicInfo;
use crate::transport::next_connection_id;
use crate::transport::send_queue::{select_for_sending, QueuedMessage, SendQueue};
use crate::util::cancellation::{await_termination, is_cancellation, CancellationSource, CancellationToken, Cancelled};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::frame::{FrameReader, FRAME_LEN_PREFIX};
use crate::wire::handshake::{ConnectionHeader, TCP_NODELAY};

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SenderState {
    Inactive,
    /// listening for the subscriber to connect
    Waiting,
    Active,
    Dead,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SenderStats {
    pub num_sent: u64,
    pub bytes_sent: u64,
    pub num_dropped: u64,
    pub bytes_dropped: u64,
}

/// Updated only by the sender's worker, read (approximately) by anyone
#[derive(Default)]
struct SharedStats {
    num_sent: AtomicU64,
    bytes_sent: AtomicU64,
    num_dropped: AtomicU64,
    bytes_dropped: AtomicU64,
}

struct SenderShared {
    state: AtomicU8,
    stats: SharedStats,
}
impl SenderShared {
    fn set_state(&self, state: SenderState) {
        self.state.store(state.into(), Ordering::Release);
    }

    fn state(&self) -> SenderState {
        SenderState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(SenderState::Dead)
    }
}

/// The streaming connection to a single remote subscriber. It listens on an ephemeral port
///  of its own, accepts the subscriber's connection, and then streams queued messages to it.
///
/// A sender does not recover from a lost connection: once its session ends it is `Dead`, and
///  the subscriber has to request a new one.
pub struct TcpSender {
    connection_id: u32,
    topic: String,
    remote_caller_id: String,
    endpoint: Endpoint,
    queue: Arc<SendQueue>,
    shared: Arc<SenderShared>,
    cancel: CancellationSource,
    task: Mutex<Option<JoinHandle<()>>>,
    config: Arc<ClientConfig>,
}

impl TcpSender {
    /// Binds the listening socket and starts waiting for the subscriber. The returned sender's
    ///  [TcpSender::endpoint] is what the subscriber has to connect to.
    pub async fn start(config: Arc<ClientConfig>, topic_info: Arc<TopicInfo>, remote_caller_id: &str, latching: bool) -> anyhow::Result<TcpSender> {
        let listener = TcpListener::bind((config.bind_host.as_str(), 0)).await?;
        let endpoint = Endpoint::new(config.advertised_host.clone(), listener.local_addr()?.port());
        debug!("sender for {} to {} listening on {:?}", topic_info.topic, remote_caller_id, listener.local_addr()?);

        let queue = Arc::new(SendQueue::new());
        let shared = Arc::new(SenderShared {
            state: AtomicU8::new(SenderState::Inactive.into()),
            stats: Default::default(),
        });
        let cancel = CancellationSource::new();

        let worker = SenderWorker {
            config: config.clone(),
            topic_info: topic_info.clone(),
            remote_caller_id: remote_caller_id.to_string(),
            latching,
            queue: queue.clone(),
            shared: shared.clone(),
        };
        let span = tracing::info_span!("sender", topic = %topic_info.topic, remote = %remote_caller_id);
        let task = tokio::spawn(worker.run(listener, cancel.token()).instrument(span));

        Ok(TcpSender {
            connection_id: next_connection_id(),
            topic: topic_info.topic.clone(),
            remote_caller_id: remote_caller_id.to_string(),
            endpoint,
            queue,
            shared,
            cancel,
            task: Mutex::new(Some(task)),
            config,
        })
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn remote_caller_id(&self) -> &str {
        &self.remote_caller_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SenderState {
        self.shared.state()
    }

    pub fn is_alive(&self) -> bool {
        self.state() != SenderState::Dead
    }

    pub fn stats(&self) -> SenderStats {
        let stats = &self.shared.stats;
        SenderStats {
            num_sent: stats.num_sent.load(Ordering::Relaxed),
            bytes_sent: stats.bytes_sent.load(Ordering::Relaxed),
            num_dropped: stats.num_dropped.load(Ordering::Relaxed),
            bytes_dropped: stats.bytes_dropped.load(Ordering::Relaxed),
        }
    }

    /// Enqueues a message; it is sent as soon as the subscriber is connected. Publishing to a
    ///  dead sender is a no-op.
    pub fn publish(&self, message: Arc<dyn WireMessage>) {
        if !self.is_alive() {
            trace!("not queueing message on dead sender for {} to {}", self.topic, self.remote_caller_id);
            return;
        }
        self.queue.push(QueuedMessage::new(message));
    }

    pub async fn dispose(&self) {
        self.cancel.cancel();
        let task = self.task.lock()
            .expect("lock poisoned")
            .take();
        if let Some(task) = task {
            let what = format!("sender for {} to {}", self.topic, self.remote_caller_id);
            await_termination(task, self.config.dispose_timeout, &what).await;
        }
        self.shared.set_state(SenderState::Dead);
    }
}

impl Drop for TcpSender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SenderWorker {
    config: Arc<ClientConfig>,
    topic_info: Arc<TopicInfo>,
    remote_caller_id: String,
    latching: bool,
    queue: Arc<SendQueue>,
    shared: Arc<SenderShared>,
}

impl SenderWorker {
    async fn run(self, listener: TcpListener, token: CancellationToken) {
        self.shared.set_state(SenderState::Waiting);

        match self.session(listener, &token).await {
            Ok(()) => info!("subscriber closed the connection"),
            Err(e) if is_cancellation(&e) => debug!("sender was cancelled"),
            Err(e) => warn!("sender terminated: {}", e),
        }
        self.shared.set_state(SenderState::Dead);
    }

    async fn session(&self, listener: TcpListener, token: &CancellationToken) -> anyhow::Result<()> {
        let stream = self.accept_subscriber(&listener, token).await?;
        drop(listener);

        self.shared.set_state(SenderState::Active);
        self.stream_messages(stream, token).await
    }

    /// Accepts connections until one of them completes the handshake. Every failed round
    ///  (timeout, accept error, rejected handshake) counts against the budget, while a successful
    ///  accept resets the count.
    async fn accept_subscriber(&self, listener: &TcpListener, token: &CancellationToken) -> anyhow::Result<TcpStream> {
        let mut failed_rounds = 0;
        loop {
            match token.guard(tokio::time::timeout(self.config.sender_accept_timeout, listener.accept())).await? {
                Err(_) => {
                    debug!("no subscriber connected within {:?}", self.config.sender_accept_timeout);
                }
                Ok(Err(e)) => {
                    warn!("error accepting subscriber connection: {}", e);
                }
                Ok(Ok((mut stream, peer_addr))) => {
                    failed_rounds = 0;
                    let handshake = tokio::time::timeout(self.config.sender_accept_timeout, self.handshake(&mut stream));
                    match token.guard(handshake).await? {
                        Ok(Ok(())) => {
                            debug!("subscriber connected from {:?}", peer_addr);
                            return Ok(stream);
                        }
                        Ok(Err(e)) => warn!("handshake with {:?} failed: {}", peer_addr, e),
                        Err(_) => warn!("handshake with {:?} timed out", peer_addr),
                    }
                }
            }

            failed_rounds += 1;
            if failed_rounds >= self.config.sender_accept_rounds {
                bail!("giving up after {} failed rounds", failed_rounds);
            }
        }
    }

    async fn handshake(&self, stream: &mut TcpStream) -> anyhow::Result<()> {
        let mut reader = FrameReader::new(self.config.max_frame_len);
        let header = ConnectionHeader::read_from(&mut reader, stream).await?;
        trace!("subscriber header: {:?}", header);

        if let Err(e) = header.validate_subscriber(&self.topic_info, Some(&self.remote_caller_id)) {
            if let Err(write_err) = ConnectionHeader::error(&e.to_string()).write_to(stream).await {
                debug!("could not send error header: {}", write_err);
            }
            return Err(e.into());
        }

        ConnectionHeader::for_publisher(&self.topic_info, self.latching)
            .write_to(stream)
            .await?;

        if header.flag(TCP_NODELAY) {
            stream.set_nodelay(true)?;
        }
        Ok(())
    }

    /// Returns `Ok(())` when the subscriber closes the connection
    async fn stream_messages(&self, stream: TcpStream, token: &CancellationToken) -> anyhow::Result<()> {
        let (mut read_half, mut write_half) = stream.into_split();
        let mut buf = BytesMut::new();
        let mut incoming = [0u8; 256];

        loop {
            select! {
                _ = token.cancelled() => {
                    return Err(Cancelled.into());
                }
                entries = self.queue.take_all() => {
                    let selection = select_for_sending(entries, self.config.max_queue_size_bytes, self.config.min_retained_messages);
                    if selection.num_dropped > 0 {
                        debug!("dropping {} queued messages ({} bytes)", selection.num_dropped, selection.bytes_dropped);
                        self.shared.stats.num_dropped.fetch_add(selection.num_dropped.safe_cast(), Ordering::Relaxed);
                        self.shared.stats.bytes_dropped.fetch_add(selection.bytes_dropped.safe_cast(), Ordering::Relaxed);
                    }

                    buf.clear();
                    for entry in &selection.kept {
                        put_message_frame(&mut buf, entry.message.as_ref());
                    }
                    token.guard(write_half.write_all(&buf)).await??;

                    let num_sent: usize = selection.kept.len();
                    self.shared.stats.num_sent.fetch_add(num_sent.safe_cast(), Ordering::Relaxed);
                    self.shared.stats.bytes_sent.fetch_add(buf.len().safe_cast(), Ordering::Relaxed);
                }
                n = read_half.read(&mut incoming) => {
                    match n? {
                        0 => return Ok(()),
                        n => trace!("ignoring {} unexpected bytes from subscriber", n),
                    }
                }
            }
        }
    }
}

/// Writes the frame's length prefix from the actual serialized length
fn put_message_frame(buf: &mut BytesMut, message: &dyn WireMessage) {
    let start = buf.len();
    buf.put_u32_le(0);
    message.ser(buf);
    let len: u32 = (buf.len() - start - FRAME_LEN_PREFIX).prechecked_cast();
    buf[start..start + FRAME_LEN_PREFIX].copy_from_slice(&len.to_le_bytes());
}
