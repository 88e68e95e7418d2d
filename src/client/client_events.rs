use tokio::sync::broadcast;
use tracing::trace;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// we receive messages from remote publishers
    Inbound,
    /// we send messages to remote subscribers
    Outbound,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientEvent {
    NumConnectionsChanged(NumConnectionsChangedData),
    /// a peer asked this node to shut down. The client does not act on this itself, it is up to
    ///  the application to react.
    ShutdownRequested(ShutdownRequestedData),
    ParamUpdated(ParamUpdatedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NumConnectionsChangedData {
    pub topic: String,
    pub direction: Direction,
    pub count: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShutdownRequestedData {
    pub caller_id: String,
    pub reason: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParamUpdatedData {
    pub key: String,
}


pub struct ClientEventNotifier {
    sender: broadcast::Sender<ClientEvent>,
}
impl Default for ClientEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}
impl ClientEventNotifier {
    pub fn new() -> ClientEventNotifier {
        let (sender, _) = broadcast::channel(128);

        ClientEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ClientEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
