use super::message::Message;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use raftlog_common::error::{RaftError, Result};
use raftlog_common::types::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// How often an idle subscription checks whether its handler is still active.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Receives inbound messages from a transport.
pub trait MessageHandler: Send + Sync {
    /// Process one message, returning the reply to send back, if any.
    fn on_message(&self, message: Message) -> Result<Option<Message>>;

    /// A subscription stops once its handler reports inactive.
    fn is_active(&self) -> bool {
        true
    }
}

/// Pending answer to a published request.
pub struct Reply {
    request: Uuid,
    peer: NodeId,
    rx: Receiver<Message>,
}

impl Reply {
    pub fn new(request: Uuid, peer: impl Into<NodeId>, rx: Receiver<Message>) -> Self {
        Self {
            request,
            peer: peer.into(),
            rx,
        }
    }

    pub fn request(&self) -> Uuid {
        self.request
    }

    /// Block until the matching reply arrives or `timeout` passes.
    pub fn wait(self, timeout: Duration) -> Result<Message> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok(reply) if reply.in_reply_to == Some(self.request) => return Ok(reply),
                Ok(stray) => debug!(peer = %self.peer, reply = %stray, "discarding uncorrelated reply"),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(RaftError::transport(&self.peer, "timed out waiting for reply"))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RaftError::transport(&self.peer, "no reply"))
                }
            }
        }
    }
}

/// Carries messages between the nodes of a cluster.
pub trait Transport: Send + Sync {
    /// Peers currently reachable, excluding this node.
    fn connected(&self) -> HashSet<NodeId>;

    fn is_connected(&self, peer: &str) -> bool {
        self.connected().contains(peer)
    }

    /// Send `message` to its recipient and hand back a handle for the reply.
    fn publish(&self, message: Message) -> Result<Reply>;

    /// Serve inbound messages until shut down or until the handler goes inactive.
    fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    fn shutdown(&self);

    /// Drop any resources held for `peer`.
    fn close(&self, _peer: &str) {}

    /// Notified when talking to `peer` failed.
    fn handle_exception(&self, peer: &str, error: &RaftError) {
        warn!(peer, %error, "communication failed");
    }
}

struct Envelope {
    bytes: Vec<u8>,
    reply_to: Sender<Message>,
}

#[derive(Default)]
struct Registry {
    inboxes: HashMap<NodeId, Sender<Envelope>>,
    isolated: HashSet<NodeId>,
}

/// Process-local network connecting [`InMemoryTransport`]s.
///
/// Messages travel JSON-encoded, as they would over a socket. Isolating a
/// node cuts it off in both directions until it is healed.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, node: impl Into<NodeId>) -> InMemoryTransport {
        let (stop_tx, stop_rx) = channel::bounded(1);
        InMemoryTransport {
            node: node.into(),
            network: self.clone(),
            stop_tx,
            stop_rx,
        }
    }

    pub fn isolate(&self, node: &str) {
        warn!(node, "isolating node");
        self.registry.lock().isolated.insert(node.to_string());
    }

    pub fn heal(&self, node: &str) {
        warn!(node, "healing node");
        self.registry.lock().isolated.remove(node);
    }

    pub fn is_isolated(&self, node: &str) -> bool {
        self.registry.lock().isolated.contains(node)
    }

    /// Either end of the link is isolated.
    pub fn is_partitioned(&self, a: &str, b: &str) -> bool {
        let registry = self.registry.lock();
        registry.isolated.contains(a) || registry.isolated.contains(b)
    }

    fn reachable(&self, from: &str, to: &str) -> Option<Sender<Envelope>> {
        let registry = self.registry.lock();
        if registry.isolated.contains(from) || registry.isolated.contains(to) {
            return None;
        }
        registry.inboxes.get(to).cloned()
    }
}

pub struct InMemoryTransport {
    node: NodeId,
    network: InMemoryNetwork,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl InMemoryTransport {
    pub fn node(&self) -> &str {
        &self.node
    }

    fn serve(&self, handler: &dyn MessageHandler, envelope: Envelope) {
        let message = match Message::decode(&envelope.bytes) {
            Ok(message) => message,
            Err(e) => {
                error!(node = %self.node, error = %e, "dropping undecodable message");
                return;
            }
        };

        let sender = message.sender.clone();
        match handler.on_message(message) {
            Ok(Some(mut reply)) => {
                // Replies ride the request's own channel, so only isolation can drop them
                if self.network.is_partitioned(&self.node, &sender) {
                    debug!(node = %self.node, peer = %sender, "reply lost to partition");
                    return;
                }
                reply.mark_sent();
                let _ = envelope.reply_to.try_send(reply);
            }
            Ok(None) => {}
            Err(e) => error!(node = %self.node, peer = %sender, error = %e, "failed to handle message"),
        }
    }
}

impl Transport for InMemoryTransport {
    fn connected(&self) -> HashSet<NodeId> {
        let registry = self.network.registry.lock();
        if registry.isolated.contains(&self.node) {
            return HashSet::new();
        }

        registry
            .inboxes
            .keys()
            .filter(|n| **n != self.node && !registry.isolated.contains(*n))
            .cloned()
            .collect()
    }

    fn publish(&self, mut message: Message) -> Result<Reply> {
        let peer = message.recipient.clone();
        let inbox = self
            .network
            .reachable(&self.node, &peer)
            .ok_or_else(|| RaftError::transport(&peer, "unreachable"))?;

        message.mark_sent();
        let bytes = message.encode()?;
        let (reply_to, rx) = channel::bounded(1);
        inbox
            .send(Envelope { bytes, reply_to })
            .map_err(|_| RaftError::transport(&peer, "inbox closed"))?;

        Ok(Reply::new(message.id, peer, rx))
    }

    fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        // Discard a stop request left over from an earlier subscription
        while self.stop_rx.try_recv().is_ok() {}

        let (inbox, rx) = channel::unbounded();
        self.network
            .registry
            .lock()
            .inboxes
            .insert(self.node.clone(), inbox.clone());
        debug!(node = %self.node, "subscribed");

        loop {
            channel::select! {
                recv(rx) -> envelope => match envelope {
                    Ok(envelope) => self.serve(handler.as_ref(), envelope),
                    Err(_) => break,
                },
                recv(self.stop_rx) -> _ => break,
                default(POLL_INTERVAL) => {
                    if !handler.is_active() {
                        break;
                    }
                }
            }
        }

        let mut registry = self.network.registry.lock();
        if registry.inboxes.get(&self.node).map_or(false, |s| s.same_channel(&inbox)) {
            registry.inboxes.remove(&self.node);
        }
        debug!(node = %self.node, "unsubscribed");
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::message::Payload;
    use crate::raft::rpc::{VoteRequest, VoteResponse};
    use raftlog_common::types::NodeMode;
    use std::thread;

    struct Granting(String);

    impl MessageHandler for Granting {
        fn on_message(&self, message: Message) -> Result<Option<Message>> {
            let payload = Payload::VoteResponse(VoteResponse {
                granted: true,
                eligible: true,
            });
            Ok(Some(message.reply(&self.0, NodeMode::Active, message.term, payload)))
        }
    }

    fn vote_request(from: &str, to: &str) -> Message {
        Message::build(
            from,
            NodeMode::Active,
            1,
            to,
            Payload::VoteRequest(VoteRequest {
                candidate_id: from.into(),
                last_log_index: 0,
                last_log_term: 0,
            }),
        )
    }

    fn wait_until_connected(transport: &InMemoryTransport, peer: &str) {
        for _ in 0..100 {
            if transport.is_connected(peer) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("{} never connected", peer);
    }

    #[test]
    fn test_publish_and_receive_reply() {
        let network = InMemoryNetwork::new();
        let a = network.transport("a");
        let b = Arc::new(network.transport("b"));

        let server = {
            let b = b.clone();
            thread::spawn(move || b.subscribe(Arc::new(Granting("b".into()))))
        };
        wait_until_connected(&a, "b");

        let request = vote_request("a", "b");
        let id = request.id;
        let reply = a.publish(request).unwrap().wait(Duration::from_secs(1)).unwrap();

        assert_eq!(reply.in_reply_to, Some(id));
        assert_eq!(reply.sender, "b");
        assert!(reply.sent_time.is_some());

        b.shutdown();
        server.join().unwrap().unwrap();
        assert!(!a.is_connected("b"));
    }

    #[test]
    fn test_isolated_node_is_unreachable() {
        let network = InMemoryNetwork::new();
        let a = network.transport("a");
        let b = Arc::new(network.transport("b"));

        let server = {
            let b = b.clone();
            thread::spawn(move || b.subscribe(Arc::new(Granting("b".into()))))
        };
        wait_until_connected(&a, "b");

        network.isolate("b");
        assert!(a.connected().is_empty());
        assert!(b.connected().is_empty());
        assert!(matches!(a.publish(vote_request("a", "b")), Err(RaftError::Transport { .. })));

        network.heal("b");
        assert!(a.is_connected("b"));

        b.shutdown();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_reply_reaches_requester_without_a_subscription() {
        let network = InMemoryNetwork::new();
        let a = network.transport("a");
        let b = Arc::new(network.transport("b"));

        let server = {
            let b = b.clone();
            thread::spawn(move || b.subscribe(Arc::new(Granting("b".into()))))
        };
        wait_until_connected(&a, "b");
        assert!(!b.is_connected("a"));

        for _ in 0..3 {
            let reply = a.publish(vote_request("a", "b")).unwrap().wait(Duration::from_secs(1));
            assert_eq!(reply.unwrap().sender, "b");
        }

        b.shutdown();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_reply_dropped_when_requester_isolated_mid_flight() {
        struct Isolating(InMemoryNetwork);

        impl MessageHandler for Isolating {
            fn on_message(&self, message: Message) -> Result<Option<Message>> {
                self.0.isolate(&message.sender);
                let payload = Payload::VoteResponse(VoteResponse {
                    granted: true,
                    eligible: true,
                });
                Ok(Some(message.reply("b", NodeMode::Active, message.term, payload)))
            }
        }

        let network = InMemoryNetwork::new();
        let a = network.transport("a");
        let b = Arc::new(network.transport("b"));

        let server = {
            let b = b.clone();
            let handler = Arc::new(Isolating(network.clone()));
            thread::spawn(move || b.subscribe(handler))
        };
        wait_until_connected(&a, "b");

        let reply = a.publish(vote_request("a", "b")).unwrap();
        assert!(reply.wait(Duration::from_millis(200)).is_err());
        assert!(network.is_partitioned("a", "b"));

        b.shutdown();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_unknown_peer_is_unreachable() {
        let network = InMemoryNetwork::new();
        let a = network.transport("a");
        assert!(a.publish(vote_request("a", "ghost")).is_err());
    }

    #[test]
    fn test_reply_times_out() {
        let (_tx, rx) = channel::bounded(1);
        let reply = Reply::new(Uuid::new_v4(), "b", rx);
        assert!(reply.wait(Duration::from_millis(10)).is_err());
    }
}
