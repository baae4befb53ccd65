use futures::SinkExt;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::ops::AddAssign;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::select;
use tokio::sync::mpsc::Receiver;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use triggered::Listener;

use crate::clock::Clock;
use crate::latency::LatencyModel;
use crate::message::{Message, MessageCodec, MessageType};
use crate::NodeId;

/// The number of messages that may wait to be applied to a single channel.
pub const SESSION_QUEUE_SIZE: usize = 2000;

/// The write half of a connection to a neighbor.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Tracks the number of forward messages that a channel has handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageCounts {
    pub probe: u64,
    pub commit: u64,
    pub reverse: u64,
    pub confirm: u64,
}

impl AddAssign for MessageCounts {
    fn add_assign(&mut self, other: Self) {
        self.probe += other.probe;
        self.commit += other.commit;
        self.reverse += other.reverse;
        self.confirm += other.confirm;
    }
}

impl Display for MessageCounts {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.probe, self.commit, self.reverse, self.confirm
        )
    }
}

/// The local node's view of one outgoing channel: how much it can still send to its peer, and the messages that
/// have crossed the channel so far.
#[derive(Debug, Clone)]
pub struct ChannelState {
    local: NodeId,
    peer: NodeId,
    capacity: f64,
    counts: MessageCounts,
    // Requests, keyed by (source, request id), that this channel has already released or settled.
    reversed: HashSet<(NodeId, u64)>,
    settled: HashSet<(NodeId, u64)>,
}

impl ChannelState {
    pub fn new(local: NodeId, peer: NodeId, capacity: f64) -> Self {
        ChannelState {
            local,
            peer,
            capacity,
            counts: MessageCounts::default(),
            reversed: HashSet::new(),
            settled: HashSet::new(),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn counts(&self) -> MessageCounts {
        self.counts
    }

    /// Applies a message's effect on the channel and returns it with this hop's contribution appended, ready to be
    /// passed on to the peer.
    pub fn apply(&mut self, mut msg: Message) -> Message {
        match msg.kind {
            MessageType::Probe => {
                self.counts.probe += 1;
                msg.cap.push(self.capacity);
            },
            MessageType::Commit => {
                if msg.commit_success && msg.commit >= 0.0 && msg.commit <= self.capacity {
                    self.capacity -= msg.commit;
                    msg.p1c.push(msg.commit);
                    self.counts.commit += 1;
                } else {
                    log::debug!(
                        "Channel {} -> {} cannot lock {} for {msg} with capacity {}.",
                        self.local,
                        self.peer,
                        msg.commit,
                        self.capacity
                    );
                    msg.commit_success = false;
                    msg.p1c.push(0.0);
                }
            },
            MessageType::Reverse => {
                self.counts.reverse += 1;
                self.release(&msg);
            },
            MessageType::Confirm => self.counts.confirm += 1,
            MessageType::ConfirmRet => self.settle(&msg),
            MessageType::ProbeRet | MessageType::CommitRet | MessageType::ReverseRet => {},
        }

        msg
    }

    /// Credits back the amount that this hop locked for the request being reversed.
    fn release(&mut self, msg: &Message) {
        let Some(hop) = msg.position(self.local) else {
            log::error!("Node {} is not on the path of {msg}.", self.local);
            return;
        };

        let Some(locked) = msg.p1c.get(hop).copied() else {
            log::error!(
                "Reverse {msg} carries no lock for hop {hop} ({} -> {}).",
                self.local,
                self.peer
            );
            return;
        };

        if !self.reversed.insert((msg.src, msg.request_id)) {
            log::warn!(
                "Ignoring duplicate reverse {msg} on {} -> {}.",
                self.local,
                self.peer
            );
            return;
        }

        self.capacity += locked;
    }

    /// Credits a confirmed payment to this channel, which carries funds in the reverse direction of the payment.
    fn settle(&mut self, msg: &Message) {
        if !self.settled.insert((msg.src, msg.request_id)) {
            log::warn!(
                "Ignoring duplicate settlement {msg} on {} -> {}.",
                self.local,
                self.peer
            );
            return;
        }

        self.capacity += msg.commit;
    }
}

/// Applies queued messages to a channel one at a time and writes them to the peer. The channel lock is held across
/// the write so that the order in which effects are applied is the order in which the peer receives messages.
///
/// The session stops when shutdown is triggered, when every sender for its queue has been dropped, or when a write
/// to the peer fails. Messages are not applied after a write failure.
pub async fn run_outbound_session(
    state: Arc<Mutex<ChannelState>>,
    writer: BoxedWriter,
    mut queue: Receiver<Message>,
    latency: Arc<dyn LatencyModel>,
    clock: Arc<dyn Clock>,
    listener: Listener,
) {
    let mut sink = FramedWrite::new(writer, MessageCodec::new());
    let (local, peer) = {
        let state = state.lock().await;
        (state.local, state.peer)
    };

    log::debug!("Outbound session {local} -> {peer} started.");

    loop {
        select! {
            biased;
            _ = listener.clone() => {
                log::debug!("Outbound session {local} -> {peer} received shutdown signal.");
                break;
            },
            msg = queue.recv() => {
                let Some(msg) = msg else {
                    log::debug!("Outbound session {local} -> {peer} queue closed.");
                    break;
                };

                clock.sleep(latency.hop_delay()).await;

                let mut state = state.lock().await;
                let msg = state.apply(msg);
                log::trace!("Sending {msg} to {peer}.");

                if let Err(e) = sink.send(msg).await {
                    log::error!("Outbound session {local} -> {peer} failed to write: {e}.");
                    break;
                }
            }
        }
    }

    queue.close();
    log::debug!("Outbound session {local} -> {peer} exiting.");
}
