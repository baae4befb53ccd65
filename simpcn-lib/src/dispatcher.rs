use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::select;
use tokio::sync::mpsc::Sender;
use tokio_util::codec::FramedRead;
use triggered::{Listener, Trigger};

use crate::message::{Message, MessageCodec, MessageType};
use crate::{NodeId, Path};

/// The read half of a connection from a neighbor.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The number of replies that may wait for the local node's driver to collect them.
pub const RESULT_QUEUE_SIZE: usize = 1000;

/// Errors that occur while routing an inbound message onward.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error("UnknownNextHop: no channel to {0} for {1} message")]
    UnknownNextHop(NodeId, MessageType),
    #[error("NotOnPath: node {0} is not on path {1:?}")]
    NotOnPath(NodeId, Path),
    #[error("PathExhausted: node {0} has no next hop on path {1:?}")]
    PathExhausted(NodeId, Path),
    #[error("UnexpectedMessage: {0} message arrived at its {1} endpoint")]
    UnexpectedMessage(MessageType, &'static str),
    #[error("SessionClosed: channel to {0} is no longer running")]
    SessionClosed(NodeId),
    #[error("ResultQueueClosed: replies are no longer being collected")]
    ResultQueueClosed,
}

impl DispatchError {
    /// Critical errors indicate that the peer set disagrees about the network (or that part of the local node has
    /// stopped), so no further payments can be trusted to complete and the node should shut down.
    pub fn is_critical(&self) -> bool {
        match self {
            DispatchError::UnknownNextHop(_, _) => true,
            DispatchError::NotOnPath(_, _) => true,
            DispatchError::PathExhausted(_, _) => true,
            DispatchError::SessionClosed(_) => true,
            DispatchError::UnexpectedMessage(_, _) => false,
            DispatchError::ResultQueueClosed => false,
        }
    }
}

/// Where an inbound message goes next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Apply to the channel towards `next_hop` and pass it on.
    Forward { next_hop: NodeId, msg: Message },
    /// The message is a reply for the local node's own request.
    Deliver(Message),
}

/// Decides what the local node does with a message that arrived from a neighbor:
/// - At the destination, forward messages are turned into their reply and sent back along the path.
/// - At the source, replies are handed to the local driver.
/// - Elsewhere, forward messages continue towards the destination and replies continue towards the source.
pub fn route_message(local: NodeId, mut msg: Message) -> Result<Action, DispatchError> {
    if msg.dst == local {
        let reply = msg
            .kind
            .into_return()
            .ok_or(DispatchError::UnexpectedMessage(msg.kind, "destination"))?;

        let next_hop = msg
            .path
            .len()
            .checked_sub(2)
            .and_then(|i| msg.path.get(i))
            .copied()
            .ok_or_else(|| DispatchError::PathExhausted(local, msg.path.clone()))?;

        msg.kind = reply;
        return Ok(Action::Forward { next_hop, msg });
    }

    if msg.src == local {
        if msg.kind.is_forward() {
            return Err(DispatchError::UnexpectedMessage(msg.kind, "source"));
        }

        return Ok(Action::Deliver(msg));
    }

    let position = msg
        .position(local)
        .ok_or_else(|| DispatchError::NotOnPath(local, msg.path.clone()))?;

    let next = if msg.kind.is_forward() {
        position.checked_add(1)
    } else {
        position.checked_sub(1)
    };

    let next_hop = next
        .and_then(|i| msg.path.get(i))
        .copied()
        .ok_or_else(|| DispatchError::PathExhausted(local, msg.path.clone()))?;

    Ok(Action::Forward { next_hop, msg })
}

/// Hands inbound messages to the outbound session they must continue on, or to the local result queue.
pub struct Dispatcher {
    local: NodeId,
    sessions: HashMap<NodeId, Sender<Message>>,
    results: Sender<Message>,
    shutdown: Trigger,
}

impl Dispatcher {
    pub fn new(
        local: NodeId,
        sessions: HashMap<NodeId, Sender<Message>>,
        results: Sender<Message>,
        shutdown: Trigger,
    ) -> Self {
        Dispatcher {
            local,
            sessions,
            results,
            shutdown,
        }
    }

    pub async fn dispatch(&self, msg: Message) -> Result<(), DispatchError> {
        match route_message(self.local, msg)? {
            Action::Deliver(msg) => self
                .results
                .send(msg)
                .await
                .map_err(|_| DispatchError::ResultQueueClosed),
            Action::Forward { next_hop, msg } => {
                let session = self
                    .sessions
                    .get(&next_hop)
                    .ok_or(DispatchError::UnknownNextHop(next_hop, msg.kind))?;

                session
                    .send(msg)
                    .await
                    .map_err(|_| DispatchError::SessionClosed(next_hop))
            },
        }
    }

    /// Dispatches a message, triggering shutdown of the whole node if it could not be routed because of a critical
    /// error. Returns false if the node is shutting down.
    async fn dispatch_or_shutdown(&self, msg: Message) -> bool {
        let description = msg.to_string();
        match self.dispatch(msg).await {
            Ok(()) => true,
            Err(e) if e.is_critical() => {
                log::error!("Node {} could not route {description}: {e}.", self.local);
                self.shutdown.trigger();
                false
            },
            Err(e) => {
                log::warn!("Node {} dropped {description}: {e}.", self.local);
                true
            },
        }
    }
}

/// Reads messages from a neighbor's connection and dispatches them until the connection closes or shutdown is
/// triggered.
pub async fn run_inbound_connection(
    reader: BoxedReader,
    dispatcher: Arc<Dispatcher>,
    listener: Listener,
) {
    let mut frames = FramedRead::new(reader, MessageCodec::new());
    let local = dispatcher.local;

    loop {
        select! {
            biased;
            _ = listener.clone() => {
                log::debug!("Inbound connection to {local} received shutdown signal.");
                break;
            },
            frame = frames.next() => {
                match frame {
                    Some(Ok(msg)) => {
                        log::trace!("Node {local} received {msg}.");
                        if !dispatcher.dispatch_or_shutdown(msg).await {
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        log::error!("Inbound connection to {local} failed: {e}.");
                        break;
                    },
                    None => {
                        log::debug!("Inbound connection to {local} closed by peer.");
                        break;
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageCodec;
    use futures::SinkExt;
    use ntest::assert_true;
    use std::time::Duration;
    use tokio::sync::mpsc::channel;
    use tokio::time::timeout;
    use tokio_util::codec::FramedWrite;

    #[test]
    fn test_destination_flips_to_reply() {
        let msg = Message::probe(1, vec![1, 2, 3]);
        let action = route_message(3, msg).unwrap();

        match action {
            Action::Forward { next_hop, msg } => {
                assert_eq!(next_hop, 2);
                assert_eq!(msg.kind, MessageType::ProbeRet);
            },
            Action::Deliver(_) => panic!("destination should not deliver"),
        }
    }

    #[test]
    fn test_intermediate_forwards_by_direction() {
        let forward = Message::commit(1, vec![1, 2, 3, 4], 1.0);
        assert_eq!(
            route_message(3, forward.clone()).unwrap(),
            Action::Forward {
                next_hop: 4,
                msg: forward.clone()
            }
        );

        let reply = forward.follow_up(MessageType::CommitRet);
        assert_eq!(
            route_message(3, reply.clone()).unwrap(),
            Action::Forward {
                next_hop: 2,
                msg: reply
            }
        );
    }

    #[test]
    fn test_source_delivers_replies_only() {
        let reply = Message::probe(1, vec![1, 2]).follow_up(MessageType::ProbeRet);
        assert_eq!(
            route_message(1, reply.clone()).unwrap(),
            Action::Deliver(reply)
        );

        let err = route_message(1, Message::probe(1, vec![1, 2])).unwrap_err();
        assert!(!err.is_critical());
    }

    #[test]
    fn test_unroutable_is_critical() {
        let err = route_message(9, Message::probe(1, vec![1, 2, 3])).unwrap_err();
        assert_eq!(err, DispatchError::NotOnPath(9, vec![1, 2, 3]));
        assert!(err.is_critical());

        let mut truncated = Message::probe(1, vec![1, 2]);
        truncated.dst = 3;
        let err = route_message(2, truncated).unwrap_err();
        assert!(matches!(err, DispatchError::PathExhausted(2, _)));
        assert!(err.is_critical());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_next_hop() {
        let (results, _receiver) = channel(1);
        let (shutdown, _listener) = triggered::trigger();
        let dispatcher = Dispatcher::new(2, HashMap::new(), results, shutdown);

        let err = dispatcher
            .dispatch(Message::probe(1, vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::UnknownNextHop(3, MessageType::Probe));
    }

    #[tokio::test]
    async fn test_inbound_connection_dispatches_and_triggers_shutdown() {
        let (to_peer, mut peer_queue) = channel(10);
        let (results, mut result_queue) = channel(10);
        let (shutdown, listener) = triggered::trigger();

        let mut sessions = HashMap::new();
        sessions.insert(3, to_peer);
        let dispatcher = Arc::new(Dispatcher::new(2, sessions, results, shutdown));

        let (writer, reader) = tokio::io::duplex(4096);
        let task = tokio::spawn(run_inbound_connection(
            Box::new(reader),
            dispatcher,
            listener.clone(),
        ));

        let mut frames = FramedWrite::new(writer, MessageCodec::new());
        let probe = Message::probe(1, vec![1, 2, 3]);
        frames.send(probe.clone()).await.unwrap();
        assert_eq!(peer_queue.recv().await, Some(probe));

        let reply = Message::probe(1, vec![2, 3]).follow_up(MessageType::ProbeRet);
        frames.send(reply.clone()).await.unwrap();
        assert_eq!(result_queue.recv().await, Some(reply));

        // A message for a channel that this node does not have shuts the node down.
        frames
            .send(Message::probe(2, vec![1, 2, 4]))
            .await
            .unwrap();
        assert_true!(timeout(Duration::from_secs(1), listener).await.is_ok());
        assert_true!(timeout(Duration::from_secs(1), task).await.is_ok());
    }
}
