use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use triggered::{Listener, Trigger};

use crate::clock::Clock;
use crate::dispatcher::{run_inbound_connection, BoxedReader, DispatchError, Dispatcher, RESULT_QUEUE_SIZE};
use crate::latency::LatencyModel;
use crate::message::Message;
use crate::routing::PaymentNetwork;
use crate::session::{
    run_outbound_session, BoxedWriter, ChannelState, MessageCounts, SESSION_QUEUE_SIZE,
};
use crate::{NodeId, NodeInfo, SimulationError};

/// The number of times a neighbor is dialed before startup fails.
pub const DIAL_ATTEMPTS: u32 = 30;

/// The time waited between attempts to dial a neighbor.
pub const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// The shared pieces that every task of a node runs with.
#[derive(Clone)]
pub struct NodeRuntime {
    pub clock: Arc<dyn Clock>,
    pub latency: Arc<dyn LatencyModel>,
    pub shutdown_trigger: Trigger,
    pub shutdown_listener: Listener,
}

/// The final state of one of the node's outgoing channels.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReport {
    pub local: NodeId,
    pub peer: NodeId,
    pub capacity: f64,
    pub counts: MessageCounts,
}

impl Display for ChannelReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "channel {} -> {}: capacity {} (probe {} commit {} reverse {} confirm {})",
            self.local,
            self.peer,
            self.capacity,
            self.counts.probe,
            self.counts.commit,
            self.counts.reverse,
            self.counts.confirm
        )
    }
}

/// Collects a node's outgoing channels before it starts dispatching. Each channel's session starts running as soon as
/// it is added.
pub struct NodeBuilder {
    info: NodeInfo,
    runtime: NodeRuntime,
    sessions: HashMap<NodeId, Sender<Message>>,
    channels: BTreeMap<NodeId, Arc<Mutex<ChannelState>>>,
    tasks: JoinSet<()>,
}

impl NodeBuilder {
    pub fn new(info: NodeInfo, runtime: NodeRuntime) -> Self {
        NodeBuilder {
            info,
            runtime,
            sessions: HashMap::new(),
            channels: BTreeMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Opens a channel towards `peer` with the capacity in its neighbor record, writing to the connection provided.
    pub fn add_channel(&mut self, peer: &NodeInfo, writer: BoxedWriter) -> Result<(), SimulationError> {
        if self.channels.contains_key(&peer.id) {
            return Err(SimulationError::ValidationError(format!(
                "duplicate channel from {} to {}",
                self.info.id, peer.id
            )));
        }

        let state = Arc::new(Mutex::new(ChannelState::new(
            self.info.id,
            peer.id,
            peer.capacity,
        )));
        let (sender, receiver) = channel(SESSION_QUEUE_SIZE);

        self.tasks.spawn(run_outbound_session(
            state.clone(),
            writer,
            receiver,
            self.runtime.latency.clone(),
            self.runtime.clock.clone(),
            self.runtime.shutdown_listener.clone(),
        ));

        self.sessions.insert(peer.id, sender);
        self.channels.insert(peer.id, state);
        Ok(())
    }

    pub fn build(self) -> Node {
        let (results_sender, results) = channel(RESULT_QUEUE_SIZE);
        let dispatcher = Arc::new(Dispatcher::new(
            self.info.id,
            self.sessions.clone(),
            results_sender,
            self.runtime.shutdown_trigger.clone(),
        ));

        Node {
            info: self.info,
            runtime: self.runtime,
            dispatcher,
            sessions: self.sessions,
            channels: self.channels,
            results: Some(results),
            tasks: self.tasks,
        }
    }
}

/// A running node: outbound sessions to each neighbor, inbound connections that dispatch what neighbors send, and a
/// result queue where replies to the node's own requests arrive.
pub struct Node {
    info: NodeInfo,
    runtime: NodeRuntime,
    dispatcher: Arc<Dispatcher>,
    sessions: HashMap<NodeId, Sender<Message>>,
    channels: BTreeMap<NodeId, Arc<Mutex<ChannelState>>>,
    results: Option<Receiver<Message>>,
    tasks: JoinSet<()>,
}

impl Node {
    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    /// Starts dispatching the messages that arrive on a connection from a neighbor.
    pub fn accept_inbound(&mut self, reader: BoxedReader) {
        self.tasks.spawn(run_inbound_connection(
            reader,
            self.dispatcher.clone(),
            self.runtime.shutdown_listener.clone(),
        ));
    }

    /// Accepts neighbor connections from the listener until shutdown.
    pub fn spawn_acceptor(&mut self, listener: TcpListener) {
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.runtime.shutdown_listener.clone();
        let local = self.info.id;

        self.tasks.spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                select! {
                    biased;
                    _ = shutdown.clone() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, address)) => {
                                log::debug!("Node {local} accepted connection from {address}.");
                                connections.spawn(run_inbound_connection(
                                    Box::new(stream),
                                    dispatcher.clone(),
                                    shutdown.clone(),
                                ));
                            },
                            Err(e) => log::warn!("Node {local} failed to accept connection: {e}."),
                        }
                    }
                }
            }

            while let Some(res) = connections.join_next().await {
                if let Err(e) = res {
                    log::error!("Inbound connection task for {local} failed: {e}.");
                }
            }
        });
    }

    /// Hands out the node's view of the payment network. The result queue has a single consumer, so this may only
    /// be called once.
    pub fn network(&mut self, reply_timeout: Option<Duration>) -> Result<NodeNetwork, SimulationError> {
        let results = self.results.take().ok_or_else(|| {
            SimulationError::ValidationError(format!(
                "payment network for node {} already taken",
                self.info.id
            ))
        })?;

        Ok(NodeNetwork {
            local: self.info.id,
            sessions: self.sessions.clone(),
            results,
            reply_timeout,
            shutdown: self.runtime.shutdown_listener.clone(),
        })
    }

    /// Reports the capacity and message counts of every outgoing channel, in ascending peer order.
    pub async fn channel_reports(&self) -> Vec<ChannelReport> {
        let mut reports = Vec::with_capacity(self.channels.len());
        for (peer, state) in self.channels.iter() {
            let state = state.lock().await;
            reports.push(ChannelReport {
                local: self.info.id,
                peer: *peer,
                capacity: state.capacity(),
                counts: state.counts(),
            });
        }

        reports
    }

    /// Sums the message counts across every outgoing channel.
    pub async fn message_counts(&self) -> MessageCounts {
        let mut counts = MessageCounts::default();
        for report in self.channel_reports().await {
            counts += report.counts;
        }

        counts
    }

    /// Triggers shutdown and waits for every task of the node to exit.
    pub async fn shutdown(mut self) {
        self.runtime.shutdown_trigger.trigger();
        // Dropping our senders lets sessions drain if they are waiting on their queue.
        self.sessions.clear();

        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                log::error!("Task for node {} failed: {e}.", self.info.id);
            }
        }

        log::info!("Node {} shut down.", self.info.id);
    }
}

/// Sends the local node's requests through its outbound sessions and collects replies from its result queue.
/// Requests are strictly sequential, so the next reply on the queue is the reply to the request just sent.
pub struct NodeNetwork {
    local: NodeId,
    sessions: HashMap<NodeId, Sender<Message>>,
    results: Receiver<Message>,
    reply_timeout: Option<Duration>,
    shutdown: Listener,
}

impl NodeNetwork {
    async fn next_reply(&mut self) -> Result<Message, SimulationError> {
        let local = self.local;
        let shutdown = self.shutdown.clone();
        let reply_timeout = self.reply_timeout;
        let results = &mut self.results;

        let reply = async move {
            match reply_timeout {
                Some(wait) => tokio::time::timeout(wait, results.recv())
                    .await
                    .map_err(|_| SimulationError::ReplyTimeout(wait)),
                None => Ok(results.recv().await),
            }
        };

        select! {
            biased;
            _ = shutdown => Err(SimulationError::Shutdown(format!(
                "node {local} stopped while waiting for a reply"
            ))),
            reply = reply => reply?.ok_or_else(|| {
                SimulationError::MpscChannelError(format!("result queue for node {local} closed"))
            }),
        }
    }
}

#[async_trait]
impl PaymentNetwork for NodeNetwork {
    async fn round_trip(&mut self, msg: Message) -> Result<Message, SimulationError> {
        let next_hop = msg
            .path
            .get(1)
            .copied()
            .filter(|_| msg.src == self.local)
            .ok_or_else(|| {
                SimulationError::ValidationError(format!("{msg} cannot be sent by node {}", self.local))
            })?;

        let session = self
            .sessions
            .get(&next_hop)
            .ok_or(DispatchError::UnknownNextHop(next_hop, msg.kind))?;

        let request_id = msg.request_id;
        session
            .send(msg)
            .await
            .map_err(|_| DispatchError::SessionClosed(next_hop))?;

        let reply = self.next_reply().await?;
        if reply.request_id != request_id {
            log::warn!("Node {} expected reply to {request_id}, got {reply}.", self.local);
        }

        Ok(reply)
    }
}

async fn dial(peer: &NodeInfo, clock: &dyn Clock) -> Result<TcpStream, SimulationError> {
    let address = format!("{}:{}", peer.ip, peer.port);

    for attempt in 1..=DIAL_ATTEMPTS {
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            },
            Err(e) => {
                log::debug!("Dial {attempt} to {peer} failed: {e}.");
                clock.sleep(DIAL_RETRY_INTERVAL).await;
            },
        }
    }

    Err(SimulationError::ConnectionError(format!(
        "could not reach {peer} after {DIAL_ATTEMPTS} attempts"
    )))
}

/// Starts a node over TCP: listens on the node's own address, dials every neighbor to open a channel towards it and
/// accepts the connections that neighbors open in return.
pub async fn start_tcp_node(
    info: NodeInfo,
    neighbors: &[NodeInfo],
    runtime: NodeRuntime,
) -> Result<Node, SimulationError> {
    let listener = TcpListener::bind((info.ip.as_str(), info.port)).await?;
    log::info!("{info} listening with {} neighbor(s).", neighbors.len());

    let mut builder = NodeBuilder::new(info, runtime.clone());
    for peer in neighbors {
        let stream = select! {
            biased;
            _ = runtime.shutdown_listener.clone() => {
                return Err(SimulationError::Shutdown("shutdown while dialing neighbors".to_string()));
            },
            stream = dial(peer, runtime.clock.as_ref()) => stream?,
        };

        log::debug!("Connected to {peer} with capacity {}.", peer.capacity);
        builder.add_channel(peer, Box::new(stream))?;
    }

    let mut node = builder.build();
    node.spawn_acceptor(listener);
    Ok(node)
}
