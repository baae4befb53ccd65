use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::{NodeId, Path};

/// The largest record the codec will buffer while waiting for a newline.
pub const MAX_RECORD_LEN: usize = 1024 * 1024;

/// The kinds of protocol message that travel between nodes. Forward types travel from the source towards the
/// destination and each is answered by its `*Ret` counterpart travelling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Probe,
    ProbeRet,
    Commit,
    CommitRet,
    Reverse,
    ReverseRet,
    Confirm,
    ConfirmRet,
}

impl MessageType {
    pub fn is_forward(&self) -> bool {
        matches!(
            self,
            MessageType::Probe | MessageType::Commit | MessageType::Reverse | MessageType::Confirm
        )
    }

    /// Returns the reply type for a forward message, or `None` if the message is already a reply.
    pub fn into_return(self) -> Option<MessageType> {
        match self {
            MessageType::Probe => Some(MessageType::ProbeRet),
            MessageType::Commit => Some(MessageType::CommitRet),
            MessageType::Reverse => Some(MessageType::ReverseRet),
            MessageType::Confirm => Some(MessageType::ConfirmRet),
            MessageType::ProbeRet
            | MessageType::CommitRet
            | MessageType::ReverseRet
            | MessageType::ConfirmRet => None,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Probe),
            2 => Ok(MessageType::ProbeRet),
            3 => Ok(MessageType::Commit),
            4 => Ok(MessageType::CommitRet),
            5 => Ok(MessageType::Reverse),
            6 => Ok(MessageType::ReverseRet),
            7 => Ok(MessageType::Confirm),
            8 => Ok(MessageType::ConfirmRet),
            _ => Err(format!("unknown message type {value}")),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Probe => 1,
            MessageType::ProbeRet => 2,
            MessageType::Commit => 3,
            MessageType::CommitRet => 4,
            MessageType::Reverse => 5,
            MessageType::ReverseRet => 6,
            MessageType::Confirm => 7,
            MessageType::ConfirmRet => 8,
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Probe => "probe",
            MessageType::ProbeRet => "probe_ret",
            MessageType::Commit => "commit",
            MessageType::CommitRet => "commit_ret",
            MessageType::Reverse => "reverse",
            MessageType::ReverseRet => "reverse_ret",
            MessageType::Confirm => "confirm",
            MessageType::ConfirmRet => "confirm_ret",
        };
        write!(f, "{name}")
    }
}

/// A protocol message for a single payment attempt along one path. Hops append to `cap` (on probes) and `p1c` (on
/// commits) as the message passes, so entry `i` always describes the channel from `path[i]` to `path[i + 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Identifies a single request from `src`, so that replies and settlements can be correlated.
    #[serde(rename = "rid", default)]
    pub request_id: u64,
    pub src: NodeId,
    pub dst: NodeId,
    pub path: Path,
    /// Channel capacities observed by a probe.
    #[serde(default)]
    pub cap: Vec<f64>,
    /// The amount each hop has locked for a commit.
    #[serde(default)]
    pub p1c: Vec<f64>,
    #[serde(default)]
    pub commit: f64,
    /// Cleared by the first hop that cannot lock the committed amount.
    #[serde(rename = "comstate", default)]
    pub commit_success: bool,
}

impl Message {
    fn new(kind: MessageType, request_id: u64, path: Path) -> Self {
        Message {
            kind,
            request_id,
            src: path.first().copied().unwrap_or_default(),
            dst: path.last().copied().unwrap_or_default(),
            path,
            cap: Vec::new(),
            p1c: Vec::new(),
            commit: 0.0,
            commit_success: false,
        }
    }

    pub fn probe(request_id: u64, path: Path) -> Self {
        Message::new(MessageType::Probe, request_id, path)
    }

    pub fn commit(request_id: u64, path: Path, amount: f64) -> Self {
        let mut msg = Message::new(MessageType::Commit, request_id, path);
        msg.commit = amount;
        msg.commit_success = true;
        msg
    }

    /// Creates a reverse that releases `amount` on every hop of the path, for amounts that were locked by several
    /// separate commits.
    pub fn reverse_amount(request_id: u64, path: Path, amount: f64) -> Self {
        let hops = path.len().saturating_sub(1);
        let mut msg = Message::new(MessageType::Reverse, request_id, path);
        msg.p1c = vec![amount; hops];
        msg.commit = amount;
        msg
    }

    /// Creates a confirm that credits `amount` to every hop's reverse channel as it returns.
    pub fn confirm_amount(request_id: u64, path: Path, amount: f64) -> Self {
        let mut msg = Message::new(MessageType::Confirm, request_id, path);
        msg.commit = amount;
        msg.commit_success = true;
        msg
    }

    /// Re-issues a committed message as a follow up of the kind provided (reverse or confirm), keeping its request
    /// ID and per-hop locks so that every hop releases or settles exactly what it locked.
    pub fn follow_up(&self, kind: MessageType) -> Self {
        Message {
            kind,
            ..self.clone()
        }
    }

    /// Returns the index of the node in the message's path.
    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.path.iter().position(|n| *n == node)
    }

    /// Returns the smallest capacity reported by a probe's hops. Negative reports are clamped to zero.
    pub fn path_capacity(&self) -> f64 {
        self.hop_capacities()
            .into_iter()
            .fold(None, |min: Option<f64>, c| Some(min.map_or(c, |m| m.min(c))))
            .unwrap_or(0.0)
    }

    /// Returns the per-hop capacities reported by a probe, clamping negative reports to zero.
    pub fn hop_capacities(&self) -> Vec<f64> {
        self.cap
            .iter()
            .map(|c| {
                if *c < 0.0 {
                    log::warn!(
                        "Request {} from {} reported negative capacity {c}, clamping to zero.",
                        self.request_id,
                        self.src
                    );
                    0.0
                } else {
                    *c
                }
            })
            .collect()
    }

    /// Returns the index of the first hop that refused to lock a commit.
    pub fn first_failed_hop(&self) -> Option<usize> {
        self.p1c.iter().position(|locked| *locked == 0.0)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} from {} -> {} over {:?}",
            self.kind, self.request_id, self.src, self.dst, self.path
        )
    }
}

/// Frames messages as newline delimited JSON. A record that cannot be parsed is logged and skipped, so that one bad
/// record does not take down the connection it arrived on.
#[derive(Debug, Default)]
pub struct MessageCodec {
    // Offset into the buffer up to which we have already searched for a newline.
    next_index: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        MessageCodec::default()
    }

    fn parse_record(record: &[u8]) -> Option<Message> {
        match serde_json::from_slice::<Message>(record) {
            Ok(msg) => Some(msg),
            Err(e) => {
                log::error!(
                    "Dropping malformed record {}: {e}",
                    String::from_utf8_lossy(record)
                );
                None
            },
        }
    }
}

fn is_blank(record: &[u8]) -> bool {
    record.iter().all(|b| b.is_ascii_whitespace())
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if src.len() > MAX_RECORD_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("record exceeds {MAX_RECORD_LEN} bytes without a delimiter"),
                    ));
                }

                self.next_index = src.len();
                return Ok(None);
            };

            let record = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            if is_blank(&record) {
                continue;
            }

            if let Some(msg) = MessageCodec::parse_record(&record) {
                return Ok(Some(msg));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(msg) = self.decode(src)? {
            return Ok(Some(msg));
        }

        // A final record may arrive without a trailing newline.
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }

        let record = src.split_to(src.len());
        if is_blank(&record) {
            return Ok(None);
        }

        Ok(MessageCodec::parse_record(&record))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut writer = dst.writer();
        serde_json::to_writer(&mut writer, &msg)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let dst = writer.into_inner();
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(msgs: &[Message]) -> BytesMut {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        for msg in msgs {
            codec.encode(msg.clone(), &mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn test_message_type_wire_values() {
        for value in 1..=8u8 {
            let kind = MessageType::try_from(value).unwrap();
            assert_eq!(u8::from(kind), value);
        }
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(9).is_err());
    }

    #[test]
    fn test_into_return() {
        assert_eq!(
            MessageType::Commit.into_return(),
            Some(MessageType::CommitRet)
        );
        assert_eq!(MessageType::ConfirmRet.into_return(), None);
        assert!(MessageType::Reverse.is_forward());
        assert!(!MessageType::ProbeRet.is_forward());
    }

    #[test]
    fn test_wire_field_names() {
        let msg = Message::commit(7, vec![1, 2, 3], 4.5);
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], 3);
        assert_eq!(value["rid"], 7);
        assert_eq!(value["src"], 1);
        assert_eq!(value["dst"], 3);
        assert_eq!(value["commit"], 4.5);
        assert_eq!(value["comstate"], true);
    }

    #[test]
    fn test_decode_accepts_sparse_record() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":2,\"src\":1,\"dst\":3,\"path\":[1,2,3],\"cap\":[4,5]}\n"[..]);

        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.kind, MessageType::ProbeRet);
        assert_eq!(msg.cap, vec![4.0, 5.0]);
        assert!(msg.p1c.is_empty());
        assert!(!msg.commit_success);
    }

    #[test]
    fn test_decode_many_records_in_one_read() {
        let first = Message::probe(1, vec![1, 2]);
        let second = Message::commit(2, vec![1, 2], 3.0);
        let mut buf = encode(&[first.clone(), second.clone()]);

        let mut codec = MessageCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_partial_record() {
        let msg = Message::probe(1, vec![1, 2, 3]);
        let encoded = encode(&[msg.clone()]);
        let (head, tail) = encoded.split_at(10);

        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(head);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(tail);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_decode_skips_malformed_record() {
        let msg = Message::probe(3, vec![1, 2]);
        let mut buf = BytesMut::from(&b"{not json}\n\n{\"type\":42,\"src\":1,\"dst\":2,\"path\":[1,2]}\n"[..]);
        buf.extend_from_slice(&encode(&[msg.clone()]));

        let mut codec = MessageCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_eof_without_newline() {
        let msg = Message::probe(3, vec![1, 2]);
        let mut buf = BytesMut::from(serde_json::to_vec(&msg).unwrap().as_slice());

        let mut codec = MessageCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(msg));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_unbounded_record() {
        let mut buf = BytesMut::from(vec![b'a'; MAX_RECORD_LEN + 1].as_slice());
        let mut codec = MessageCodec::new();
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_follow_up_keeps_locks() {
        let mut committed = Message::commit(9, vec![1, 2, 3], 2.0);
        committed.p1c = vec![2.0, 0.0];
        committed.commit_success = false;

        let reverse = committed.follow_up(MessageType::Reverse);
        assert_eq!(reverse.kind, MessageType::Reverse);
        assert_eq!(reverse.request_id, 9);
        assert_eq!(reverse.p1c, vec![2.0, 0.0]);
        assert_eq!(committed.first_failed_hop(), Some(1));
    }

    #[test]
    fn test_path_capacity_clamps_negative() {
        let mut msg = Message::probe(1, vec![1, 2, 3]);
        msg.cap = vec![4.0, -2.0];
        assert_eq!(msg.path_capacity(), 0.0);

        msg.cap = vec![4.0, 3.0];
        assert_eq!(msg.path_capacity(), 3.0);

        msg.cap = vec![];
        assert_eq!(msg.path_capacity(), 0.0);
    }

    #[test]
    fn test_synthetic_amounts() {
        let reverse = Message::reverse_amount(4, vec![1, 2, 3, 4], 2.5);
        assert_eq!(reverse.p1c, vec![2.5, 2.5, 2.5]);

        let confirm = Message::confirm_amount(5, vec![1, 2, 3, 4], 2.5);
        assert_eq!(confirm.commit, 2.5);
        assert_eq!(confirm.dst, 4);
    }
}
