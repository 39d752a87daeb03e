use super::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use chrono::{DateTime, Utc};
use raftlog_common::error::Result;
use raftlog_common::types::{NodeId, NodeMode, Term};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Procedure {
    VoteRequest,
    VoteResponse,
    AppendEntries,
    AppendResponse,
}

/// RPC-specific body of a message, tagged by procedure on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "procedure", content = "data", rename_all = "snake_case")]
pub enum Payload {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendResponse(AppendEntriesResponse),
}

impl Payload {
    pub fn procedure(&self) -> Procedure {
        match self {
            Payload::VoteRequest(_) => Procedure::VoteRequest,
            Payload::VoteResponse(_) => Procedure::VoteResponse,
            Payload::AppendEntries(_) => Procedure::AppendEntries,
            Payload::AppendResponse(_) => Procedure::AppendResponse,
        }
    }
}

/// Envelope exchanged between nodes.
///
/// Replies carry the id of the request they answer in `in_reply_to`, which is
/// how a waiting sender correlates a response with its request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub in_reply_to: Option<Uuid>,
    pub term: Term,
    pub sender: NodeId,
    pub recipient: NodeId,
    pub mode: NodeMode,
    pub created_time: DateTime<Utc>,
    pub sent_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    pub fn build(sender: &str, mode: NodeMode, term: Term, recipient: &str, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            in_reply_to: None,
            term,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            mode,
            created_time: Utc::now(),
            sent_time: None,
            payload,
        }
    }

    /// Build the answer to this message, addressed back to its sender.
    pub fn reply(&self, sender: &str, mode: NodeMode, term: Term, payload: Payload) -> Self {
        let mut reply = Message::build(sender, mode, term, &self.sender, payload);
        reply.in_reply_to = Some(self.id);
        reply
    }

    pub fn procedure(&self) -> Procedure {
        self.payload.procedure()
    }

    pub fn mark_sent(&mut self) {
        self.sent_time = Some(Utc::now());
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}(term={}, {} -> {})",
            self.procedure(),
            self.term,
            self.sender,
            self.recipient
        )
    }
}
