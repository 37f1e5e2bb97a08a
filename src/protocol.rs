// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire protocol: the JSON message envelope and every body kind.
//!
//! Each line on the wire is one [`Message`]:
//!
//! ```text
//! {"src":"c1","dest":"n1","body":{"type":"broadcast","msg_id":7,"message":42}}
//! ```
//!
//! The body's `type` field selects a [`Payload`] variant; `msg_id` and
//! `in_reply_to` live next to it and correlate requests with replies.

use crate::error::{ReplicaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A single message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub src: String,
    pub dest: String,
    pub body: Body,
}

/// Message body: correlation ids plus the typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub payload: Payload,
}

/// One or many broadcast values.
///
/// Single-value gossip carries a bare number, batched gossip a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Values {
    One(i64),
    Many(Vec<i64>),
}

impl Values {
    pub fn into_vec(self) -> Vec<i64> {
        match self {
            Values::One(v) => vec![v],
            Values::Many(vs) => vs,
        }
    }
}

impl From<i64> for Values {
    fn from(value: i64) -> Self {
        Values::One(value)
    }
}

impl From<Vec<i64>> for Values {
    fn from(mut values: Vec<i64>) -> Self {
        if values.len() == 1 {
            Values::One(values.remove(0))
        } else {
            Values::Many(values)
        }
    }
}

/// A counter increment tagged with a network-unique id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub delta: i64,
    pub delta_id: String,
}

/// One log append as gossiped to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub key: String,
    pub offset: u64,
    pub msg: i64,
}

/// One commit_offsets request as gossiped to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub offsets: BTreeMap<String, u64>,
}

/// Every body kind this node sends or receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    // Lifecycle
    Init {
        node_id: String,
        node_ids: Vec<String>,
    },
    InitOk,
    Topology {
        #[serde(default)]
        topology: HashMap<String, Vec<String>>,
    },
    TopologyOk,

    // Broadcast
    Broadcast {
        message: i64,
    },
    BroadcastOk,
    /// Client read (no key) or durable store read (with key).
    Read {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    ReadOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        messages: Option<Vec<i64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<i64>,
    },
    Propagate {
        message: Values,
    },
    PropagateOk,
    ReqFailedMsg,
    ReqFailedMsgOk {
        #[serde(default)]
        messages: Vec<i64>,
    },

    // Counter
    Add {
        delta: i64,
    },
    AddOk,
    PropagateDelta {
        deltas: Vec<DeltaRecord>,
    },
    PropagateDeltaOk,

    // Log
    Send {
        key: String,
        msg: i64,
    },
    SendOk {
        offset: u64,
    },
    Poll {
        offsets: BTreeMap<String, u64>,
    },
    PollOk {
        msgs: BTreeMap<String, Vec<(u64, i64)>>,
    },
    CommitOffsets {
        offsets: BTreeMap<String, u64>,
    },
    CommitOffsetsOk,
    ListCommittedOffsets {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keys: Option<Vec<String>>,
    },
    ListCommittedOffsetsOk {
        offsets: BTreeMap<String, u64>,
    },
    GossipSend {
        batch: Vec<LogRecord>,
    },
    GossipCommitOffset {
        batch: Vec<CommitRecord>,
    },

    // Durable store service
    Write {
        key: String,
        value: i64,
    },
    WriteOk,
    Cas {
        key: String,
        from: i64,
        to: i64,
        #[serde(default)]
        create_if_not_exists: bool,
    },
    CasOk,

    Error {
        code: u32,
        #[serde(default)]
        text: String,
    },
}

impl Payload {
    /// Build an error body from a failure.
    pub fn error(err: &ReplicaError) -> Self {
        Payload::Error {
            code: err.error_code(),
            text: err.to_string(),
        }
    }

    /// Turn an `error` body received from `peer` into an `Err`.
    pub fn into_result(self, peer: &str) -> Result<Payload> {
        match self {
            Payload::Error { code, text } => Err(ReplicaError::Remote {
                peer: peer.to_string(),
                code,
                text,
            }),
            other => Ok(other),
        }
    }

    /// Wire name of this body kind (for logs and metrics).
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Init { .. } => "init",
            Payload::InitOk => "init_ok",
            Payload::Topology { .. } => "topology",
            Payload::TopologyOk => "topology_ok",
            Payload::Broadcast { .. } => "broadcast",
            Payload::BroadcastOk => "broadcast_ok",
            Payload::Read { .. } => "read",
            Payload::ReadOk { .. } => "read_ok",
            Payload::Propagate { .. } => "propagate",
            Payload::PropagateOk => "propagate_ok",
            Payload::ReqFailedMsg => "req_failed_msg",
            Payload::ReqFailedMsgOk { .. } => "req_failed_msg_ok",
            Payload::Add { .. } => "add",
            Payload::AddOk => "add_ok",
            Payload::PropagateDelta { .. } => "propagate_delta",
            Payload::PropagateDeltaOk => "propagate_delta_ok",
            Payload::Send { .. } => "send",
            Payload::SendOk { .. } => "send_ok",
            Payload::Poll { .. } => "poll",
            Payload::PollOk { .. } => "poll_ok",
            Payload::CommitOffsets { .. } => "commit_offsets",
            Payload::CommitOffsetsOk => "commit_offsets_ok",
            Payload::ListCommittedOffsets { .. } => "list_committed_offsets",
            Payload::ListCommittedOffsetsOk { .. } => "list_committed_offsets_ok",
            Payload::GossipSend { .. } => "gossip_send",
            Payload::GossipCommitOffset { .. } => "gossip_commit_offset",
            Payload::Write { .. } => "write",
            Payload::WriteOk => "write_ok",
            Payload::Cas { .. } => "cas",
            Payload::CasOk => "cas_ok",
            Payload::Error { .. } => "error",
        }
    }
}

/// Result of decoding one inbound line.
#[derive(Debug)]
pub enum Inbound {
    /// Fully decoded message.
    Message(Message),
    /// The envelope was readable but the body was not.
    ///
    /// Enough is kept to send an `error` reply to the sender.
    Malformed {
        src: String,
        dest: String,
        msg_id: Option<u64>,
        reason: String,
    },
}

/// Envelope with an untyped body, used to salvage routing info from
/// messages whose body does not decode.
#[derive(Deserialize)]
struct RawMessage {
    src: String,
    dest: String,
    body: serde_json::Value,
}

/// Decode one line from the wire.
///
/// Returns `Err` only when not even the envelope can be read; a bad body
/// yields [`Inbound::Malformed`] so the caller can reject it with a reply.
pub fn decode(line: &str) -> Result<Inbound> {
    let raw: RawMessage = serde_json::from_str(line)?;
    let msg_id = raw.body.get("msg_id").and_then(serde_json::Value::as_u64);

    match serde_json::from_value::<Body>(raw.body) {
        Ok(body) => Ok(Inbound::Message(Message {
            src: raw.src,
            dest: raw.dest,
            body,
        })),
        Err(e) => Ok(Inbound::Malformed {
            src: raw.src,
            dest: raw.dest,
            msg_id,
            reason: e.to_string(),
        }),
    }
}

/// Encode a message as a single wire line (without the trailing newline).
pub fn encode(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}
