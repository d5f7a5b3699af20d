use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::bundle::SubmitterInfo;
use crate::errors::Result;

pub type SessionId = u64;

/// Where a server-side session is in its transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AwaitingSize,
    Receiving,
    /// Bundle decoded and stored; waiting for the operator.
    Complete,
    /// The peer sent a size header that could not be parsed.
    Flagged,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::AwaitingSize => "awaiting size",
            Phase::Receiving => "receiving",
            Phase::Complete => "complete",
            Phase::Flagged => "flagged",
            Phase::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Read-only view of a session handed out by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub peer: String,
    pub phase: Phase,
    pub announced_size: u64,
    pub received_size: u64,
    pub document_name: Option<String>,
    pub submitter: Option<SubmitterInfo>,
    pub stored_at: Option<PathBuf>,
    pub flag_reason: Option<String>,
}

/// Sent by the operator to a session waiting on it. The session task
/// performs the I/O and reports the outcome on the enclosed sender.
#[derive(Debug)]
pub enum Directive {
    Respond(String, oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<Result<()>>),
}

/// Registry record for one accepted connection.
///
/// `waiter` is only present while the connection waits on the operator
/// (`Complete` or `Flagged`). The connection itself always stays with the
/// session task.
pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) peer: String,
    pub(crate) phase: Phase,
    pub(crate) announced_size: u64,
    pub(crate) received_size: u64,
    pub(crate) document_name: Option<String>,
    pub(crate) submitter: Option<SubmitterInfo>,
    pub(crate) stored_at: Option<PathBuf>,
    pub(crate) flag_reason: Option<String>,
    pub(crate) waiter: Option<oneshot::Sender<Directive>>,
}

impl Session {
    pub(crate) fn new(id: SessionId, peer: String) -> Self {
        Self {
            id,
            peer,
            phase: Phase::AwaitingSize,
            announced_size: 0,
            received_size: 0,
            document_name: None,
            submitter: None,
            stored_at: None,
            flag_reason: None,
            waiter: None,
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            peer: self.peer.clone(),
            phase: self.phase,
            announced_size: self.announced_size,
            received_size: self.received_size,
            document_name: self.document_name.clone(),
            submitter: self.submitter.clone(),
            stored_at: self.stored_at.clone(),
            flag_reason: self.flag_reason.clone(),
        }
    }
}
