//! Status reporting from the operator process.
//!
//! Every state change of a session is turned into a [`ServerEvent`] and
//! delivered to the registered [`ServerSubscriber`]s, which render them as
//! status lines.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::bundle::SubmitterInfo;
use crate::session::SessionId;

/// Observer of server activity.
///
/// Implementors must be thread-safe since notifications come from session
/// tasks.
pub trait ServerSubscriber: Send + Sync {
    /// A stable unique identifier for this subscriber (used as a map key).
    fn get_id(&self) -> String;

    /// Free-form diagnostic lines.
    fn log(&self, message: String);

    fn notify(&self, event: ServerEvent);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Listening {
        addr: String,
    },
    Connected {
        id: SessionId,
        peer: String,
    },
    Announced {
        id: SessionId,
        size: u64,
    },
    Progress {
        id: SessionId,
        received: u64,
        announced: u64,
    },
    Completed {
        id: SessionId,
        document_name: String,
        submitter: SubmitterInfo,
        stored_at: PathBuf,
        size: u64,
    },
    Flagged {
        id: SessionId,
        reason: String,
    },
    Disconnected {
        id: SessionId,
    },
    Failed {
        id: SessionId,
        error: String,
    },
    Responded {
        id: SessionId,
        bytes: usize,
    },
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEvent::Listening { addr } => {
                write!(f, "Waiting for connections on {addr}...")
            }
            ServerEvent::Connected { id, peer } => {
                write!(f, "User #{id} connected from {peer}. Waiting for data...")
            }
            ServerEvent::Announced { id, size } => {
                write!(f, "User #{id} is sending {size} bytes.")
            }
            ServerEvent::Progress {
                id,
                received,
                announced,
            } => write!(f, "User #{id}: {received}/{announced} bytes"),
            ServerEvent::Completed {
                id,
                document_name,
                submitter,
                stored_at,
                size,
            } => write!(
                f,
                "Data of user #{id} received ({size} bytes).\n\
                 Full name: {}\n\
                 Organization: {}\n\
                 Phone: {}\n\
                 Document {document_name} saved to {}.\n\
                 Create a login and password and send them to the user...",
                submitter.full_name,
                submitter.organization,
                submitter.phone,
                stored_at.display()
            ),
            ServerEvent::Flagged { id, reason } => {
                write!(f, "User #{id} sent invalid data: {reason}")
            }
            ServerEvent::Disconnected { id } => {
                write!(f, "User #{id} disconnected.")
            }
            ServerEvent::Failed { id, error } => {
                write!(f, "Connection with user #{id} lost: {error}")
            }
            ServerEvent::Responded { id, bytes } => write!(
                f,
                "Credentials sent to user #{id} ({bytes} bytes). User disconnected."
            ),
        }
    }
}
