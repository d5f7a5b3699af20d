//! Identity-document submission over a private network.
//!
//! A submitter connects to the operator, announces the size of an encoded
//! [`Bundle`] (document plus contact details) and sends it. The operator's
//! process tracks every connection in a [`SessionRegistry`], stores each
//! received document under a per-session directory and lets the operator
//! answer any completed session with issued credentials.
//!
//! ```no_run
//! use regmaster::{ClientConfig, Bundle, SubmitterInfo};
//! # async fn demo() -> regmaster::Result<()> {
//! let bundle = Bundle::from_path(
//!     "/path/id.jpg",
//!     SubmitterInfo::new("Jane Doe", "Tech U", "555-0100"),
//! )?;
//! let response =
//!     regmaster::client::submit(ClientConfig::new("10.0.0.5:55000"), &bundle)
//!         .await?;
//! println!("{response}");
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod channel;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

pub use bundle::{Bundle, SubmitterInfo};
pub use channel::{
    Announcement, ChannelOptions, FramedChannel, Transfer,
    DEFAULT_CHUNK_SIZE, DISCONNECT_SENTINEL,
};
pub use client::{SubmitterSession, SubmitterState};
pub use config::{AcceptPolicy, ClientConfig, ServerConfig, DEFAULT_PORT};
pub use errors::{RegError, Result};
pub use events::{ServerEvent, ServerSubscriber};
pub use registry::SessionRegistry;
pub use server::{Credentials, OperatorHandle, Server};
pub use session::{Phase, SessionId, SessionSnapshot};
pub use storage::DocumentStore;
