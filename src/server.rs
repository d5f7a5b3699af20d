//! Operator side: accept loop, per-connection receive tasks and the
//! operations the operator drives through an [`OperatorHandle`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, info, trace, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

use crate::bundle::{self, Bundle};
use crate::channel::{Announcement, FramedChannel, Transfer};
use crate::config::{AcceptPolicy, ServerConfig};
use crate::errors::{RegError, Result};
use crate::events::{ServerEvent, ServerSubscriber};
use crate::registry::SessionRegistry;
use crate::session::{Directive, SessionId, SessionSnapshot};
use crate::storage::DocumentStore;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Login and password issued to a submitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let credentials = Self {
            login: login.into(),
            password: password.into(),
        };
        if credentials.login.is_empty() || credentials.password.is_empty() {
            return Err(RegError::Other(anyhow!(
                "both login and password are required"
            )));
        }
        Ok(credentials)
    }

    /// Text sent back to the submitter.
    pub fn message(&self) -> String {
        format!(
            "\nThe administrator has verified your information.\
             \nYour credentials are below.\
             \n\n----------\nLogin: {}\nPassword: {}\n----------",
            self.login, self.password
        )
    }
}

struct Shared {
    config: ServerConfig,
    registry: SessionRegistry,
    store: DocumentStore,
    subscribers: RwLock<HashMap<String, Arc<dyn ServerSubscriber>>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn notify(&self, event: ServerEvent) {
        match &event {
            ServerEvent::Progress { .. } => trace!("{event}"),
            ServerEvent::Failed { .. } | ServerEvent::Flagged { .. } => {
                warn!("{event}")
            }
            _ => info!("{event}"),
        }
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .for_each(|subscriber| subscriber.notify(event.clone()));
    }

    fn log(&self, message: String) {
        debug!("{message}");
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .for_each(|subscriber| subscriber.log(message.clone()));
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Handle the operator uses to inspect and answer sessions. Cheap to clone.
#[derive(Clone)]
pub struct OperatorHandle {
    shared: Arc<Shared>,
}

impl OperatorHandle {
    /// Open sessions in arrival order.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.shared.registry.list()
    }

    pub fn get(&self, id: SessionId) -> Option<SessionSnapshot> {
        self.shared.registry.get(id)
    }

    /// Sends `payload` to a fully received session, then closes and removes
    /// it.
    pub async fn respond(&self, id: SessionId, payload: &str) -> Result<()> {
        let (_, waiter) = self.shared.registry.take_for_response(id)?;
        let sent = deliver(id, waiter, |done| {
            Directive::Respond(payload.to_owned(), done)
        })
        .await;
        match sent {
            Ok(()) => {
                self.shared.notify(ServerEvent::Responded {
                    id,
                    bytes: payload.len(),
                });
                Ok(())
            }
            Err(e) => {
                self.shared.notify(ServerEvent::Failed {
                    id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub async fn issue_credentials(
        &self,
        id: SessionId,
        credentials: &Credentials,
    ) -> Result<()> {
        self.respond(id, &credentials.message()).await
    }

    /// Tells a session waiting on the operator that no answer will come,
    /// then closes and removes it.
    pub async fn disconnect(&self, id: SessionId) -> Result<()> {
        let (_, waiter) = self.shared.registry.take_for_disconnect(id)?;
        if let Err(e) = deliver(id, waiter, Directive::Disconnect).await {
            debug!("session {id} was already gone: {e}");
        }
        self.shared.notify(ServerEvent::Disconnected { id });
        Ok(())
    }

    /// Stops the accept loop and closes every open session. Each one is
    /// sent the disconnect sentinel first.
    pub async fn shutdown(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }
        self.shared.log("shutting down".to_owned());
        for (id, waiter) in self.shared.registry.drain() {
            if let Some(waiter) = waiter {
                if let Err(e) = deliver(id, waiter, Directive::Disconnect).await
                {
                    debug!("session {id} was already gone: {e}");
                }
            }
            self.shared.notify(ServerEvent::Disconnected { id });
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Registers a new subscriber or replaces one with the same id.
    pub fn subscribe(&self, subscriber: Arc<dyn ServerSubscriber>) {
        let subscriber_id = subscriber.get_id();
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscriber_id.clone(), subscriber);
        self.shared
            .log(format!("subscriber {subscriber_id} registered"));
    }

    pub fn unsubscribe(&self, subscriber_id: &str) {
        let removed = self
            .shared
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscriber_id);
        if removed.is_some() {
            self.shared
                .log(format!("subscriber {subscriber_id} removed"));
        }
    }
}

/// Hands `directive` to the task of session `id` and waits for the outcome.
async fn deliver<F>(
    id: SessionId,
    waiter: oneshot::Sender<Directive>,
    directive: F,
) -> Result<()>
where
    F: FnOnce(oneshot::Sender<Result<()>>) -> Directive,
{
    let lost = || {
        RegError::ConnectionError(format!("session {id} lost its connection"))
    };
    let (done, outcome) = oneshot::channel();
    waiter.send(directive(done)).map_err(|_| lost())?;
    outcome.await.map_err(|_| lost())?
}

pub struct Server {
    listener: TcpListener,
    handle: OperatorHandle,
}

impl Server {
    /// Clears the document store and binds the listening socket. Failing
    /// here is fatal to startup.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let store = DocumentStore::new(&config.docs_dir);
        store.reset()?;

        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("listening on {}", listener.local_addr()?);

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            registry: SessionRegistry::new(),
            store,
            subscribers: RwLock::new(HashMap::new()),
            shutdown,
        });
        Ok(Self {
            listener,
            handle: OperatorHandle { shared },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> OperatorHandle {
        self.handle.clone()
    }

    /// Admits connections until [`OperatorHandle::shutdown`] is called.
    ///
    /// With [`AcceptPolicy::AwaitRegistration`] the next connection is
    /// accepted only after the previous one is in the registry. Transfers
    /// themselves never hold up the loop.
    pub async fn run(self) -> Result<()> {
        let shared = self.handle.shared;
        let mut shutdown = shared.shutdown.subscribe();
        shared.notify(ServerEvent::Listening {
            addr: self.listener.local_addr()?.to_string(),
        });

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            let (registered_tx, registered_rx) = oneshot::channel();
            tokio::spawn(run_session(
                shared.clone(),
                stream,
                peer,
                registered_tx,
            ));
            if shared.config.accept_policy == AcceptPolicy::AwaitRegistration
            {
                let _ = registered_rx.await;
            }
        }

        info!("accept loop stopped");
        Ok(())
    }
}

enum Outcome {
    Disconnected,
    Received(Bundle),
    Flagged(String),
    Shutdown,
    Failed(RegError),
}

async fn run_session(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    registered: oneshot::Sender<SessionId>,
) {
    let id = shared.registry.register(peer.to_string());
    let _ = registered.send(id);
    shared.notify(ServerEvent::Connected {
        id,
        peer: peer.to_string(),
    });

    let mut channel =
        FramedChannel::new(stream, shared.config.channel_options());
    let mut shutdown = shared.shutdown.subscribe();
    let stopping = *shutdown.borrow();
    let outcome = if stopping {
        Outcome::Shutdown
    } else {
        tokio::select! {
            received = receive_bundle(&shared, id, &mut channel) => {
                received.unwrap_or_else(Outcome::Failed)
            }
            _ = shutdown.changed() => Outcome::Shutdown,
        }
    };

    match outcome {
        Outcome::Disconnected => {
            shared.registry.remove(id);
            channel.close().await;
            shared.notify(ServerEvent::Disconnected { id });
        }
        Outcome::Received(bundle) => {
            complete_session(&shared, id, bundle, channel).await
        }
        Outcome::Flagged(raw) => {
            let reason = format!("invalid size header {raw:?}");
            let (waiter, directives) = oneshot::channel();
            match shared.registry.flag(id, reason.clone(), waiter) {
                Ok(()) => {
                    shared.notify(ServerEvent::Flagged { id, reason });
                    await_operator(&shared, id, channel, directives).await
                }
                Err(_) => farewell(id, channel).await,
            }
        }
        Outcome::Shutdown => {
            farewell(id, channel).await;
            shared.registry.remove(id);
        }
        Outcome::Failed(e) => {
            shared.registry.remove(id);
            channel.close().await;
            shared.notify(ServerEvent::Failed {
                id,
                error: e.to_string(),
            });
        }
    }
}

/// Reads the announcement and, unless it is the sentinel or invalid, the
/// whole payload.
async fn receive_bundle(
    shared: &Shared,
    id: SessionId,
    channel: &mut FramedChannel<TcpStream>,
) -> Result<Outcome> {
    let (announced, prefix) = match channel.read_announcement().await {
        Ok(Announcement::Disconnect) => return Ok(Outcome::Disconnected),
        Ok(Announcement::Size { announced, prefix }) => (announced, prefix),
        Err(RegError::InvalidSizeHeader(raw)) => {
            return Ok(Outcome::Flagged(raw))
        }
        Err(e) => return Err(e),
    };

    shared.registry.set_announced(id, announced);
    shared.notify(ServerEvent::Announced {
        id,
        size: announced,
    });

    let mut transfer = Transfer::new(announced);
    if !prefix.is_empty() {
        transfer.accept(&prefix)?;
        shared.registry.set_received(id, transfer.received());
    }
    channel
        .receive_payload(&mut transfer, |received| {
            shared.registry.set_received(id, received);
            shared.notify(ServerEvent::Progress {
                id,
                received,
                announced,
            });
        })
        .await?;

    if !transfer.is_complete() {
        return Err(RegError::MalformedBundle("empty bundle".to_owned()));
    }
    let bundle = bundle::decode(&transfer.into_bytes())?;
    Ok(Outcome::Received(bundle))
}

async fn complete_session(
    shared: &Shared,
    id: SessionId,
    bundle: Bundle,
    mut channel: FramedChannel<TcpStream>,
) {
    let size = bundle.encoded_len() as u64;
    let (document, document_name, submitter) = bundle.into_parts();

    let store = shared.store.clone();
    let name = document_name.clone();
    let stored = tokio::task::spawn_blocking(move || {
        store.persist(id, &name, &document)
    })
    .await
    .map_err(|e| RegError::Other(anyhow!(e)))
    .and_then(|stored| stored);

    let stored_at = match stored {
        Ok(path) => path,
        Err(e) => {
            shared.registry.remove(id);
            channel.close().await;
            shared.notify(ServerEvent::Failed {
                id,
                error: format!("could not store document: {e}"),
            });
            return;
        }
    };

    let (waiter, directives) = oneshot::channel();
    match shared.registry.mark_complete(
        id,
        document_name.clone(),
        submitter.clone(),
        stored_at.clone(),
        waiter,
    ) {
        Ok(()) => {
            shared.notify(ServerEvent::Completed {
                id,
                document_name,
                submitter,
                stored_at,
                size,
            });
            await_operator(shared, id, channel, directives).await
        }
        // removed by a shutdown while the document was being stored
        Err(_) => farewell(id, channel).await,
    }
}

enum Wake {
    Directive(Directive),
    Abandoned,
    PeerExit(Result<()>),
}

/// Holds a session that waits on the operator until a directive arrives
/// or the peer goes away.
async fn await_operator(
    shared: &Shared,
    id: SessionId,
    mut channel: FramedChannel<TcpStream>,
    mut directives: oneshot::Receiver<Directive>,
) {
    let wake = tokio::select! {
        directive = &mut directives => match directive {
            Ok(directive) => Wake::Directive(directive),
            Err(_) => Wake::Abandoned,
        },
        exit = channel.await_peer_exit() => Wake::PeerExit(exit),
    };

    let (done, sent) = match wake {
        Wake::Directive(Directive::Respond(payload, done)) => {
            (done, channel.send(payload.as_bytes()).await)
        }
        Wake::Directive(Directive::Disconnect(done)) => {
            (done, channel.send_disconnect().await)
        }
        Wake::Abandoned => return farewell(id, channel).await,
        Wake::PeerExit(exit) => {
            channel.close().await;
            // a missing entry means the operator already took the session
            if shared.registry.remove(id).is_some() {
                shared.notify(match exit {
                    Ok(()) => ServerEvent::Disconnected { id },
                    Err(e) => ServerEvent::Failed {
                        id,
                        error: e.to_string(),
                    },
                });
            }
            return;
        }
    };
    channel.close().await;
    if done.send(sent).is_err() {
        debug!("operator stopped waiting on session {id}");
    }
}

/// Sends the disconnect sentinel and closes.
async fn farewell(id: SessionId, mut channel: FramedChannel<TcpStream>) {
    if let Err(e) = channel.send_disconnect().await {
        debug!("session {id} was already gone: {e}");
    }
    channel.close().await;
}
