//! Submitter side: one connection, one bundle, one response.

use std::fmt;
use std::future::Future;

use log::{debug, info};
use tokio::net::TcpStream;

use crate::bundle::{self, Bundle};
use crate::channel::{FramedChannel, DISCONNECT_SENTINEL};
use crate::config::ClientConfig;
use crate::errors::{RegError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitterState {
    Idle,
    Connecting,
    Connected,
    SendingSize,
    SendingBundle,
    AwaitingResponse,
    ResponseReceived,
    RemotelyDisconnected,
    Closed,
}

impl fmt::Display for SubmitterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Drives connect, announce, send, await response and close against one
/// operator.
pub struct SubmitterSession {
    config: ClientConfig,
    state: SubmitterState,
    channel: Option<FramedChannel<TcpStream>>,
}

impl SubmitterSession {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: SubmitterState::Idle,
            channel: None,
        }
    }

    pub fn state(&self) -> SubmitterState {
        self.state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn transition(&mut self, next: SubmitterState) {
        debug!("submitter {} -> {}", self.state, next);
        self.state = next;
    }

    /// Opens the connection. Failures are reported as `ConnectFailed` and
    /// are not retried.
    pub async fn connect(&mut self) -> Result<()> {
        if !matches!(self.state, SubmitterState::Idle | SubmitterState::Closed)
        {
            return Err(RegError::ConnectionError(format!(
                "cannot connect while {}",
                self.state
            )));
        }
        self.config.validate()?;
        self.transition(SubmitterState::Connecting);

        let addr = self.config.server_addr.clone();
        let connecting = TcpStream::connect(addr.as_str());
        let connected = match self.config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| "timed out".to_owned())
                .and_then(|result| result.map_err(|e| e.to_string())),
            None => connecting.await.map_err(|e| e.to_string()),
        };

        match connected {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("could not disable Nagle: {e}");
                }
                info!("connected to {addr}");
                self.channel = Some(FramedChannel::new(
                    stream,
                    self.config.channel_options(),
                ));
                self.transition(SubmitterState::Connected);
                Ok(())
            }
            Err(reason) => {
                self.transition(SubmitterState::Closed);
                Err(RegError::ConnectFailed(addr, reason))
            }
        }
    }

    fn channel(&mut self) -> Result<&mut FramedChannel<TcpStream>> {
        self.channel.as_mut().ok_or_else(|| {
            RegError::ConnectionError("not connected".to_owned())
        })
    }

    /// Sends `bundle` and waits for the operator's answer.
    ///
    /// The connection is closed afterwards whatever the outcome.
    pub async fn submit(&mut self, bundle: &Bundle) -> Result<String> {
        if self.state != SubmitterState::Connected {
            return Err(RegError::ConnectionError(format!(
                "cannot submit while {}",
                self.state
            )));
        }
        let result = self.exchange(bundle).await;
        self.close().await;
        result
    }

    /// Like [`submit`](Self::submit), but withdraws as soon as `withdraw`
    /// completes. Returns `None` when withdrawn.
    ///
    /// While waiting for the answer the operator is sent the disconnect
    /// sentinel. A withdrawal in the middle of the upload only drops the
    /// connection, which the operator sees as a truncated transfer.
    pub async fn submit_until<F>(
        &mut self,
        bundle: &Bundle,
        withdraw: F,
    ) -> Result<Option<String>>
    where
        F: Future<Output = ()>,
    {
        if self.state != SubmitterState::Connected {
            return Err(RegError::ConnectionError(format!(
                "cannot submit while {}",
                self.state
            )));
        }
        tokio::pin!(withdraw);
        let exchanged = tokio::select! {
            result = self.exchange(bundle) => Some(result),
            _ = &mut withdraw => None,
        };

        match exchanged {
            Some(result) => {
                self.close().await;
                result.map(Some)
            }
            None if self.state == SubmitterState::AwaitingResponse => {
                info!("withdrawing while waiting for the operator");
                self.disconnect().await.map(|_| None)
            }
            None => {
                info!("withdrawing during {}", self.state);
                self.close().await;
                Ok(None)
            }
        }
    }

    async fn exchange(&mut self, bundle: &Bundle) -> Result<String> {
        let encoded = bundle::encode(bundle)?;
        info!("sending bundle of {} bytes", encoded.len());

        self.transition(SubmitterState::SendingSize);
        self.channel()?.announce_size(encoded.len()).await?;

        self.transition(SubmitterState::SendingBundle);
        self.channel()?.send(&encoded).await?;

        self.transition(SubmitterState::AwaitingResponse);
        let max = self.config.max_response_size;
        let response = self.channel()?.receive_to_end(max).await?;

        if response.is_empty() || response == DISCONNECT_SENTINEL.as_bytes() {
            self.transition(SubmitterState::RemotelyDisconnected);
            return Err(RegError::ConnectionError(
                "operator closed the connection without a response"
                    .to_owned(),
            ));
        }

        let text = String::from_utf8(response).map_err(|_| {
            RegError::ConnectionError("response is not valid UTF-8".to_owned())
        })?;
        self.transition(SubmitterState::ResponseReceived);
        Ok(text)
    }

    /// Withdraws from the exchange: the operator is sent the disconnect
    /// sentinel and the connection is closed. Does nothing if not
    /// connected.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.channel.is_none() {
            self.transition(SubmitterState::Closed);
            return Ok(());
        }
        let sent = self.channel()?.send_disconnect().await;
        self.close().await;
        sent
    }

    async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.transition(SubmitterState::Closed);
    }
}

/// Connects, submits `bundle` and returns the operator's response.
pub async fn submit(config: ClientConfig, bundle: &Bundle) -> Result<String> {
    let mut session = SubmitterSession::new(config);
    session.connect().await?;
    session.submit(bundle).await
}
