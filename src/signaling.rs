//! Signaling loop - the daemon's lifeline to the rendezvous server.
//!
//! One pull loop drains this node's mailbox and dispatches envelopes to
//! the daemon; one push loop delivers locally emitted envelopes with
//! retry. Rendezvous trouble is never fatal, only backed off.

use crate::config::ConfigView;
use crate::daemon::Daemon;
use crate::protocol::{self, Signal};
use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-request deadline on the pull; keeps shutdown responsive.
const PULL_TIMEOUT: Duration = Duration::from_secs(1);

const BACKOFF_FLOOR: Duration = Duration::from_millis(100);
const BACKOFF_CEIL: Duration = Duration::from_secs(1);
const PUSH_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct Signaler {
    config: ConfigView,
    http: reqwest::Client,
}

impl Signaler {
    pub fn new(config: ConfigView) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Run both halves until the token fires.
    pub async fn run(
        self,
        daemon: Arc<Daemon>,
        outbound: mpsc::UnboundedReceiver<Signal>,
        cancel: CancellationToken,
    ) {
        let pusher = self.clone();
        let push_cancel = cancel.clone();
        tokio::spawn(async move {
            pusher.push_loop(outbound, push_cancel).await;
        });
        self.pull_loop(daemon, cancel).await;
    }

    async fn pull_loop(&self, daemon: Arc<Daemon>, cancel: CancellationToken) {
        let mut backoff = BACKOFF_FLOOR;
        loop {
            let url = {
                let config = self.config.snapshot();
                format!(
                    "{}/pull/{}",
                    config.rendezvous_url.trim_end_matches('/'),
                    config.id
                )
            };
            let pulled = tokio::select! {
                _ = cancel.cancelled() => break,
                pulled = self.pull_once(&url) => pulled,
            };
            match pulled {
                Ok(Some(signal)) => {
                    backoff = BACKOFF_FLOOR;
                    daemon.dispatch(signal);
                }
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_CEIL);
                }
                Err(e) => {
                    debug!("rendezvous pull failed: {e:#}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_CEIL);
                }
            }
        }
    }

    /// One non-blocking dequeue. Empty body means nothing pending. A
    /// body that fails to decode is dropped without disturbing the peer.
    async fn pull_once(&self, url: &str) -> Result<Option<Signal>> {
        let response = self.http.get(url).timeout(PULL_TIMEOUT).send().await?;
        if !response.status().is_success() {
            bail!("pull returned {}", response.status());
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        match protocol::decode(&body) {
            Ok(signal) => Ok(Some(signal)),
            Err(e) => {
                warn!("dropping undecodable envelope: {e:#}");
                Ok(None)
            }
        }
    }

    async fn push_loop(&self, mut outbound: mpsc::UnboundedReceiver<Signal>, cancel: CancellationToken) {
        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                signal = outbound.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };
            self.push_with_retry(signal, &cancel).await;
        }
    }

    async fn push_with_retry(&self, signal: Signal, cancel: &CancellationToken) {
        let mut delay = BACKOFF_FLOOR;
        for _ in 0..PUSH_ATTEMPTS {
            match self.push_once(&signal).await {
                Ok(()) => return,
                Err(e) => {
                    debug!(
                        "push of {:?} to {} failed: {e:#}",
                        signal.flag, signal.target
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(BACKOFF_CEIL);
                }
            }
        }
        // Signaling is retryable end to end; the handshake timeout owns
        // the failure if this mattered.
        warn!(
            "dropping {:?} for {} after {PUSH_ATTEMPTS} attempts",
            signal.flag, signal.target
        );
    }

    async fn push_once(&self, signal: &Signal) -> Result<()> {
        let config = self.config.snapshot();
        let url = format!(
            "{}/push/{}",
            config.rendezvous_url.trim_end_matches('/'),
            signal.target
        );
        let body = protocol::encode(signal)?;
        let response = self.http.post(url).body(body).send().await?;
        if !response.status().is_success() {
            bail!("push returned {}", response.status());
        }
        Ok(())
    }
}
