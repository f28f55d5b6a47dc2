//! Rendezvous server - per-peer signal mailboxes behind a push/pull HTTP surface.
//!
//! Peers never talk to each other here; each peer has a bounded FIFO of
//! envelopes that the owner drains with `GET /pull/{id}` while anyone may
//! append with `POST /push/{id}`. Idle peers are evicted by a watchdog.

use crate::protocol::{self, Signal};
use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Seconds of silence before a peer's mailbox is torn down.
pub const PEER_LIFETIME_TICKS: u32 = 15;

/// Maximum envelopes queued per peer. Enqueue on a full queue drops the
/// envelope; signaling is retryable so loss is the back-pressure.
pub const MAX_QUEUED: usize = 64;

struct PeerQueue {
    signals: VecDeque<Signal>,
    ticks_left: u32,
}

/// Per-peer bounded mailboxes. One watchdog task per live peer counts
/// down `ticks_left` once a second; any enqueue resets it.
pub struct Mailbox {
    peers: Mutex<HashMap<String, PeerQueue>>,
}

impl Mailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Non-blocking dequeue. `None` means nothing pending (or no such peer).
    pub fn get(&self, id: &str) -> Option<Signal> {
        let mut peers = self.peers.lock().expect("mailbox lock poisoned");
        peers.get_mut(id).and_then(|q| q.signals.pop_front())
    }

    /// Enqueue for `id`, creating the mailbox (and its watchdog) on first
    /// use. A full queue drops the envelope silently.
    pub fn set(self: &Arc<Self>, id: &str, signal: Signal) {
        let mut peers = self.peers.lock().expect("mailbox lock poisoned");
        let queue = match peers.get_mut(id) {
            Some(queue) => queue,
            None => {
                peers.insert(
                    id.to_string(),
                    PeerQueue {
                        signals: VecDeque::with_capacity(MAX_QUEUED),
                        ticks_left: PEER_LIFETIME_TICKS,
                    },
                );
                let mailbox = self.clone();
                let watchdog_id = id.to_string();
                tokio::spawn(async move {
                    debug!("watchdog started for {watchdog_id}");
                    mailbox.watchdog(watchdog_id).await;
                });
                peers.get_mut(id).expect("just inserted")
            }
        };
        if queue.signals.len() >= MAX_QUEUED {
            debug!("mailbox full for {id}, dropping {:?}", signal.flag);
            return;
        }
        queue.signals.push_back(signal);
        queue.ticks_left = PEER_LIFETIME_TICKS;
    }

    /// Tear down a peer's mailbox. Pending envelopes are discarded.
    pub fn clean(&self, id: &str) {
        let mut peers = self.peers.lock().expect("mailbox lock poisoned");
        peers.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers
            .lock()
            .expect("mailbox lock poisoned")
            .contains_key(id)
    }

    async fn watchdog(self: Arc<Self>, id: String) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let expired = {
                let mut peers = self.peers.lock().expect("mailbox lock poisoned");
                match peers.get_mut(&id) {
                    Some(queue) => {
                        queue.ticks_left = queue.ticks_left.saturating_sub(1);
                        queue.ticks_left == 0
                    }
                    // Cleaned elsewhere; nothing left to guard.
                    None => return,
                }
            };
            if expired {
                debug!("watchdog expired for {id}");
                self.clean(&id);
                return;
            }
        }
    }
}

async fn pull(Path(self_id): Path<String>, State(mailbox): State<Arc<Mailbox>>) -> Response {
    match mailbox.get(&self_id) {
        Some(signal) => {
            debug!("pull from {self_id}: {:?}", signal.flag);
            match protocol::encode(&signal) {
                Ok(bytes) => {
                    ([(header::CONTENT_TYPE, "application/binary")], bytes).into_response()
                }
                Err(e) => {
                    error!("pull encode failed: {e:#}");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
        None => StatusCode::OK.into_response(),
    }
}

async fn push(
    Path(target_id): Path<String>,
    State(mailbox): State<Arc<Mailbox>>,
    body: Bytes,
) -> StatusCode {
    match protocol::decode::<Signal>(&body) {
        Ok(signal) => {
            debug!(
                "push from {} to {target_id}: {:?}",
                signal.source, signal.flag
            );
            mailbox.set(&target_id, signal);
            StatusCode::OK
        }
        Err(e) => {
            warn!("push decode failed: {e:#}");
            StatusCode::BAD_REQUEST
        }
    }
}

pub fn router(mailbox: Arc<Mailbox>) -> Router {
    Router::new()
        .route("/pull/:self_id", get(pull))
        .route("/push/:target_id", post(push))
        .with_state(mailbox)
}

/// Run the rendezvous server until the process exits.
pub async fn run(port: u16) -> Result<()> {
    let app = router(Mailbox::new());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind rendezvous port {port}"))?;
    info!("rendezvous listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Direction, ServiceCode, SessionId};

    fn candidate(n: i64) -> Signal {
        let id = SessionId::new(n, ServiceCode::Shell, Direction::Outbound);
        Signal::candidate(
            "a",
            "b",
            id,
            crate::protocol::PeerRole::Dialer,
            n.to_le_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn overflow_keeps_the_first_sixty_four() {
        let mailbox = Mailbox::new();
        for n in 0..70 {
            mailbox.set("b", candidate(n));
        }
        for n in 0..64 {
            let signal = mailbox.get("b").expect("queued envelope");
            assert_eq!(signal.id.value, n, "delivery must preserve emission order");
        }
        assert!(mailbox.get("b").is_none(), "envelopes 64..70 were dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_peer_is_evicted_after_lifetime() {
        let mailbox = Mailbox::new();
        mailbox.set("x", candidate(1));
        assert!(mailbox.contains("x"));

        for _ in 0..=PEER_LIFETIME_TICKS {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert!(!mailbox.contains("x"), "mailbox should be gone after 15 idle ticks");
        assert!(mailbox.get("x").is_none());

        // A later enqueue recreates the mailbox from scratch.
        mailbox.set("x", candidate(2));
        assert!(mailbox.contains("x"));
        assert_eq!(mailbox.get("x").unwrap().id.value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_resets_the_idle_counter() {
        let mailbox = Mailbox::new();
        mailbox.set("x", candidate(1));

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        mailbox.set("x", candidate(2));

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert!(mailbox.contains("x"), "reset counter should still have 5 ticks left");

        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert!(!mailbox.contains("x"));
    }

    #[tokio::test]
    async fn http_push_pull_round_trip() {
        let mailbox = Mailbox::new();
        let app = router(mailbox);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let base = format!("http://{addr}");

        // Nothing queued: empty 200.
        let resp = client.get(format!("{base}/pull/b")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.bytes().await.unwrap().is_empty());

        // Push one envelope, pull it back.
        let signal = candidate(42);
        let body = protocol::encode(&signal).unwrap();
        let resp = client
            .post(format!("{base}/push/b"))
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client.get(format!("{base}/pull/b")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/binary"
        );
        let bytes = resp.bytes().await.unwrap();
        let back: Signal = protocol::decode(&bytes).unwrap();
        assert_eq!(back, signal);

        // Garbage body: 400, and the peer's queue is undisturbed.
        let resp = client
            .post(format!("{base}/push/b"))
            .body(vec![0xde, 0xad])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }
}
