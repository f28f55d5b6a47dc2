//! Session pool - registry of live service sessions keyed by the
//! composite (value, service) pair identity.

use crate::protocol::{Direction, ServiceCode, SessionId, SessionInfo, Signal};
use crate::transport::ByteStream;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handshake progress for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    LocalOffered,
    RemoteOffered,
    Answered,
    Connecting,
    Open,
    Closed,
}

/// One live session. Owned exclusively by the pool; the transport and
/// binding are borrowed from it, and the splicer takes the stream for
/// the duration of the pump.
pub struct Session {
    pub id: SessionId,
    /// Peer id of the other end.
    pub remote: String,
    state: RwLock<HandshakeState>,
    /// Handshake mailbox: the signaling loop delivers answer/candidate
    /// envelopes here; the transport task drains them.
    signal_tx: mpsc::UnboundedSender<Signal>,
    stream: Mutex<Option<ByteStream>>,
    attached: AtomicBool,
    /// Cancelled on dispose; the splicer and transport tasks watch it.
    pub cancel: CancellationToken,
}

impl Session {
    fn new(id: SessionId, remote: String) -> (Arc<Self>, mpsc::UnboundedReceiver<Signal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            remote,
            state: RwLock::new(HandshakeState::Idle),
            signal_tx,
            stream: Mutex::new(None),
            attached: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        (session, signal_rx)
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.read().expect("state lock poisoned")
    }

    pub fn set_state(&self, state: HandshakeState) {
        debug!("{}: {:?} -> {state:?}", self.pair_id(), self.state());
        *self.state.write().expect("state lock poisoned") = state;
    }

    /// Route a handshake envelope to the transport task. Returns false
    /// once the handshake side has gone away.
    pub fn deliver(&self, signal: Signal) -> bool {
        self.signal_tx.send(signal).is_ok()
    }

    pub fn put_stream(&self, stream: ByteStream) {
        *self.stream.lock().expect("stream lock poisoned") = Some(stream);
    }

    pub fn take_stream(&self) -> Option<ByteStream> {
        self.stream.lock().expect("stream lock poisoned").take()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.lock().expect("stream lock poisoned").is_some()
    }

    /// Claim the single client-socket slot. At most one caller wins.
    pub fn mark_attached(&self) -> bool {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn pair_id(&self) -> String {
        self.id.pair_id()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            pair_id: self.pair_id(),
            remote: self.remote.clone(),
            service: self.id.service,
            direction: self.id.direction,
            state: format!("{:?}", self.state()),
            attached: self.is_attached(),
        }
    }
}

/// The pool. Dialer and responder converge on one record per
/// (value, service): the dialer's value is authoritative and inbound
/// adoption refuses to shadow an existing record.
pub struct SessionPool {
    sessions: DashMap<(i64, ServiceCode), Arc<Session>>,
    last_value: AtomicI64,
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            last_value: AtomicI64::new(0),
        }
    }

    /// Strictly increasing id values; nanosecond timestamps with a +1
    /// fallback when two allocations land on the same tick.
    fn next_value(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let mut last = self.last_value.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self.last_value.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(previous) => last = previous,
            }
        }
    }

    /// Allocate a fresh outbound session toward `remote`.
    pub fn create_outbound(
        &self,
        service: ServiceCode,
        remote: &str,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<Signal>) {
        let id = SessionId::new(self.next_value(), service, Direction::Outbound);
        let (session, signal_rx) = Session::new(id, remote.to_string());
        self.sessions.insert(id.pair_key(), session.clone());
        (session, signal_rx)
    }

    /// Mirror an inbound offer into a session record. Returns `None`
    /// when a record for the pair already exists, so a racing offer and
    /// local bring-up never produce two records.
    pub fn adopt_inbound(
        &self,
        offered: SessionId,
        remote: &str,
    ) -> Option<(Arc<Session>, mpsc::UnboundedReceiver<Signal>)> {
        let id = SessionId::new(offered.value, offered.service, Direction::Inbound);
        match self.sessions.entry(id.pair_key()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (session, signal_rx) = Session::new(id, remote.to_string());
                entry.insert(session.clone());
                Some((session, signal_rx))
            }
        }
    }

    pub fn lookup(&self, key: (i64, ServiceCode)) -> Option<Arc<Session>> {
        self.sessions.get(&key).map(|entry| entry.value().clone())
    }

    pub fn lookup_pair(&self, pair_id: &str) -> Option<Arc<Session>> {
        let id = SessionId::parse(pair_id).ok()?;
        self.lookup(id.pair_key())
    }

    /// Terminal transition: cancel the session's tasks, drop its stream,
    /// remove the record. Unknown keys are a no-op.
    pub fn dispose(&self, key: (i64, ServiceCode)) -> bool {
        match self.sessions.remove(&key) {
            Some((_, session)) => {
                session.set_state(HandshakeState::Closed);
                session.cancel.cancel();
                drop(session.take_stream());
                debug!("disposed {}", session.pair_id());
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_strictly_increasing() {
        let pool = SessionPool::new();
        let mut previous = 0;
        for _ in 0..1000 {
            let value = pool.next_value();
            assert!(value > previous);
            previous = value;
        }
    }

    #[test]
    fn create_lookup_dispose() {
        let pool = SessionPool::new();
        let (session, _rx) = pool.create_outbound(ServiceCode::Shell, "peer-b");
        let key = session.id.pair_key();

        assert_eq!(pool.len(), 1);
        assert!(pool.lookup(key).is_some());
        assert!(pool.lookup_pair(&session.pair_id()).is_some());

        assert!(pool.dispose(key));
        assert!(pool.is_empty());
        assert_eq!(session.state(), HandshakeState::Closed);
        assert!(session.cancel.is_cancelled());

        // Disposing again is a no-op.
        assert!(!pool.dispose(key));
    }

    #[test]
    fn inbound_offer_converges_with_existing_record() {
        let pool = SessionPool::new();
        let (session, _rx) = pool.create_outbound(ServiceCode::Shell, "peer-b");

        // A racing offer for the same (value, service) must not shadow.
        assert!(pool.adopt_inbound(session.id, "peer-b").is_none());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn adopt_mirrors_the_dialer_id() {
        let pool = SessionPool::new();
        let offered = SessionId::new(4242, ServiceCode::Message, Direction::Outbound);
        let (session, _rx) = pool.adopt_inbound(offered, "peer-a").unwrap();

        assert_eq!(session.id.value, 4242);
        assert_eq!(session.id.direction, Direction::Inbound);
        assert_eq!(session.id.pair_key(), offered.pair_key());

        // Duplicate offers converge too.
        assert!(pool.adopt_inbound(offered, "peer-a").is_none());
    }

    #[test]
    fn attach_slot_is_single_use() {
        let pool = SessionPool::new();
        let (session, _rx) = pool.create_outbound(ServiceCode::Shell, "peer-b");
        assert!(session.mark_attached());
        assert!(!session.mark_attached());
        assert!(session.is_attached());
    }

    #[tokio::test]
    async fn deliver_feeds_the_handshake_mailbox() {
        let pool = SessionPool::new();
        let (session, mut rx) = pool.create_outbound(ServiceCode::Shell, "peer-b");
        let signal = Signal::answer("peer-b", "peer-a", session.id.mirrored(), "sdp".into());

        assert!(session.deliver(signal.clone()));
        assert_eq!(rx.recv().await.unwrap(), signal);

        drop(rx);
        assert!(!session.deliver(signal));
    }
}
