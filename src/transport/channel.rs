//! Peer data channel transport - offer/answer handshake with trickled
//! candidates, yielding one ordered, reliable byte stream per session.
//!
//! Envelope exchange goes through the signaling loop; this module only
//! produces and consumes `Signal`s. The data channel is detached once
//! open so the splicer sees a plain stream.

use crate::config::Config;
use crate::protocol::{PeerRole, Signal, SignalFlag};
use crate::session::{HandshakeState, Session};
use crate::transport::ByteStream;
use anyhow::{anyhow, bail, Context, Result};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data::data_channel::{DataChannel, PollDataChannel};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Wall-clock budget from offer emission to channel open.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

const CHANNEL_LABEL: &str = "data";

type OpenSlot = Arc<Mutex<Option<oneshot::Sender<Arc<DataChannel>>>>>;

fn build_api() -> Result<API> {
    let mut media = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut media)
        .context("interceptor registry failed")?;
    let mut setting = SettingEngine::default();
    setting.detach_data_channels();
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting)
        .build())
}

fn rtc_config(config: &Config) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|entry| RTCIceServer {
                urls: entry.urls.clone(),
                username: entry.username.clone(),
                credential: entry.credential.clone(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// Emit every locally gathered candidate as a signaling envelope.
fn trickle_candidates(
    pc: &Arc<RTCPeerConnection>,
    outbound: &mpsc::UnboundedSender<Signal>,
    local_id: &str,
    session: &Arc<Session>,
    role: PeerRole,
) {
    let outbound = outbound.clone();
    let source = local_id.to_string();
    let target = session.remote.clone();
    let id = session.id;
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let outbound = outbound.clone();
        let source = source.clone();
        let target = target.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    warn!("candidate serialization failed: {e}");
                    return;
                }
            };
            match serde_json::to_vec(&init) {
                Ok(bytes) => {
                    let _ = outbound.send(Signal::candidate(&source, &target, id, role, bytes));
                }
                Err(e) => warn!("candidate encode failed: {e}"),
            }
        })
    }));
}

/// Detach the channel the moment it opens and hand it to the waiter.
fn forward_on_open(dc: &Arc<RTCDataChannel>, slot: OpenSlot) {
    let dc_handle = dc.clone();
    dc.on_open(Box::new(move || {
        let dc_handle = dc_handle.clone();
        let slot = slot.clone();
        Box::pin(async move {
            match dc_handle.detach().await {
                Ok(raw) => {
                    if let Some(tx) = slot.lock().expect("open slot poisoned").take() {
                        let _ = tx.send(raw);
                    }
                }
                Err(e) => warn!("data channel detach failed: {e}"),
            }
        })
    }));
}

async fn apply_candidate(pc: &Arc<RTCPeerConnection>, signal: &Signal) {
    if signal.candidate.is_empty() {
        return;
    }
    let init: RTCIceCandidateInit = match serde_json::from_slice(&signal.candidate) {
        Ok(init) => init,
        Err(e) => {
            warn!("bad candidate payload for {}: {e}", signal.id.pair_id());
            return;
        }
    };
    // Candidates are additive; a failing one must not kill the handshake.
    if let Err(e) = pc.add_ice_candidate(init).await {
        warn!("candidate rejected for {}: {e}", signal.id.pair_id());
    }
}

/// Consume answer/candidate envelopes until the channel opens.
async fn drive(
    pc: &Arc<RTCPeerConnection>,
    session: &Arc<Session>,
    signals: &mut mpsc::UnboundedReceiver<Signal>,
    open_rx: oneshot::Receiver<Arc<DataChannel>>,
    role: PeerRole,
) -> Result<PollDataChannel> {
    tokio::pin!(open_rx);
    loop {
        tokio::select! {
            raw = &mut open_rx => {
                let raw = raw.map_err(|_| anyhow!("data channel closed before open"))?;
                return Ok(PollDataChannel::new(raw));
            }
            signal = signals.recv() => {
                let Some(signal) = signal else {
                    bail!("handshake mailbox closed");
                };
                match signal.flag {
                    SignalFlag::Answer if role == PeerRole::Dialer => {
                        let desc: RTCSessionDescription =
                            serde_json::from_str(&signal.sdp).context("bad answer sdp")?;
                        pc.set_remote_description(desc)
                            .await
                            .context("failed to apply answer")?;
                        session.set_state(HandshakeState::Answered);
                    }
                    SignalFlag::Candidate => {
                        apply_candidate(pc, &signal).await;
                        if session.state() == HandshakeState::Answered {
                            session.set_state(HandshakeState::Connecting);
                        }
                    }
                    other => debug!(
                        "ignoring {other:?} during handshake of {}",
                        session.pair_id()
                    ),
                }
            }
            _ = session.cancel.cancelled() => {
                bail!("session disposed during handshake");
            }
        }
    }
}

/// Dialer path: offer, await answer, exchange candidates, open.
pub async fn dial(
    session: Arc<Session>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    outbound: mpsc::UnboundedSender<Signal>,
    local_id: String,
    config: Arc<Config>,
) -> Result<ByteStream> {
    let api = build_api()?;
    let pc = Arc::new(
        api.new_peer_connection(rtc_config(&config))
            .await
            .context("peer connection setup failed")?,
    );
    trickle_candidates(&pc, &outbound, &local_id, &session, PeerRole::Dialer);

    let dc = pc
        .create_data_channel(CHANNEL_LABEL, None)
        .await
        .context("data channel creation failed")?;
    let (open_tx, open_rx) = oneshot::channel();
    forward_on_open(&dc, Arc::new(Mutex::new(Some(open_tx))));

    let offer = pc.create_offer(None).await.context("offer failed")?;
    let sdp = serde_json::to_string(&offer)?;
    // Queue the offer before set_local_description: gathering starts
    // there, and trickled candidates must not overtake the offer.
    outbound
        .send(Signal::offer(&local_id, &session.remote, session.id, sdp))
        .map_err(|_| anyhow!("signaling loop gone"))?;
    pc.set_local_description(offer)
        .await
        .context("failed to set local offer")?;
    session.set_state(HandshakeState::LocalOffered);

    let opened = timeout(
        HANDSHAKE_TIMEOUT,
        drive(&pc, &session, &mut signals, open_rx, PeerRole::Dialer),
    )
    .await;
    finish(pc, &session, opened).await
}

/// Responder path: apply the offer, answer, exchange candidates, open.
pub async fn respond(
    session: Arc<Session>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    outbound: mpsc::UnboundedSender<Signal>,
    local_id: String,
    config: Arc<Config>,
    offer: Signal,
) -> Result<ByteStream> {
    let api = build_api()?;
    let pc = Arc::new(
        api.new_peer_connection(rtc_config(&config))
            .await
            .context("peer connection setup failed")?,
    );
    trickle_candidates(&pc, &outbound, &local_id, &session, PeerRole::Responder);

    let (open_tx, open_rx) = oneshot::channel();
    let slot: OpenSlot = Arc::new(Mutex::new(Some(open_tx)));
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let slot = slot.clone();
        Box::pin(async move {
            forward_on_open(&dc, slot);
        })
    }));

    session.set_state(HandshakeState::RemoteOffered);
    let desc: RTCSessionDescription =
        serde_json::from_str(&offer.sdp).context("bad offer sdp")?;
    pc.set_remote_description(desc)
        .await
        .context("failed to apply offer")?;

    let answer = pc.create_answer(None).await.context("answer failed")?;
    let sdp = serde_json::to_string(&answer)?;
    outbound
        .send(Signal::answer(&local_id, &session.remote, session.id, sdp))
        .map_err(|_| anyhow!("signaling loop gone"))?;
    pc.set_local_description(answer)
        .await
        .context("failed to set local answer")?;
    session.set_state(HandshakeState::Answered);

    let opened = timeout(
        HANDSHAKE_TIMEOUT,
        drive(&pc, &session, &mut signals, open_rx, PeerRole::Responder),
    )
    .await;
    finish(pc, &session, opened).await
}

async fn finish(
    pc: Arc<RTCPeerConnection>,
    session: &Arc<Session>,
    opened: Result<Result<PollDataChannel>, tokio::time::error::Elapsed>,
) -> Result<ByteStream> {
    match opened {
        Ok(Ok(stream)) => {
            session.set_state(HandshakeState::Open);
            debug!("data channel open for {}", session.pair_id());
            Ok(Box::new(ChannelStream { inner: stream, pc }))
        }
        Ok(Err(e)) => {
            let _ = pc.close().await;
            Err(e)
        }
        Err(_) => {
            let _ = pc.close().await;
            bail!("handshake timed out for {}", session.pair_id());
        }
    }
}

/// The session byte stream. Holds the peer connection so ICE and SCTP
/// stay alive as long as the splicer is pumping; closes it on drop.
struct ChannelStream {
    inner: PollDataChannel,
    pc: Arc<RTCPeerConnection>,
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        let pc = self.pc.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = pc.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServiceCode;
    use crate::session::SessionPool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Two in-process peers handshake over hand-shuttled envelopes and
    /// exchange bytes over the opened channel (host candidates only).
    #[tokio::test]
    async fn loopback_handshake_opens_a_byte_stream() {
        let config = Arc::new(Config {
            ice_servers: vec![],
            ..Config::default()
        });

        let pool_a = SessionPool::new();
        let pool_b = SessionPool::new();
        let (sess_a, rx_a) = pool_a.create_outbound(ServiceCode::Shell, "b");
        let (out_a_tx, mut out_a_rx) = mpsc::unbounded_channel();
        let (out_b_tx, mut out_b_rx) = mpsc::unbounded_channel();

        let dial_task = tokio::spawn(dial(
            sess_a.clone(),
            rx_a,
            out_a_tx,
            "a".to_string(),
            config.clone(),
        ));

        let offer = out_a_rx.recv().await.expect("dialer emits an offer first");
        assert_eq!(offer.flag, SignalFlag::Offer);
        assert_eq!(offer.service, ServiceCode::Shell);

        let (sess_b, rx_b) = pool_b.adopt_inbound(offer.id, "a").unwrap();
        let respond_task = tokio::spawn(respond(
            sess_b.clone(),
            rx_b,
            out_b_tx,
            "b".to_string(),
            config,
            offer,
        ));

        // Shuttle the rest of the signaling between the two sessions.
        let to_b = sess_b.clone();
        tokio::spawn(async move {
            while let Some(signal) = out_a_rx.recv().await {
                to_b.deliver(signal);
            }
        });
        let to_a = sess_a.clone();
        tokio::spawn(async move {
            while let Some(signal) = out_b_rx.recv().await {
                to_a.deliver(signal);
            }
        });

        let joined = tokio::time::timeout(
            Duration::from_secs(60),
            async move { tokio::join!(dial_task, respond_task) },
        )
        .await
        .expect("handshake finished in time");
        let mut stream_a = joined.0.unwrap().unwrap();
        let mut stream_b = joined.1.unwrap().unwrap();

        assert_eq!(sess_a.state(), HandshakeState::Open);
        assert_eq!(sess_b.state(), HandshakeState::Open);

        stream_a.write_all(&[0x42]).await.unwrap();
        let mut byte = [0u8; 1];
        stream_b.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte, [0x42]);

        stream_b.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        stream_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }
}
