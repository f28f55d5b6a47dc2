//! Daemon - local IPC server, session lifecycle, transport selection.
//!
//! One request envelope per accepted connection. Bring-up finds or
//! establishes a session (direct TCP first, data channel as fallback)
//! and splices the caller's socket to the session stream; the other
//! operations manage the pool.

use crate::config::{ConfigHandle, ConfigView};
use crate::protocol::{
    self, Operation, ServiceCode, ServiceRequest, SessionId, Signal, SignalFlag, StatusSnapshot,
};
use crate::service::{self, ServiceBinding};
use crate::session::{HandshakeState, Session, SessionPool};
use crate::signaling::Signaler;
use crate::splice::splice;
use crate::transport::{self, ByteStream};
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deadline for decoding the request after accept; guards the listener
/// against held-open undecoded connections.
const IPC_DECODE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Daemon {
    config: ConfigView,
    pool: SessionPool,
    outbound: mpsc::UnboundedSender<Signal>,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(
        config: ConfigView,
        outbound: mpsc::UnboundedSender<Signal>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool: SessionPool::new(),
            outbound,
            cancel,
        })
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Accept IPC clients until shutdown.
    pub async fn serve_ipc(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("ipc accept failed: {e}");
                            continue;
                        }
                    };
                    debug!("ipc client {addr}");
                    let daemon = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = daemon.handle_ipc(socket).await {
                            error!("ipc client {addr}: {e:#}");
                        }
                    });
                }
            }
        }
    }

    async fn handle_ipc(self: Arc<Self>, mut socket: TcpStream) -> Result<()> {
        let request: ServiceRequest = timeout(IPC_DECODE_TIMEOUT, protocol::read_frame(&mut socket))
            .await
            .context("request decode deadline expired")??;
        let Some(operation) = request.operation() else {
            reply_status(&mut socket, &request, 1).await?;
            bail!("unknown operation in kind {:#x}", request.kind);
        };

        match operation {
            Operation::Up => {
                let Some(service) = request.service() else {
                    reply_status(&mut socket, &request, 1).await?;
                    bail!("unknown service in kind {:#x}", request.kind);
                };
                self.handle_up(socket, request, service).await
            }
            Operation::Down => {
                // Tearing down an unknown session is a no-op success.
                if let Ok(id) = SessionId::parse(&request.pair_id_str()) {
                    if self.pool.dispose(id.pair_key()) {
                        info!("tore down {}", id.pair_id());
                    }
                }
                reply_status(&mut socket, &request, 0).await
            }
            Operation::Stat => {
                let snapshot = StatusSnapshot {
                    node_id: self.config.snapshot().id.clone(),
                    sessions: self.pool.list(),
                };
                let mut reply = request.clone();
                reply.payload = protocol::encode(&snapshot)?;
                reply.status = 0;
                protocol::write_frame(&mut socket, &reply).await
            }
            Operation::Attach => self.handle_attach(socket, request).await,
        }
    }

    /// Bring-up. A non-empty pair id marks a remote direct dial; local
    /// clients leave it empty and the daemon allocates.
    async fn handle_up(
        self: &Arc<Self>,
        mut socket: TcpStream,
        request: ServiceRequest,
        service: ServiceCode,
    ) -> Result<()> {
        if !request.pair_id.is_empty() {
            return self.handle_direct_inbound(socket, request, service).await;
        }

        let mut binding = match service::binding_from_payload(service, &request.payload) {
            Ok(binding) => binding,
            Err(e) => {
                reply_status(&mut socket, &request, 1).await?;
                return Err(e.context("bad service payload"));
            }
        };
        if let Err(e) = binding.prepare() {
            reply_status(&mut socket, &request, 1).await?;
            return Err(e.context("binding prepare failed"));
        }

        if !binding.need_connect() {
            // Detached service: bind its front and report back at once.
            let config = self.config.snapshot();
            return match binding.serve_detached(&config, self.cancel.child_token()).await {
                Ok(()) => reply_status(&mut socket, &request, 0).await,
                Err(e) => {
                    reply_status(&mut socket, &request, 1).await?;
                    Err(e.context("detached service failed to start"))
                }
            };
        }

        self.open_and_splice(socket, request, service, binding).await
    }

    async fn open_and_splice(
        self: &Arc<Self>,
        mut socket: TcpStream,
        mut request: ServiceRequest,
        service: ServiceCode,
        mut binding: Box<dyn ServiceBinding>,
    ) -> Result<()> {
        let target = binding.host_id().to_string();
        if target.is_empty() {
            reply_status(&mut socket, &request, 1).await?;
            bail!("bring-up without a target host id");
        }

        let (session, signal_rx) = self.pool.create_outbound(service, &target);
        binding.set_pair_id(&session.pair_id());
        info!("bring-up {} -> {}", session.pair_id(), target);

        let stream = match self
            .open_transport(&session, signal_rx, &target, binding.as_ref())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.pool.dispose(session.id.pair_key());
                reply_status(&mut socket, &request, 1).await?;
                return Err(e.context(format!("no transport for {}", session.pair_id())));
            }
        };

        request.pair_id = session.pair_id().into_bytes();
        if request.detach {
            // Caller does not stay for the splice: park the stream so a
            // later attach can claim it, ack, and let the socket go.
            session.put_stream(stream);
            reply_status(&mut socket, &request, 0).await?;
            if let Err(e) = binding.dial().await {
                warn!("binding dial hook failed for {}: {e:#}", session.pair_id());
            }
            return Ok(());
        }

        reply_status(&mut socket, &request, 0).await?;
        if let Err(e) = binding.dial().await {
            warn!("binding dial hook failed for {}: {e:#}", session.pair_id());
        }
        session.mark_attached();

        let result = splice(socket, stream, session.cancel.clone()).await;
        self.pool.dispose(session.id.pair_key());
        result
    }

    /// Direct first when the target resolves on the LAN, then the data
    /// channel through signaling.
    async fn open_transport(
        &self,
        session: &Arc<Session>,
        signal_rx: mpsc::UnboundedReceiver<Signal>,
        target: &str,
        binding: &dyn ServiceBinding,
    ) -> Result<ByteStream> {
        let config = self.config.snapshot();
        if let Some(addr) = resolve_direct(&config.direct_peers, target) {
            let mut direct_request =
                ServiceRequest::new(session.id.service, Operation::Up, binding.encode_payload()?);
            direct_request.pair_id = session.pair_id().into_bytes();
            direct_request.local_entry = config.ipc_addr();
            match transport::direct::dial(addr, &direct_request).await {
                Ok(stream) => {
                    session.set_state(HandshakeState::Open);
                    return Ok(stream);
                }
                Err(e) => debug!("direct transport to {target} failed, falling back: {e:#}"),
            }
        }
        transport::channel::dial(
            session.clone(),
            signal_rx,
            self.outbound.clone(),
            config.id.clone(),
            config,
        )
        .await
    }

    /// Remote dialer arrived over plain TCP: mirror the session, run the
    /// binding's respond side, splice the accepted socket to it.
    async fn handle_direct_inbound(
        self: &Arc<Self>,
        mut socket: TcpStream,
        request: ServiceRequest,
        service: ServiceCode,
    ) -> Result<()> {
        let offered = match SessionId::parse(&request.pair_id_str()) {
            Ok(id) => id,
            Err(e) => {
                reply_status(&mut socket, &request, 1).await?;
                return Err(e.context("bad pair id in direct bring-up"));
            }
        };
        let remote = socket
            .peer_addr()
            .map(|addr| format!("direct:{addr}"))
            .unwrap_or_else(|_| "direct".to_string());
        let Some((session, _signal_rx)) = self.pool.adopt_inbound(offered, &remote) else {
            reply_status(&mut socket, &request, 1).await?;
            bail!("session pair {} already exists", offered.pair_id());
        };
        info!("direct bring-up {} from {remote}", session.pair_id());

        let endpoint = match self.respond_endpoint(service, &request.payload, &session).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.pool.dispose(session.id.pair_key());
                reply_status(&mut socket, &request, 1).await?;
                return Err(e);
            }
        };
        session.set_state(HandshakeState::Open);
        reply_status(&mut socket, &request, 0).await?;
        session.mark_attached();

        let result = splice(socket, endpoint, session.cancel.clone()).await;
        self.pool.dispose(session.id.pair_key());
        result
    }

    async fn respond_endpoint(
        &self,
        service: ServiceCode,
        payload: &[u8],
        session: &Arc<Session>,
    ) -> Result<ByteStream> {
        let mut binding =
            service::binding_from_payload(service, payload).context("bad service payload")?;
        binding.set_pair_id(&session.pair_id());
        let config = self.config.snapshot();
        let endpoint = binding
            .respond(&config)
            .await
            .context("service respond failed")?;
        binding.close();
        Ok(endpoint)
    }

    async fn handle_attach(
        self: &Arc<Self>,
        mut socket: TcpStream,
        request: ServiceRequest,
    ) -> Result<()> {
        let pair = request.pair_id_str();
        let Some(session) = self.pool.lookup_pair(&pair) else {
            reply_status(&mut socket, &request, 1).await?;
            bail!("attach to unknown session {pair}");
        };
        let Some(stream) = session.take_stream() else {
            reply_status(&mut socket, &request, 1).await?;
            bail!("session {pair} has no stream to attach to");
        };
        if !session.mark_attached() {
            session.put_stream(stream);
            reply_status(&mut socket, &request, 1).await?;
            bail!("session {pair} already has a client attached");
        }
        reply_status(&mut socket, &request, 0).await?;

        let result = splice(socket, stream, session.cancel.clone()).await;
        self.pool.dispose(session.id.pair_key());
        result
    }

    /// Route one pulled envelope. Offers become inbound sessions;
    /// answers and candidates go to the session they name.
    pub fn dispatch(self: &Arc<Self>, signal: Signal) {
        match signal.flag {
            SignalFlag::Offer => self.accept_offer(signal),
            SignalFlag::Answer | SignalFlag::Candidate => {
                match self.pool.lookup(signal.id.pair_key()) {
                    Some(session) => {
                        if !session.deliver(signal) {
                            debug!("handshake already finished for {}", session.pair_id());
                        }
                    }
                    None => debug!("signal for unknown session {}", signal.id.pair_id()),
                }
            }
            SignalFlag::Unknown => debug!("ignoring unknown signal from {}", signal.source),
        }
    }

    fn accept_offer(self: &Arc<Self>, offer: Signal) {
        let Some((session, signal_rx)) = self.pool.adopt_inbound(offer.id, &offer.source) else {
            debug!("duplicate offer for {}", offer.id.pair_id());
            return;
        };
        info!(
            "inbound offer {} from {} for {:?}",
            session.pair_id(),
            offer.source,
            offer.service
        );
        let daemon = self.clone();
        tokio::spawn(async move {
            let key = session.id.pair_key();
            if let Err(e) = daemon.serve_inbound(session.clone(), signal_rx, offer).await {
                warn!("inbound session {} failed: {e:#}", session.pair_id());
            }
            daemon.pool.dispose(key);
        });
    }

    /// Responder path for a signaled session: finish the handshake,
    /// stand up the local service endpoint, splice.
    async fn serve_inbound(
        self: &Arc<Self>,
        session: Arc<Session>,
        signal_rx: mpsc::UnboundedReceiver<Signal>,
        offer: Signal,
    ) -> Result<()> {
        let config = self.config.snapshot();
        let service = session.id.service;
        let stream = transport::channel::respond(
            session.clone(),
            signal_rx,
            self.outbound.clone(),
            config.id.clone(),
            config,
            offer,
        )
        .await?;

        let endpoint = self.respond_endpoint(service, &[], &session).await?;
        splice(stream, endpoint, session.cancel.clone()).await
    }
}

fn resolve_direct(
    peers: &std::collections::HashMap<String, SocketAddr>,
    target: &str,
) -> Option<SocketAddr> {
    peers
        .get(target)
        .copied()
        .or_else(|| target.parse().ok())
}

async fn reply_status(socket: &mut TcpStream, request: &ServiceRequest, status: i32) -> Result<()> {
    let mut reply = request.clone();
    reply.status = status;
    protocol::write_frame(socket, &reply).await
}

/// Run the daemon until interrupted: config, IPC listener, signaling.
pub async fn run(home: &Path) -> Result<()> {
    let mut config_handle = ConfigHandle::load_or_init(home)?;
    config_handle.watch()?;
    let config = config_handle.view();
    let snapshot = config.snapshot();

    let cancel = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let daemon = Daemon::new(config.clone(), outbound_tx, cancel.clone());

    let listener = TcpListener::bind(snapshot.ipc_addr())
        .await
        .with_context(|| format!("failed to bind ipc endpoint {}", snapshot.ipc_addr()))?;
    info!("daemon {} listening on {}", snapshot.id, listener.local_addr()?);

    let signaler = Signaler::new(config);
    let signal_daemon = daemon.clone();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        signaler.run(signal_daemon, outbound_rx, signal_cancel).await;
    });

    tokio::select! {
        _ = daemon.clone().serve_ipc(listener) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            cancel.cancel();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigView};
    use crate::service::shell::ShellBinding;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_daemon(config: Config) -> (Arc<Daemon>, SocketAddr) {
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let daemon = Daemon::new(
            ConfigView::fixed(config),
            outbound_tx,
            CancellationToken::new(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(daemon.clone().serve_ipc(listener));
        (daemon, addr)
    }

    async fn roundtrip(addr: SocketAddr, request: &ServiceRequest) -> (TcpStream, ServiceRequest) {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        protocol::write_frame(&mut socket, request).await.unwrap();
        let reply = protocol::read_frame(&mut socket).await.unwrap();
        (socket, reply)
    }

    /// Loopback stand-in for a local service: echoes whatever arrives.
    async fn spawn_echo() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn status_query_reports_the_pool() {
        let config = Config {
            id: "node-a".to_string(),
            ..Config::default()
        };
        let (daemon, addr) = spawn_daemon(config).await;
        daemon.pool().create_outbound(ServiceCode::Shell, "peer-b");

        let request = ServiceRequest::new(ServiceCode::Status, Operation::Stat, vec![]);
        let (_socket, reply) = roundtrip(addr, &request).await;
        assert_eq!(reply.status, 0);

        let snapshot: StatusSnapshot = protocol::decode(&reply.payload).unwrap();
        assert_eq!(snapshot.node_id, "node-a");
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].remote, "peer-b");
    }

    #[tokio::test]
    async fn teardown_of_unknown_session_succeeds() {
        let (_daemon, addr) = spawn_daemon(Config::default()).await;

        let mut request = ServiceRequest::new(ServiceCode::Shell, Operation::Down, vec![]);
        request.pair_id = b"conn_0_123456_0".to_vec();
        let (_socket, reply) = roundtrip(addr, &request).await;
        assert_eq!(reply.status, 0);
    }

    #[tokio::test]
    async fn unknown_operation_is_refused() {
        let (_daemon, addr) = spawn_daemon(Config::default()).await;

        let mut request = ServiceRequest::new(ServiceCode::Shell, Operation::Up, vec![]);
        request.kind = (0 << protocol::OPERATION_BITS) | 0x77;
        let (_socket, reply) = roundtrip(addr, &request).await;
        assert_eq!(reply.status, 1);
    }

    #[tokio::test]
    async fn attach_to_unknown_session_is_refused() {
        let (_daemon, addr) = spawn_daemon(Config::default()).await;

        let mut request = ServiceRequest::new(ServiceCode::Shell, Operation::Attach, vec![]);
        request.pair_id = b"conn_0_9_0".to_vec();
        let (_socket, reply) = roundtrip(addr, &request).await;
        assert_eq!(reply.status, 1);
    }

    /// Two daemons on one host, direct transport: a byte written by A's
    /// client comes back through B's local service endpoint.
    #[tokio::test]
    async fn direct_bring_up_splices_end_to_end() {
        let echo_port = spawn_echo().await;
        let config_b = Config {
            id: "node-b".to_string(),
            shell_port: echo_port,
            ..Config::default()
        };
        let (daemon_b, addr_b) = spawn_daemon(config_b).await;

        let mut config_a = Config {
            id: "node-a".to_string(),
            ..Config::default()
        };
        config_a.direct_peers.insert("node-b".to_string(), addr_b);
        let (daemon_a, addr_a) = spawn_daemon(config_a).await;

        let mut shell = ShellBinding::default();
        shell.base.host_id = "node-b".to_string();
        let request = ServiceRequest::new(
            ServiceCode::Shell,
            Operation::Up,
            shell.encode_payload().unwrap(),
        );
        let (mut socket, reply) = roundtrip(addr_a, &request).await;
        assert_eq!(reply.status, 0);
        let pair = reply.pair_id_str();
        assert!(pair.starts_with("conn_0_"));

        socket.write_all(&[0x42]).await.unwrap();
        let mut byte = [0u8; 1];
        socket.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte, [0x42]);

        assert_eq!(daemon_a.pool().len(), 1);
        assert_eq!(daemon_b.pool().len(), 1);

        // Tear down mid-splice: the pump returns and the socket closes.
        let mut down = ServiceRequest::new(ServiceCode::Shell, Operation::Down, vec![]);
        down.pair_id = pair.into_bytes();
        let (_down_socket, down_reply) = roundtrip(addr_a, &down).await;
        assert_eq!(down_reply.status, 0);

        let mut rest = Vec::new();
        timeout(Duration::from_secs(2), socket.read_to_end(&mut rest))
            .await
            .expect("client socket must close after teardown")
            .unwrap();
        assert!(daemon_a.pool().is_empty());
    }

    /// A detached bring-up parks the session stream; a later attach
    /// claims it and the splice runs against the attaching socket.
    #[tokio::test]
    async fn detached_bring_up_then_attach() {
        let echo_port = spawn_echo().await;
        let config_b = Config {
            id: "node-b".to_string(),
            shell_port: echo_port,
            ..Config::default()
        };
        let (_daemon_b, addr_b) = spawn_daemon(config_b).await;

        let mut config_a = Config::default();
        config_a.direct_peers.insert("node-b".to_string(), addr_b);
        let (daemon_a, addr_a) = spawn_daemon(config_a).await;

        let mut shell = ShellBinding::default();
        shell.base.host_id = "node-b".to_string();
        let mut request = ServiceRequest::new(
            ServiceCode::Shell,
            Operation::Up,
            shell.encode_payload().unwrap(),
        );
        request.detach = true;
        let (_socket, reply) = roundtrip(addr_a, &request).await;
        assert_eq!(reply.status, 0);
        let pair = reply.pair_id_str();

        let session = daemon_a.pool().lookup_pair(&pair).unwrap();
        assert!(session.has_stream());
        assert!(!session.is_attached());

        let mut attach = ServiceRequest::new(ServiceCode::Shell, Operation::Attach, vec![]);
        attach.pair_id = pair.clone().into_bytes();
        let (mut socket, attach_reply) = roundtrip(addr_a, &attach).await;
        assert_eq!(attach_reply.status, 0);

        socket.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // The stream is claimed; a second attach is refused.
        let mut again = ServiceRequest::new(ServiceCode::Shell, Operation::Attach, vec![]);
        again.pair_id = pair.into_bytes();
        let (_socket2, again_reply) = roundtrip(addr_a, &again).await;
        assert_eq!(again_reply.status, 1);
    }

    /// Concurrent offer and bring-up for the same pair never produce two
    /// records: the second arrival is refused.
    #[tokio::test]
    async fn duplicate_direct_bring_up_is_refused() {
        let echo_port = spawn_echo().await;
        let config = Config {
            shell_port: echo_port,
            ..Config::default()
        };
        let (daemon, addr) = spawn_daemon(config).await;

        let shell = ShellBinding::default();
        let mut request = ServiceRequest::new(
            ServiceCode::Shell,
            Operation::Up,
            shell.encode_payload().unwrap(),
        );
        request.pair_id = b"conn_0_5000_0".to_vec();

        let (_first, first_reply) = roundtrip(addr, &request).await;
        assert_eq!(first_reply.status, 0);
        assert_eq!(daemon.pool().len(), 1);

        let (_second, second_reply) = roundtrip(addr, &request).await;
        assert_eq!(second_reply.status, 1);
        assert_eq!(daemon.pool().len(), 1);
    }
}
