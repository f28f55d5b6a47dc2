//! CLI client - frames one service request to the daemon over IPC and
//! bridges the caller's stdio onto the resulting session.

use crate::config::ConfigHandle;
use crate::protocol::{
    self, Operation, ServiceCode, ServiceRequest, SessionId, StatusSnapshot,
};
use crate::service::copy::CopyBinding;
use crate::service::filesystem::FilesystemBinding;
use crate::service::framebuffer::{FramebufferClient, FramebufferServer};
use crate::service::message::MessageBinding;
use crate::service::proxy::ProxyBinding;
use crate::service::shell::ShellBinding;
use crate::service::transfer::{TransferClient, TransferServer};
use crate::service::ServiceBinding;
use crate::Command;
use anyhow::{bail, Context, Result};
use std::path::Path;
use tokio::net::TcpStream;
use tracing::debug;

pub async fn send_command(home: &Path, command: Command) -> Result<()> {
    let config = ConfigHandle::load_or_init(home)?.snapshot();
    let addr = config.ipc_addr();

    match command {
        Command::Connect { target, username } => {
            let mut shell = ShellBinding::default();
            shell.set_host_id(&target);
            shell.username = username;
            bridge(&addr, up_request(&shell, &addr)?).await
        }
        Command::Copy {
            target,
            path,
            upload,
        } => {
            let mut copy = CopyBinding::default();
            copy.set_host_id(&target);
            copy.remote_path = path;
            copy.upload = upload;
            bridge(&addr, up_request(&copy, &addr)?).await
        }
        Command::Mount {
            target,
            mount_point,
        } => {
            let mut filesystem = FilesystemBinding::default();
            filesystem.set_host_id(&target);
            filesystem.mount_point = mount_point;
            bridge(&addr, up_request(&filesystem, &addr)?).await
        }
        Command::Proxy { target, port } => {
            let mut proxy = ProxyBinding::default();
            proxy.set_host_id(&target);
            proxy.listen_port = port;
            proxy.base.connect_now = false;
            let request = up_request(&proxy, &addr)?;
            let (_socket, _reply) = open(&addr, &request).await?;
            println!("proxy for {target} listening on 127.0.0.1:{port}");
            Ok(())
        }
        Command::Fb { target } => {
            let mut framebuffer = FramebufferClient::default();
            framebuffer.set_host_id(&target);
            bridge(&addr, up_request(&framebuffer, &addr)?).await
        }
        Command::FbServe { target } => {
            let mut framebuffer = FramebufferServer::default();
            framebuffer.set_host_id(&target);
            bridge(&addr, up_request(&framebuffer, &addr)?).await
        }
        Command::Message { target, nickname } => {
            let mut message = MessageBinding::default();
            message.set_host_id(&target);
            message.nickname = nickname;
            bridge(&addr, up_request(&message, &addr)?).await
        }
        Command::Transfer { target } => {
            let mut transfer = TransferClient::default();
            transfer.set_host_id(&target);
            bridge(&addr, up_request(&transfer, &addr)?).await
        }
        Command::TransferServe { target } => {
            let mut transfer = TransferServer::default();
            transfer.set_host_id(&target);
            bridge(&addr, up_request(&transfer, &addr)?).await
        }
        Command::Status => {
            let mut request = ServiceRequest::new(ServiceCode::Status, Operation::Stat, vec![]);
            request.local_entry = addr.clone();
            let (_socket, reply) = open(&addr, &request).await?;
            let snapshot: StatusSnapshot = protocol::decode(&reply.payload)?;
            println!("NODE: {}", snapshot.node_id);
            println!("SESSIONS:");
            for session in &snapshot.sessions {
                println!(
                    "  {} {:?} {:?} remote={} state={}{}",
                    session.pair_id,
                    session.service,
                    session.direction,
                    session.remote,
                    session.state,
                    if session.attached { " attached" } else { "" }
                );
            }
            Ok(())
        }
        Command::Down { pair_id } => {
            let id = SessionId::parse(&pair_id).context("bad pair id")?;
            let mut request = ServiceRequest::new(id.service, Operation::Down, vec![]);
            request.pair_id = pair_id.into_bytes();
            request.local_entry = addr.clone();
            let (_socket, _reply) = open(&addr, &request).await?;
            println!("OK");
            Ok(())
        }
        Command::Attach { pair_id } => {
            let id = SessionId::parse(&pair_id).context("bad pair id")?;
            let mut request = ServiceRequest::new(id.service, Operation::Attach, vec![]);
            request.pair_id = pair_id.into_bytes();
            request.local_entry = addr.clone();
            bridge(&addr, request).await
        }
        Command::Daemon | Command::Rendezvous { .. } => {
            unreachable!("server commands handled in main")
        }
    }
}

fn up_request(binding: &dyn ServiceBinding, addr: &str) -> Result<ServiceRequest> {
    let mut request =
        ServiceRequest::new(binding.code(), Operation::Up, binding.encode_payload()?);
    request.local_entry = addr.to_string();
    Ok(request)
}

async fn open(addr: &str, request: &ServiceRequest) -> Result<(TcpStream, ServiceRequest)> {
    let mut socket = TcpStream::connect(addr)
        .await
        .context("failed to connect to daemon - is it running?")?;
    protocol::write_frame(&mut socket, request).await?;
    let reply: ServiceRequest = protocol::read_frame(&mut socket).await?;
    if reply.status != 0 {
        bail!("daemon returned status {}", reply.status);
    }
    Ok((socket, reply))
}

/// Keep the socket open for the life of the session, pumping stdio.
async fn bridge(addr: &str, request: ServiceRequest) -> Result<()> {
    let (socket, reply) = open(addr, &request).await?;
    eprintln!("session {}", reply.pair_id_str());

    let (mut socket_read, mut socket_write) = socket.into_split();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    tokio::select! {
        result = tokio::io::copy(&mut stdin, &mut socket_write) => {
            debug!("stdin ended: {result:?}");
        }
        result = tokio::io::copy(&mut socket_read, &mut stdout) => {
            debug!("session ended: {result:?}");
        }
    }
    Ok(())
}
