//! Probe subcommands, each a short blocking conversation over one socket.

use std::time::Duration;

use anyhow::{Context, Result};
use sockeng::{
    AbstractSocket, HostAddress, HostResolver, IpPacketHeader, SocketErrorKind, SocketListener,
    SocketState, SocketType, SystemResolver,
};
use tracing::{debug, info};

use crate::config::{Command, ProbeConfig};

const MAX_LINE: usize = 64 * 1024;

pub fn run(config: &ProbeConfig, command: Command) -> Result<()> {
    match command {
        Command::Connect {
            host,
            port,
            send,
            timeout_ms,
        } => connect(config, &host, port, send.as_deref(), timeout_ms),
        Command::SendDatagram {
            host,
            port,
            message,
            wait_reply,
            timeout_ms,
        } => send_datagram(config, &host, port, &message, wait_reply, timeout_ms),
        Command::Listen {
            address,
            port,
            count,
            echo,
        } => listen(config, &address, port, count, echo),
    }
}

fn connect(
    config: &ProbeConfig,
    host: &str,
    port: u16,
    send: Option<&str>,
    timeout_ms: u64,
) -> Result<()> {
    let timeout = Some(Duration::from_millis(timeout_ms));
    let mut socket = AbstractSocket::new(SocketType::Tcp, config.socket.clone())
        .with_proxy(config.proxy.to_proxy());

    socket
        .connect_to_host(host, port)
        .with_context(|| format!("failed to start connecting to {}:{}", host, port))?;
    socket
        .wait_for_connected(timeout)
        .with_context(|| format!("failed to connect to {}:{}", host, port))?;
    log_notifications(&mut socket);

    info!(
        peer = %socket.peer_address(),
        peer_port = socket.peer_port(),
        local = %socket.local_address(),
        local_port = socket.local_port(),
        "Connected"
    );

    if let Some(line) = send {
        socket.write(line.as_bytes())?;
        socket.write(b"\n")?;
        socket.wait_for_bytes_written(timeout)?;

        while !socket.can_read_line() {
            socket
                .wait_for_ready_read(timeout)
                .context("no reply from peer")?;
        }
        let reply = socket.read_line(MAX_LINE)?;
        println!("{}", String::from_utf8_lossy(&reply).trim_end());
    }

    socket.disconnect_from_host();
    if socket.state() != SocketState::Unconnected {
        socket.wait_for_disconnected(timeout)?;
    }
    log_notifications(&mut socket);
    Ok(())
}

fn send_datagram(
    config: &ProbeConfig,
    host: &str,
    port: u16,
    message: &str,
    wait_reply: bool,
    timeout_ms: u64,
) -> Result<()> {
    let address = match HostAddress::parse(host) {
        Some(address) => address,
        None => {
            let info = SystemResolver::new().lookup_blocking(host);
            if let Some(error) = info.error {
                anyhow::bail!("failed to resolve {}: {}", host, error);
            }
            info.addresses
                .into_iter()
                .next()
                .with_context(|| format!("no addresses for {}", host))?
        }
    };

    let mut socket = AbstractSocket::new(SocketType::Udp, config.socket.clone());
    let header = IpPacketHeader::to(address.clone(), port);
    let sent = socket.send_datagram(message.as_bytes(), &header)?;
    info!(%address, port, bytes = sent, "Datagram sent");

    if !wait_reply {
        return Ok(());
    }

    socket
        .wait_for_ready_read(Some(Duration::from_millis(timeout_ms)))
        .context("no reply datagram")?;
    if let Some(datagram) = socket.receive_datagram(None)? {
        info!(
            sender = %datagram.header.sender_address,
            sender_port = datagram.header.sender_port,
            bytes = datagram.data.len(),
            "Datagram received"
        );
        println!("{}", String::from_utf8_lossy(&datagram.data));
    }
    Ok(())
}

fn listen(config: &ProbeConfig, address: &str, port: u16, count: usize, echo: bool) -> Result<()> {
    let address = HostAddress::parse(address)
        .with_context(|| format!("invalid listen address '{}'", address))?;

    let mut listener = SocketListener::new(SocketType::Tcp, config.socket.clone());
    listener.listen(&address, port)?;
    info!(
        address = %listener.server_address(),
        port = listener.server_port(),
        "Listening"
    );
    println!("{}", listener.server_port());

    let mut served = 0;
    while served < count {
        if !listener.wait_for_new_connection(None)? {
            continue;
        }
        while let Some(mut socket) = listener.next_pending_connection()? {
            info!(peer = %socket.peer_address(), peer_port = socket.peer_port(), "Accepted");
            serve(&mut socket, echo)?;
            served += 1;
            if served == count {
                break;
            }
        }
    }

    listener.close();
    Ok(())
}

fn serve(socket: &mut AbstractSocket, echo: bool) -> Result<()> {
    loop {
        while socket.can_read_line() {
            let line = socket.read_line(MAX_LINE)?;
            println!("{}", String::from_utf8_lossy(&line).trim_end());
            if echo {
                socket.write(&line)?;
                socket.wait_for_bytes_written(None)?;
            }
        }
        match socket.wait_for_ready_read(None) {
            Ok(()) => {}
            Err(e) if e.kind == SocketErrorKind::RemoteHostClosed => break,
            Err(e) => return Err(e.into()),
        }
    }

    // Trailing bytes without a newline.
    if let Ok(rest) = socket.read_all() {
        if !rest.is_empty() {
            println!("{}", String::from_utf8_lossy(&rest));
        }
    }
    log_notifications(socket);
    info!(peer = %socket.peer_address(), "Peer closed");
    Ok(())
}

fn log_notifications(socket: &mut AbstractSocket) {
    for notification in socket.take_notifications() {
        debug!(?notification, "socket");
    }
}
