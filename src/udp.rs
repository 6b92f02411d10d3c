// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::UdpConfig;
use crate::engine::EngineHandle;
use crate::protocol::command::Command;

/// Run one token through the command engine and render the response block
/// the way the companion CLI expects it (responses joined by CR-LF).
fn service_token(token: &str, handle: &EngineHandle) -> Option<String> {
    let command = Command::from_token(token);
    // Allow for every retransmission before giving up on the relay.
    let deadline = command.timeout * (command.retries + 1) + Duration::from_secs(5);
    let rx = handle.submit(command);
    match rx.recv_timeout(deadline) {
        Ok(Ok(responses)) => Some(responses.join("\r\n")),
        Ok(Err(e)) => {
            warn!("relayed token '{}' failed: {}", token, e);
            None
        }
        Err(_) => {
            warn!("relayed token '{}' got no outcome", token);
            None
        }
    }
}

/// Transparent datagram proxy: payloads are raw protocol tokens, forwarded
/// through the command engine; responses go back to the sender's address at
/// the configured reply port.
pub fn spawn_proxy(cfg: &UdpConfig, handle: EngineHandle) -> io::Result<JoinHandle<()>> {
    let socket = UdpSocket::bind(("0.0.0.0", cfg.rx_port))?;
    let tx_port = cfg.tx_port;
    info!("companion proxy listening on udp/{}", cfg.rx_port);
    std::thread::Builder::new()
        .name("udp-proxy".to_string())
        .spawn(move || {
            let mut buf = [0u8; 2048];
            loop {
                let (n, peer) = match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("udp receive failed: {}", e);
                        continue;
                    }
                };
                let token = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                if token.is_empty() {
                    continue;
                }
                debug!("udp ← {} from {}", token, peer);
                if let Some(body) = service_token(&token, &handle) {
                    let reply_addr = SocketAddr::new(peer.ip(), tx_port);
                    if let Err(e) = socket.send_to(body.as_bytes(), reply_addr) {
                        warn!("udp reply to {} failed: {}", reply_addr, e);
                    }
                }
            }
        })
}

/// Replicate raw status bulletins to a multicast group at the reply port.
pub fn spawn_multicast(
    group: &str,
    tx_port: u16,
    bulletins: Receiver<String>,
) -> io::Result<JoinHandle<()>> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    let group: Ipv4Addr = group
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad multicast group"))?;
    info!("replicating bulletins to {}:{}", group, tx_port);
    std::thread::Builder::new()
        .name("udp-multicast".to_string())
        .spawn(move || {
            for line in bulletins.iter() {
                if let Err(e) = socket.send_to(line.as_bytes(), (group, tx_port)) {
                    warn!("multicast send failed: {}", e);
                }
            }
            debug!("bulletin source closed, multicast replication stopping");
        })
}
