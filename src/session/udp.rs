//! UDP flows over a SOCKS5 UDP association

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::common::{Address, FlowKey, Result, Stream};
use crate::error::Error;
use crate::packet::build_udp;
use crate::protocol::{decode_udp_datagram, encode_udp_datagram};

use super::{open_session, FlowInput, Request, SessionContext, SessionState, StateTracker};

/// Pick the address relayed datagrams go to. Servers commonly answer
/// with an unspecified address meaning "same host as the control
/// connection".
async fn relay_address(bound: &Address, server: &Address) -> Result<SocketAddr> {
    let relay = bound.resolve().await?;
    if !relay.ip().is_unspecified() {
        return Ok(relay);
    }

    let server = server.resolve().await?;
    Ok(SocketAddr::new(server.ip(), relay.port()))
}

async fn bind_for(relay: SocketAddr) -> Result<UdpSocket> {
    let local = match relay.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(relay).await?;
    Ok(socket)
}

/// Source address for a reply frame. Falls back to the flow destination
/// when the relay reports a domain or a different address family.
fn reply_source(key: &FlowKey, from: &Address) -> SocketAddr {
    match from.as_socket() {
        Some(addr) if addr.is_ipv4() == key.source.is_ipv4() => addr,
        _ => key.destination,
    }
}

/// Drive one UDP flow until the association ends.
pub async fn run_udp(ctx: Arc<SessionContext>, key: FlowKey, mut rx: mpsc::Receiver<FlowInput>) {
    let mut stop = ctx.stop.clone();
    let mut state = StateTracker::new(key);

    let (mut control, bound) =
        match open_session(&ctx, &key, &Request::UdpAssociate, &mut state, &mut stop).await {
            Ok(session) => session,
            Err(Error::ConnectionClosed) => return,
            Err(e) => {
                warn!("{}: UDP association failed: {}", key, e);
                ctx.metrics.record_failure(&e);
                return;
            }
        };

    let result = async {
        let relay = relay_address(&bound, ctx.connector.server()).await?;
        let socket = bind_for(relay).await?;
        debug!("{}: associated via relay {}", key, relay);

        state.set(SessionState::Relaying);
        relay_datagrams(&ctx, &key, &socket, &mut control, &mut rx, &mut stop).await
    }
    .await;

    match result {
        Ok(()) => state.set(SessionState::Closing),
        Err(e) => {
            state.set(SessionState::Failed);
            debug!("{}: association ended: {}", key, e);
            ctx.metrics.record_failure(&e);
        }
    }

    ctx.pool.release(control);
}

async fn relay_datagrams(
    ctx: &SessionContext,
    key: &FlowKey,
    socket: &UdpSocket,
    control: &mut Stream,
    rx: &mut mpsc::Receiver<FlowInput>,
    stop: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let idle_timeout = ctx.config.udp_idle_timeout;
    let target = Address::Socket(key.destination);
    let mut buf = vec![0u8; ctx.config.buffer_size + 262];
    let mut control_buf = [0u8; 64];
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            input = rx.recv() => {
                let payload = match input {
                    Some(FlowInput::Udp(payload)) => payload,
                    Some(FlowInput::Tcp(_)) => continue,
                    None => return Ok(()),
                };
                last_activity = Instant::now();

                let datagram = encode_udp_datagram(&target, &payload)?;
                socket.send(&datagram).await?;
                ctx.metrics.proxy_bytes_sent.inc_by(payload.len() as u64);
            }

            n = socket.recv(&mut buf) => {
                let n = n?;
                last_activity = Instant::now();

                let (from, payload) = match decode_udp_datagram(&buf[..n]) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        trace!("{}: dropping relay datagram: {}", key, e);
                        continue;
                    }
                };
                ctx.metrics.proxy_bytes_received.inc_by(payload.len() as u64);

                let frame = build_udp(reply_source(key, &from), key.source, payload)?;
                ctx.writer.write(&frame).await?;
            }

            n = control.read(&mut control_buf) => {
                // the association lives as long as the control connection
                match n {
                    Ok(0) => {
                        debug!("{}: control connection closed", key);
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            _ = sleep_until(last_activity + idle_timeout) => {
                debug!("{}: idle for {:?}", key, idle_timeout);
                return Ok(());
            }

            _ = stop.changed() => {
                return Ok(());
            }
        }
    }
}
