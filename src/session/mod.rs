//! SOCKS5 Session Manager
//!
//! Every flow runs as its own task. A session walks
//! Init → Handshaking → Relaying → Closing, dropping to Failed on any
//! error. Failures before relaying starts are retried with exponential
//! backoff until the per-flow retry limit is reached.

mod retry;
mod tcp;
mod udp;

pub use retry::{backoff_delay, wait_backoff, RetryTable, DEFAULT_RETRY_LIMIT};
pub use tcp::run_tcp;
pub use udp::run_udp;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::app::EngineMetrics;
use crate::common::{Address, FlowKey, Result, Stream};
use crate::config::Config;
use crate::error::Error;
use crate::packet::{tcp_flags, TcpSegment};
use crate::protocol::Socks5Client;
use crate::stack::PacketWriter;
use crate::transport::{ConnectionPool, PooledConnection, ProxyConnector};

/// Everything a session task needs, shared by all flows of one engine
pub struct SessionContext {
    pub config: Arc<Config>,
    pub pool: ConnectionPool<Stream>,
    pub connector: ProxyConnector,
    pub client: Socks5Client,
    pub retries: Arc<RetryTable>,
    pub metrics: Arc<EngineMetrics>,
    pub writer: PacketWriter,
    pub stop: watch::Receiver<bool>,
}

/// Lifecycle of a flow's proxy session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Handshaking,
    Relaying,
    Closing,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::Handshaking => "handshaking",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Current state of one session, with transition logging
pub struct StateTracker {
    key: FlowKey,
    state: SessionState,
}

impl StateTracker {
    pub fn new(key: FlowKey) -> Self {
        Self {
            key,
            state: SessionState::Init,
        }
    }

    pub fn set(&mut self, next: SessionState) {
        if self.state != next {
            trace!("{}: {} -> {}", self.key, self.state, next);
            self.state = next;
        }
    }
}

/// A frame routed to a flow, copied out of the read buffer
#[derive(Debug, Clone)]
pub enum FlowInput {
    Tcp(TcpInput),
    Udp(Bytes),
}

/// Owned view of a TCP segment
#[derive(Debug, Clone)]
pub struct TcpInput {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: Bytes,
}

impl TcpInput {
    pub fn from_segment(segment: &TcpSegment<'_>) -> Self {
        Self {
            seq: segment.seq,
            ack: segment.ack,
            flags: segment.flags,
            window: segment.window,
            mss: segment.mss,
            payload: Bytes::copy_from_slice(segment.payload),
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_syn(&self) -> bool {
        self.has(tcp_flags::SYN) && !self.has(tcp_flags::ACK)
    }
}

/// SOCKS5 request a session needs
#[derive(Debug, Clone)]
pub enum Request {
    Connect(Address),
    UdpAssociate,
}

/// Establish a proxy session, retrying with backoff while the flow has
/// retries left. Returns the consumed connection and the bound address.
pub async fn open_session(
    ctx: &SessionContext,
    key: &FlowKey,
    request: &Request,
    state: &mut StateTracker,
    stop: &mut watch::Receiver<bool>,
) -> Result<(PooledConnection<Stream>, Address)> {
    let id = key.id();

    loop {
        match attempt(ctx, request, state).await {
            Ok(session) => {
                ctx.retries.reset(&id);
                return Ok(session);
            }
            Err(e) => {
                state.set(SessionState::Failed);
                if !ctx.retries.should_retry(&id) {
                    ctx.retries.reset(&id);
                    return Err(e);
                }

                let attempt = ctx.retries.increment(&id);
                ctx.metrics.session_retries.inc();
                debug!("{}: attempt {} failed: {}", key, attempt, e);

                if !wait_backoff(backoff_delay(attempt), stop).await {
                    return Err(Error::ConnectionClosed);
                }
            }
        }
    }
}

async fn attempt(
    ctx: &SessionContext,
    request: &Request,
    state: &mut StateTracker,
) -> Result<(PooledConnection<Stream>, Address)> {
    state.set(SessionState::Init);
    let started = Instant::now();
    let mut conn = ctx.pool.acquire(|| ctx.connector.open()).await?;
    // a SOCKS request consumes the connection
    conn.mark_unhealthy();

    state.set(SessionState::Handshaking);
    let handshake = async {
        match request {
            Request::Connect(target) => ctx.client.connect(&mut *conn, target).await,
            Request::UdpAssociate => {
                ctx.client
                    .udp_associate(&mut *conn, &Address::unspecified())
                    .await
            }
        }
    };

    let bound = tokio::time::timeout(ctx.config.handshake_timeout, handshake)
        .await
        .map_err(|_| Error::ConnectionTimeout)??;

    ctx.metrics
        .handshake_seconds
        .observe(started.elapsed().as_secs_f64());
    Ok((conn, bound))
}
