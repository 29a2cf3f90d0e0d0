//! TCP flows
//!
//! The local peer talks TCP to a small user-space endpoint that
//! impersonates the remote host. Its byte stream is relayed over a SOCKS5
//! CONNECT. The endpoint keeps just enough state for reliable in-order
//! delivery: no window scaling, no SACK, no congestion control.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::common::{Address, FlowKey, Result, Stream};
use crate::error::Error;
use crate::packet::{build_tcp, tcp_flags, TcpFields};
use crate::stack::PacketWriter;

use super::{
    open_session, FlowInput, Request, SessionContext, SessionState, StateTracker, TcpInput,
};

const RTO_INITIAL: Duration = Duration::from_secs(1);
const RTO_MAX: Duration = Duration::from_secs(60);
const MAX_RETRANSMITS: u32 = 8;

/// MSS assumed when the peer sends none (RFC 9293)
const DEFAULT_PEER_MSS: u16 = 536;
const RECEIVE_WINDOW: u16 = 65535;

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// What the relay loop should do after a segment
#[derive(Debug, PartialEq, Eq)]
enum Next {
    Continue,
    /// Peer sent RST
    Reset,
}

/// Endpoint state facing the local peer
struct TcpEndpoint {
    key: FlowKey,
    writer: PacketWriter,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    peer_window: u32,
    send_mss: usize,
    advertised_mss: u16,

    /// Bytes sent but not yet acknowledged, starting at `snd_una`
    unacked: BytesMut,

    established: bool,
    fin_sent: bool,
    fin_acked: bool,
    fin_received: bool,

    rto: Duration,
    retransmits: u32,
    retransmit_at: Option<Instant>,
}

impl TcpEndpoint {
    fn new(key: FlowKey, writer: PacketWriter, syn: &TcpInput, advertised_mss: u16) -> Self {
        let iss: u32 = rand::random();

        Self {
            key,
            writer,
            snd_una: iss,
            snd_nxt: iss,
            rcv_nxt: syn.seq.wrapping_add(1),
            peer_window: syn.window as u32,
            send_mss: syn.mss.unwrap_or(DEFAULT_PEER_MSS).max(1) as usize,
            advertised_mss,
            unacked: BytesMut::new(),
            established: false,
            fin_sent: false,
            fin_acked: false,
            fin_received: false,
            rto: RTO_INITIAL,
            retransmits: 0,
            retransmit_at: None,
        }
    }

    fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// Bytes the peer's window still allows
    fn send_window(&self) -> usize {
        self.peer_window.saturating_sub(self.in_flight()) as usize
    }

    fn is_closed(&self) -> bool {
        self.fin_sent && self.fin_acked && self.fin_received
    }

    async fn emit(&self, seq: u32, flags: u8, mss: Option<u16>, payload: &[u8]) -> Result<()> {
        let fields = TcpFields {
            seq,
            ack: self.rcv_nxt,
            flags,
            window: RECEIVE_WINDOW,
            mss,
        };
        // we impersonate the remote side
        let frame = build_tcp(self.key.destination, self.key.source, &fields, payload)?;
        self.writer.write(&frame).await
    }

    async fn send_syn_ack(&mut self) -> Result<()> {
        let iss = self.snd_una;
        self.emit(
            iss,
            tcp_flags::SYN | tcp_flags::ACK,
            Some(self.advertised_mss),
            &[],
        )
        .await?;
        self.snd_nxt = iss.wrapping_add(1);
        self.arm_timer();
        Ok(())
    }

    async fn send_ack(&self) -> Result<()> {
        self.emit(self.snd_nxt, tcp_flags::ACK, None, &[]).await
    }

    async fn send_rst(&self) -> Result<()> {
        self.emit(self.snd_nxt, tcp_flags::RST | tcp_flags::ACK, None, &[])
            .await
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.send_mss) {
            self.emit(self.snd_nxt, tcp_flags::PSH | tcp_flags::ACK, None, chunk)
                .await?;
            self.unacked.extend_from_slice(chunk);
            self.snd_nxt = self.snd_nxt.wrapping_add(chunk.len() as u32);
        }
        self.arm_timer();
        Ok(())
    }

    async fn send_fin(&mut self) -> Result<()> {
        self.emit(self.snd_nxt, tcp_flags::FIN | tcp_flags::ACK, None, &[])
            .await?;
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.fin_sent = true;
        self.arm_timer();
        Ok(())
    }

    fn arm_timer(&mut self) {
        if self.retransmit_at.is_none() && self.in_flight() > 0 {
            self.retransmit_at = Some(Instant::now() + self.rto);
        }
    }

    /// Process an acknowledgment number and window advertisement.
    fn on_ack(&mut self, ack: u32, window: u16) {
        if seq_gt(ack, self.snd_nxt) || seq_lt(ack, self.snd_una) {
            return;
        }
        self.peer_window = window as u32;

        if ack == self.snd_una {
            return;
        }

        let mut acked = ack.wrapping_sub(self.snd_una) as usize;
        self.snd_una = ack;

        if !self.established {
            // our SYN
            self.established = true;
            acked -= 1;
        }

        let data = acked.min(self.unacked.len());
        self.unacked.advance(data);
        if acked > data && self.fin_sent {
            self.fin_acked = true;
        }

        self.retransmits = 0;
        self.rto = RTO_INITIAL;
        self.retransmit_at = None;
        self.arm_timer();
    }

    /// Resend the oldest unacknowledged segment.
    async fn retransmit(&mut self) -> Result<()> {
        self.retransmits += 1;
        if self.retransmits > MAX_RETRANSMITS {
            return Err(Error::ConnectionTimeout);
        }

        if !self.established {
            let iss = self.snd_una;
            self.emit(
                iss,
                tcp_flags::SYN | tcp_flags::ACK,
                Some(self.advertised_mss),
                &[],
            )
            .await?;
        } else if !self.unacked.is_empty() {
            let len = self.unacked.len().min(self.send_mss);
            let segment = self.unacked[..len].to_vec();
            self.emit(self.snd_una, tcp_flags::PSH | tcp_flags::ACK, None, &segment)
                .await?;
        } else if self.fin_sent && !self.fin_acked {
            self.emit(
                self.snd_nxt.wrapping_sub(1),
                tcp_flags::FIN | tcp_flags::ACK,
                None,
                &[],
            )
            .await?;
        }

        debug!("{}: retransmit #{} after {:?}", self.key, self.retransmits, self.rto);
        self.rto = (self.rto * 2).min(RTO_MAX);
        self.retransmit_at = Some(Instant::now() + self.rto);
        Ok(())
    }

    /// Handle one segment from the local peer. In-order payload is written
    /// to the proxy before it is acknowledged.
    async fn on_segment(&mut self, seg: &TcpInput, proxy: &mut Stream) -> Result<(Next, usize)> {
        if seg.has(tcp_flags::RST) {
            return Ok((Next::Reset, 0));
        }

        if seg.has(tcp_flags::SYN) {
            // our SYN-ACK was lost
            if !self.established {
                self.send_syn_ack().await?;
            }
            return Ok((Next::Continue, 0));
        }

        if !seg.has(tcp_flags::ACK) {
            return Ok((Next::Continue, 0));
        }
        self.on_ack(seg.ack, seg.window);

        let has_fin = seg.has(tcp_flags::FIN);
        if seg.payload.is_empty() && !has_fin {
            return Ok((Next::Continue, 0));
        }

        let mut seq = seg.seq;
        let mut payload = &seg.payload[..];

        // drop the part we already have
        if seq_lt(seq, self.rcv_nxt) {
            let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
            payload = &payload[skip.min(payload.len())..];
            seq = seq.wrapping_add(skip as u32);
        }

        if seq != self.rcv_nxt {
            // out of order or a duplicate FIN
            self.send_ack().await?;
            return Ok((Next::Continue, 0));
        }

        let mut written = 0;
        if !payload.is_empty() && !self.fin_received {
            proxy.write_all(payload).await?;
            written = payload.len();
            self.rcv_nxt = self.rcv_nxt.wrapping_add(written as u32);
        }

        let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
        if has_fin && !self.fin_received && fin_seq == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.fin_received = true;
            if let Err(e) = proxy.shutdown().await {
                debug!("{}: proxy write shutdown failed: {}", self.key, e);
            }
        }

        self.send_ack().await?;
        Ok((Next::Continue, written))
    }
}

/// MSS we advertise so a full segment fits one frame buffer.
fn advertised_mss(key: &FlowKey, buffer_size: usize) -> u16 {
    let headers = if key.source.is_ipv4() { 40 } else { 60 };
    buffer_size
        .saturating_sub(headers)
        .clamp(DEFAULT_PEER_MSS as usize, u16::MAX as usize) as u16
}

/// Drive one TCP flow from its first SYN until it closes.
pub async fn run_tcp(
    ctx: Arc<SessionContext>,
    key: FlowKey,
    syn: TcpInput,
    mut rx: mpsc::Receiver<FlowInput>,
) {
    let mut stop = ctx.stop.clone();
    let mut state = StateTracker::new(key);
    let request = Request::Connect(Address::Socket(key.destination));

    let mut endpoint = TcpEndpoint::new(
        key,
        ctx.writer.clone(),
        &syn,
        advertised_mss(&key, ctx.config.buffer_size),
    );

    let mut conn = match open_session(&ctx, &key, &request, &mut state, &mut stop).await {
        Ok((conn, _bound)) => conn,
        Err(Error::ConnectionClosed) => return,
        Err(e) => {
            warn!("{}: proxy session failed: {}", key, e);
            ctx.metrics.record_failure(&e);
            if let Err(e) = endpoint.send_rst().await {
                debug!("{}: RST not sent: {}", key, e);
            }
            return;
        }
    };

    state.set(SessionState::Relaying);
    debug!("{}: relaying", key);

    let result = relay(&ctx, &mut endpoint, &mut conn, &mut rx, &mut stop).await;

    match result {
        Ok(()) => state.set(SessionState::Closing),
        Err(e) => {
            state.set(SessionState::Failed);
            if !matches!(e, Error::ConnectionClosed) {
                debug!("{}: relay ended: {}", key, e);
                ctx.metrics.record_failure(&e);
            }
            if let Err(e) = endpoint.send_rst().await {
                debug!("{}: RST not sent: {}", key, e);
            }
        }
    }

    ctx.pool.release(conn);
}

async fn relay(
    ctx: &SessionContext,
    endpoint: &mut TcpEndpoint,
    proxy: &mut Stream,
    rx: &mut mpsc::Receiver<FlowInput>,
    stop: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let idle_timeout = ctx.config.tcp_idle_timeout;
    let mut buf = vec![0u8; ctx.config.buffer_size];
    let mut proxy_eof = false;
    let mut last_activity = Instant::now();

    endpoint.send_syn_ack().await?;

    loop {
        if endpoint.is_closed() {
            debug!("{}: closed", endpoint.key);
            return Ok(());
        }

        let window = endpoint.send_window().min(buf.len());
        let can_read = endpoint.established && !proxy_eof && !endpoint.fin_sent && window > 0;
        let rto_deadline = endpoint.retransmit_at;

        tokio::select! {
            input = rx.recv() => {
                let seg = match input {
                    Some(FlowInput::Tcp(seg)) => seg,
                    Some(FlowInput::Udp(_)) => continue,
                    // demultiplexer is gone
                    None => return Err(Error::ConnectionClosed),
                };
                last_activity = Instant::now();

                let (next, written) = endpoint.on_segment(&seg, proxy).await?;
                ctx.metrics.proxy_bytes_sent.inc_by(written as u64);
                if next == Next::Reset {
                    debug!("{}: reset by peer", endpoint.key);
                    return Ok(());
                }
            }

            n = proxy.read(&mut buf[..window]), if can_read => {
                let n = n?;
                last_activity = Instant::now();
                if n == 0 {
                    proxy_eof = true;
                    endpoint.send_fin().await?;
                } else {
                    ctx.metrics.proxy_bytes_received.inc_by(n as u64);
                    endpoint.send_data(&buf[..n]).await?;
                }
            }

            _ = async {
                match rto_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                endpoint.retransmit().await?;
            }

            _ = sleep_until(last_activity + idle_timeout) => {
                debug!("{}: idle for {:?}", endpoint.key, idle_timeout);
                return Err(Error::ConnectionClosed);
            }

            _ = stop.changed() => {
                return Err(Error::ConnectionClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::EngineMetrics;
    use crate::device::{MemoryDevice, MemoryHandle};
    use crate::packet::Packet;
    use bytes::Bytes;

    fn key() -> FlowKey {
        FlowKey::new(
            crate::common::Network::Tcp,
            "10.0.0.2:50000".parse().unwrap(),
            "93.184.216.34:80".parse().unwrap(),
        )
    }

    fn syn(seq: u32) -> TcpInput {
        TcpInput {
            seq,
            ack: 0,
            flags: tcp_flags::SYN,
            window: 1000,
            mss: Some(100),
            payload: Bytes::new(),
        }
    }

    fn endpoint() -> (TcpEndpoint, MemoryHandle) {
        let (device, handle) = MemoryDevice::pair(16);
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let writer = PacketWriter::new(Arc::new(device), metrics);
        (TcpEndpoint::new(key(), writer, &syn(1000), 1460), handle)
    }

    async fn next_segment(handle: &mut MemoryHandle) -> (u32, u32, u8, Vec<u8>) {
        let frame = handle.next_packet().await.unwrap();
        match Packet::parse(&frame).unwrap() {
            Packet::Tcp { segment, .. } => (
                segment.seq,
                segment.ack,
                segment.flags,
                segment.payload.to_vec(),
            ),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    fn ack(seq: u32, ack: u32, payload: &[u8]) -> TcpInput {
        TcpInput {
            seq,
            ack,
            flags: tcp_flags::ACK,
            window: 1000,
            mss: None,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_sequence_comparison_wraps() {
        assert!(seq_lt(u32::MAX - 1, 3));
        assert!(seq_gt(3, u32::MAX - 1));
        assert!(!seq_lt(5, 5));
    }

    #[test]
    fn test_advertised_mss() {
        assert_eq!(advertised_mss(&key(), 4096), 4056);
        assert_eq!(advertised_mss(&key(), 100), DEFAULT_PEER_MSS);
    }

    #[tokio::test]
    async fn test_handshake_and_in_order_delivery() {
        let (mut ep, mut handle) = endpoint();
        let (client, mut server) = tokio::io::duplex(1024);
        let mut proxy: Stream = Box::new(client);

        ep.send_syn_ack().await.unwrap();
        let (iss, ack_no, flags, _) = next_segment(&mut handle).await;
        assert_eq!(flags, tcp_flags::SYN | tcp_flags::ACK);
        assert_eq!(ack_no, 1001);

        // ACK of SYN-ACK carrying data
        let (next, written) = ep
            .on_segment(&ack(1001, iss.wrapping_add(1), b"GET /"), &mut proxy)
            .await
            .unwrap();
        assert_eq!(next, Next::Continue);
        assert_eq!(written, 5);
        assert!(ep.established);

        let mut got = [0u8; 5];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"GET /");

        let (_, ack_no, flags, _) = next_segment(&mut handle).await;
        assert_eq!(flags, tcp_flags::ACK);
        assert_eq!(ack_no, 1006);
    }

    #[tokio::test]
    async fn test_out_of_order_and_duplicate_are_reacked() {
        let (mut ep, mut handle) = endpoint();
        let (client, _server) = tokio::io::duplex(1024);
        let mut proxy: Stream = Box::new(client);

        ep.send_syn_ack().await.unwrap();
        let (iss, ..) = next_segment(&mut handle).await;
        let our_ack = iss.wrapping_add(1);

        // gap: expected 1001
        let (_, written) = ep.on_segment(&ack(1010, our_ack, b"late"), &mut proxy).await.unwrap();
        assert_eq!(written, 0);
        let (_, ack_no, ..) = next_segment(&mut handle).await;
        assert_eq!(ack_no, 1001);

        ep.on_segment(&ack(1001, our_ack, b"abc"), &mut proxy).await.unwrap();
        next_segment(&mut handle).await;

        // retransmission of the same bytes
        let (_, written) = ep.on_segment(&ack(1001, our_ack, b"abc"), &mut proxy).await.unwrap();
        assert_eq!(written, 0);
        let (_, ack_no, ..) = next_segment(&mut handle).await;
        assert_eq!(ack_no, 1004);
    }

    #[tokio::test]
    async fn test_send_respects_mss_and_window() {
        let (mut ep, mut handle) = endpoint();
        let (client, _server) = tokio::io::duplex(1024);
        let mut proxy: Stream = Box::new(client);

        ep.send_syn_ack().await.unwrap();
        let (iss, ..) = next_segment(&mut handle).await;
        ep.on_segment(&ack(1001, iss.wrapping_add(1), b""), &mut proxy)
            .await
            .unwrap();
        assert_eq!(ep.send_window(), 1000);

        ep.send_data(&[7u8; 250]).await.unwrap();
        let sizes: Vec<usize> = vec![
            next_segment(&mut handle).await.3.len(),
            next_segment(&mut handle).await.3.len(),
            next_segment(&mut handle).await.3.len(),
        ];
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(ep.in_flight(), 250);
        assert_eq!(ep.send_window(), 750);

        // partial ack
        ep.on_ack(iss.wrapping_add(101), 1000);
        assert_eq!(ep.in_flight(), 150);
        assert_eq!(ep.unacked.len(), 150);

        // retransmit resends the oldest segment
        ep.retransmit().await.unwrap();
        let (seq, _, _, payload) = next_segment(&mut handle).await;
        assert_eq!(seq, iss.wrapping_add(101));
        assert_eq!(payload.len(), 100);
    }

    #[tokio::test]
    async fn test_fin_exchange_closes() {
        let (mut ep, mut handle) = endpoint();
        let (client, mut server) = tokio::io::duplex(1024);
        let mut proxy: Stream = Box::new(client);

        ep.send_syn_ack().await.unwrap();
        let (iss, ..) = next_segment(&mut handle).await;
        let our_ack = iss.wrapping_add(1);

        let mut fin = ack(1001, our_ack, b"");
        fin.flags |= tcp_flags::FIN;
        ep.on_segment(&fin, &mut proxy).await.unwrap();
        assert!(ep.fin_received);
        let (_, ack_no, ..) = next_segment(&mut handle).await;
        assert_eq!(ack_no, 1002);

        // proxy saw the half-close
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        ep.send_fin().await.unwrap();
        assert!(!ep.is_closed());
        ep.on_ack(our_ack.wrapping_add(1), 1000);
        assert!(ep.is_closed());
    }

    #[tokio::test]
    async fn test_rst_from_peer() {
        let (mut ep, _handle) = endpoint();
        let (client, _server) = tokio::io::duplex(64);
        let mut proxy: Stream = Box::new(client);

        let mut rst = ack(1001, 0, b"");
        rst.flags = tcp_flags::RST;
        let (next, _) = ep.on_segment(&rst, &mut proxy).await.unwrap();
        assert_eq!(next, Next::Reset);
    }

    #[tokio::test]
    async fn test_retransmit_gives_up() {
        let (mut ep, mut handle) = endpoint();
        ep.send_syn_ack().await.unwrap();
        for _ in 0..MAX_RETRANSMITS {
            ep.retransmit().await.unwrap();
        }
        assert!(matches!(ep.retransmit().await, Err(Error::ConnectionTimeout)));
        assert!(handle.next_packet().await.is_some());
    }
}
