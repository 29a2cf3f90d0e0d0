//! IP demultiplexer
//!
//! Classifies frames read from the interface by 5-tuple and hands them to
//! per-flow session tasks. The reader is the only producer for each flow
//! channel, so segments reach a session in interface order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::common::{FlowKey, Network};
use crate::packet::{build_tcp, tcp_flags, Packet, TcpFields, TcpSegment};
use crate::session::{run_tcp, run_udp, FlowInput, SessionContext, TcpInput};

/// Frames queued per flow before new ones are dropped
const FLOW_QUEUE: usize = 256;

struct FlowHandle {
    id: u64,
    tx: mpsc::Sender<FlowInput>,
}

/// Reports a finished flow, also when its task panics or is aborted.
struct ClosedGuard {
    key: FlowKey,
    id: u64,
    closed: mpsc::UnboundedSender<(FlowKey, u64)>,
}

impl Drop for ClosedGuard {
    fn drop(&mut self) {
        let _ = self.closed.send((self.key, self.id));
    }
}

/// Outcome of feeding one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    NewFlow,
    Malformed,
    Unsupported,
    /// Refused at the flow limit
    Rejected,
    /// Unknown TCP flow answered with RST
    Reset,
    Dropped,
}

/// Flow table plus the tasks serving it
pub struct Demux {
    ctx: Arc<SessionContext>,
    flows: HashMap<FlowKey, FlowHandle>,
    tasks: JoinSet<()>,
    closed_tx: mpsc::UnboundedSender<(FlowKey, u64)>,
    closed_rx: mpsc::UnboundedReceiver<(FlowKey, u64)>,
    next_id: u64,
    max_flows: usize,
}

impl Demux {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let max_flows = ctx.config.max_flows;

        Self {
            ctx,
            flows: HashMap::new(),
            tasks: JoinSet::new(),
            closed_tx,
            closed_rx,
            next_id: 0,
            max_flows,
        }
    }

    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Classify one frame and route it.
    pub async fn dispatch(&mut self, frame: &[u8]) -> Dispatch {
        let packet = match Packet::parse(frame) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("Dropping frame: {}", e);
                self.ctx.metrics.packets_malformed.inc();
                return Dispatch::Malformed;
            }
        };

        match packet {
            Packet::Tcp { src, dst, segment } => self.dispatch_tcp(src, dst, &segment).await,
            Packet::Udp { src, dst, payload } => self.dispatch_udp(src, dst, payload),
            Packet::Unsupported(protocol) => {
                trace!("Dropping frame with protocol {}", protocol);
                self.ctx.metrics.packets_unsupported.inc();
                Dispatch::Unsupported
            }
        }
    }

    async fn dispatch_tcp(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        segment: &TcpSegment<'_>,
    ) -> Dispatch {
        let key = FlowKey::new(Network::Tcp, src, dst);
        let input = TcpInput::from_segment(segment);

        let input = match self.deliver(&key, FlowInput::Tcp(input)) {
            Ok(dispatch) => return dispatch,
            Err(FlowInput::Tcp(input)) => input,
            Err(FlowInput::Udp(_)) => return Dispatch::Dropped,
        };

        if !input.is_syn() {
            if input.has(tcp_flags::RST) {
                return Dispatch::Dropped;
            }
            self.reset(&key, &input).await;
            return Dispatch::Reset;
        }

        if self.flows.len() >= self.max_flows {
            debug!("{}: flow limit {} reached", key, self.max_flows);
            self.ctx.metrics.flows_rejected.inc();
            self.reset(&key, &input).await;
            return Dispatch::Rejected;
        }

        let (tx, rx) = mpsc::channel(FLOW_QUEUE);
        let ctx = self.ctx.clone();
        self.spawn(key, tx, run_tcp(ctx, key, input, rx));
        Dispatch::NewFlow
    }

    fn dispatch_udp(&mut self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Dispatch {
        let key = FlowKey::new(Network::Udp, src, dst);
        let input = FlowInput::Udp(Bytes::copy_from_slice(payload));

        let input = match self.deliver(&key, input) {
            Ok(dispatch) => return dispatch,
            Err(input) => input,
        };

        if self.flows.len() >= self.max_flows {
            debug!("{}: flow limit {} reached", key, self.max_flows);
            self.ctx.metrics.flows_rejected.inc();
            return Dispatch::Rejected;
        }

        let (tx, rx) = mpsc::channel(FLOW_QUEUE);
        if tx.try_send(input).is_err() {
            return Dispatch::Dropped;
        }
        let ctx = self.ctx.clone();
        self.spawn(key, tx, run_udp(ctx, key, rx));
        Dispatch::NewFlow
    }

    /// Push into an existing flow. Gives the input back when there is no
    /// live flow for `key`.
    fn deliver(&mut self, key: &FlowKey, input: FlowInput) -> Result<Dispatch, FlowInput> {
        let Some(handle) = self.flows.get(key) else {
            return Err(input);
        };

        match handle.tx.try_send(input) {
            Ok(()) => Ok(Dispatch::Delivered),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.ctx.metrics.packets_dropped.inc();
                Ok(Dispatch::Dropped)
            }
            Err(mpsc::error::TrySendError::Closed(input)) => {
                // session ended, its close notice is still in flight
                self.remove(*key, None);
                Err(input)
            }
        }
    }

    fn spawn<F>(&mut self, key: FlowKey, tx: mpsc::Sender<FlowInput>, session: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.next_id += 1;
        let id = self.next_id;
        let guard = ClosedGuard {
            key,
            id,
            closed: self.closed_tx.clone(),
        };

        self.tasks.spawn(async move {
            let _guard = guard;
            session.await;
        });
        self.flows.insert(key, FlowHandle { id, tx });

        self.ctx
            .metrics
            .flows_total
            .with_label_values(&[key.network.to_string().as_str()])
            .inc();
        self.ctx.metrics.flows_active.set(self.flows.len() as i64);
        debug!("{}: new flow", key);
    }

    /// Answer a segment for an unknown flow with RST (RFC 9293 §3.10.7.1).
    async fn reset(&self, key: &FlowKey, input: &TcpInput) {
        let fields = if input.has(tcp_flags::ACK) {
            TcpFields {
                seq: input.ack,
                flags: tcp_flags::RST,
                ..Default::default()
            }
        } else {
            let seg_len = input.payload.len() as u32
                + u32::from(input.has(tcp_flags::SYN))
                + u32::from(input.has(tcp_flags::FIN));
            TcpFields {
                seq: 0,
                ack: input.seq.wrapping_add(seg_len),
                flags: tcp_flags::RST | tcp_flags::ACK,
                ..Default::default()
            }
        };

        let frame = match build_tcp(key.destination, key.source, &fields, &[]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: cannot build RST: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.ctx.writer.write(&frame).await {
            debug!("{}: RST not written: {}", key, e);
        }
    }

    /// Resolves when a flow task ends. Never yields `None` while the demux
    /// is alive, since it holds a sender itself.
    pub async fn next_closed(&mut self) -> Option<(FlowKey, u64)> {
        // reap finished tasks so the set does not grow
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!("Flow task panicked: {}", e);
                }
            }
        }
        self.closed_rx.recv().await
    }

    /// Drop the table entry for a finished flow. `id` guards against
    /// removing a newer flow that reused the same 5-tuple.
    pub fn remove(&mut self, key: FlowKey, id: Option<u64>) {
        let matches = match (self.flows.get(&key), id) {
            (Some(handle), Some(id)) => handle.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            self.flows.remove(&key);
            self.ctx.metrics.flows_active.set(self.flows.len() as i64);
            trace!("{}: flow removed", key);
        }
    }

    /// Close every flow: drop their queues, wait up to `grace` for the
    /// tasks to finish, then abort the rest.
    pub async fn shutdown(mut self, grace: Duration) {
        self.flows.clear();
        self.ctx.metrics.flows_active.set(0);

        let pending = self.tasks.len();
        if pending > 0 {
            debug!("Waiting for {} flows", pending);
        }

        let drained = tokio::time::timeout(grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Aborting {} flows after {:?}", self.tasks.len(), grace);
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::EngineMetrics;
    use crate::config::Config;
    use crate::device::{MemoryDevice, MemoryHandle};
    use crate::packet::build_udp;
    use crate::protocol::Socks5Client;
    use crate::session::RetryTable;
    use crate::stack::PacketWriter;
    use crate::transport::{ConnectionPool, ProxyConnector, TcpTransport};
    use tokio::sync::watch;

    const CONFIG: &str = "listen=127.0.0.1:1080\nserver=127.0.0.1:9\ntype=socks5\nmax-flows=1\n";

    fn context() -> (Arc<SessionContext>, MemoryHandle, watch::Sender<bool>) {
        let config = Arc::new(Config::from_text(CONFIG).unwrap());
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let (device, handle) = MemoryDevice::pair(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        let ctx = SessionContext {
            pool: ConnectionPool::new(config.pool_size, config.pool_idle_timeout),
            connector: ProxyConnector::new(
                Arc::new(TcpTransport::new()),
                config.server.clone(),
                config.handshake_timeout,
            ),
            client: Socks5Client::new(config.socks5_config()),
            retries: Arc::new(RetryTable::new(config.retry_limit)),
            writer: PacketWriter::new(Arc::new(device), metrics.clone()),
            metrics,
            stop: stop_rx,
            config,
        };
        (Arc::new(ctx), handle, stop_tx)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn tcp_frame(src: &str, flags: u8, seq: u32, ack: u32) -> Vec<u8> {
        let fields = TcpFields {
            seq,
            ack,
            flags,
            window: 65535,
            mss: None,
        };
        build_tcp(addr(src), addr("93.184.216.34:80"), &fields, b"").unwrap()
    }

    fn parse_tcp(frame: &[u8]) -> (SocketAddr, u32, u32, u8) {
        match Packet::parse(frame).unwrap() {
            Packet::Tcp { dst, segment, .. } => (dst, segment.seq, segment.ack, segment.flags),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unsupported_counted() {
        let (ctx, _handle, _stop) = context();
        let mut demux = Demux::new(ctx.clone());

        assert_eq!(demux.dispatch(&[0x45, 0]).await, Dispatch::Malformed);

        let mut icmp = build_udp(addr("10.0.0.2:1"), addr("10.0.0.1:2"), b"x").unwrap();
        icmp[9] = 1;
        assert_eq!(demux.dispatch(&icmp).await, Dispatch::Unsupported);

        assert_eq!(ctx.metrics.packets_malformed.get(), 1);
        assert_eq!(ctx.metrics.packets_unsupported.get(), 1);
        assert_eq!(demux.active_flows(), 0);
    }

    #[tokio::test]
    async fn test_unknown_segment_answered_with_rst() {
        let (ctx, mut handle, _stop) = context();
        let mut demux = Demux::new(ctx);

        let frame = tcp_frame("10.0.0.2:40000", tcp_flags::ACK, 10, 777);
        assert_eq!(demux.dispatch(&frame).await, Dispatch::Reset);

        let rst = handle.next_packet().await.unwrap();
        let (dst, seq, _, flags) = parse_tcp(&rst);
        assert_eq!(dst, addr("10.0.0.2:40000"));
        assert_eq!(seq, 777);
        assert_eq!(flags, tcp_flags::RST);

        // RST for an unknown flow is never answered
        let frame = tcp_frame("10.0.0.2:40000", tcp_flags::RST, 10, 0);
        assert_eq!(demux.dispatch(&frame).await, Dispatch::Dropped);
        assert!(handle.try_next_packet().is_none());
        assert_eq!(demux.active_flows(), 0);
    }

    #[tokio::test]
    async fn test_flow_limit_and_delivery() {
        let (ctx, mut handle, stop) = context();
        let mut demux = Demux::new(ctx.clone());

        let syn = tcp_frame("10.0.0.2:40001", tcp_flags::SYN, 500, 0);
        assert_eq!(demux.dispatch(&syn).await, Dispatch::NewFlow);
        assert_eq!(demux.active_flows(), 1);

        // retransmitted SYN goes to the same flow
        assert_eq!(demux.dispatch(&syn).await, Dispatch::Delivered);

        let other = tcp_frame("10.0.0.2:40002", tcp_flags::SYN, 900, 0);
        assert_eq!(demux.dispatch(&other).await, Dispatch::Rejected);
        assert_eq!(ctx.metrics.flows_rejected.get(), 1);

        let rst = handle.next_packet().await.unwrap();
        let (dst, _, ack, flags) = parse_tcp(&rst);
        assert_eq!(dst, addr("10.0.0.2:40002"));
        assert_eq!(ack, 901);
        assert_eq!(flags, tcp_flags::RST | tcp_flags::ACK);

        let udp = build_udp(addr("10.0.0.2:5353"), addr("8.8.8.8:53"), b"q").unwrap();
        assert_eq!(demux.dispatch(&udp).await, Dispatch::Rejected);

        stop.send(true).unwrap();
        demux.shutdown(Duration::from_secs(5)).await;
        assert_eq!(ctx.metrics.flows_active.get(), 0);
    }

    #[tokio::test]
    async fn test_closed_flow_is_removed_by_id() {
        let (ctx, _handle, stop) = context();
        let mut demux = Demux::new(ctx);

        let syn = tcp_frame("10.0.0.2:40003", tcp_flags::SYN, 1, 0);
        demux.dispatch(&syn).await;
        let key = FlowKey::new(Network::Tcp, addr("10.0.0.2:40003"), addr("93.184.216.34:80"));

        // a stale notice for an older flow leaves the entry alone
        demux.remove(key, Some(0));
        assert_eq!(demux.active_flows(), 1);

        stop.send(true).unwrap();
        let (closed, id) = demux.next_closed().await.unwrap();
        assert_eq!(closed, key);
        demux.remove(closed, Some(id));
        assert_eq!(demux.active_flows(), 0);
    }
}
