//! Engine controller
//!
//! Owns everything one tunnel instance needs: the config cache, the proxy
//! connection pool, the retry table, metrics and the performance history.
//! Several engines can live in one process without sharing state.
//!
//! ```text
//! start(source)
//!   → validate config → resolve descriptor → open device
//!   → run loop: read frame → demux → session tasks
//!   → stop(): flag observed at the next wakeup, flows drained, pool closed
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::common::{Result, Stream};
use crate::config::{Config, ConfigSource, ConfigValidator};
use crate::device::{InterfaceResolver, TunDevice};
use crate::error::Error;
use crate::protocol::Socks5Client;
use crate::session::{RetryTable, SessionContext};
use crate::stack::{Demux, PacketWriter};
use crate::transport::{ConnectionPool, ProxyConnector, TcpTransport};

use super::metrics::{format_bytes, EngineMetrics, MetricsSnapshot};
use super::resource::{self, ResourceUsage};

/// Interval of the maintenance tick
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Samples kept in the performance history
pub const PERFORMANCE_HISTORY: usize = 100;

/// How long teardown waits for flows before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// Health thresholds
const MAX_CPU_PERCENT: f64 = 80.0;
const MAX_RESIDENT_BYTES: u64 = 512 * 1024 * 1024;
const MAX_HANDSHAKE_SECS: f64 = 5.0;
const MAX_ERROR_RATE: f64 = 0.05;

/// One performance sample
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSample {
    /// CPU used since the previous sample, in percent of one core
    pub cpu_usage: f64,
    /// Peak resident size in bytes
    pub memory_usage: u64,
    /// Mean SOCKS5 handshake time in seconds
    pub connection_latency: f64,
    /// Interface bytes per second since the previous sample
    pub throughput: f64,
    /// Pending retries relative to the retry budget of tracked flows
    pub error_rate: f64,
    /// Seconds since the engine was created or last cleaned up
    pub uptime: f64,
}

impl PerformanceSample {
    pub fn is_healthy(&self) -> bool {
        self.cpu_usage < MAX_CPU_PERCENT
            && self.memory_usage < MAX_RESIDENT_BYTES
            && self.connection_latency < MAX_HANDSHAKE_SECS
            && self.error_rate < MAX_ERROR_RATE
    }
}

/// State that only exists while the loop runs
#[derive(Clone)]
struct LiveState {
    pool: ConnectionPool<Stream>,
    retries: Arc<RetryTable>,
}

/// Baseline for the next performance sample
struct HealthClock {
    last_check: SystemTime,
    started: Instant,
    sampled_at: Instant,
    usage: ResourceUsage,
    total_bytes: u64,
}

impl HealthClock {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            last_check: SystemTime::now(),
            started: now,
            sampled_at: now,
            usage: resource::current(),
            total_bytes: 0,
        }
    }
}

/// Held from the moment a start is accepted until the engine is idle again.
/// Clears the running flag however startup or the loop exits.
struct RunningGuard(Arc<Shared>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

struct Shared {
    id: Uuid,
    validator: ConfigValidator,
    resolver: Arc<dyn InterfaceResolver>,
    metrics: Arc<EngineMetrics>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    live: Mutex<Option<LiveState>>,
    history: Mutex<VecDeque<PerformanceSample>>,
    health: Mutex<HealthClock>,
}

/// A tunnel engine instance. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(resolver: impl InterfaceResolver + 'static) -> Result<Self> {
        Self::with_resolver(Arc::new(resolver))
    }

    pub fn with_resolver(resolver: Arc<dyn InterfaceResolver>) -> Result<Self> {
        let (stop_tx, _) = watch::channel(false);
        let shared = Shared {
            id: Uuid::new_v4(),
            validator: ConfigValidator::new(),
            resolver,
            metrics: Arc::new(EngineMetrics::new()?),
            running: AtomicBool::new(false),
            stop_tx,
            live: Mutex::new(None),
            history: Mutex::new(VecDeque::with_capacity(PERFORMANCE_HISTORY)),
            health: Mutex::new(HealthClock::new()),
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Validate, resolve and run until stopped, on a dedicated
    /// single-threaded runtime. Returns 0 on a clean stop, otherwise the
    /// error's exit code.
    ///
    /// [`Engine::stop`] at any point after the call, including
    /// while the config is validated or the interface resolved, ends it
    /// with 0.
    pub fn start(&self, source: &ConfigSource) -> i32 {
        let result = self
            .claim()
            .and_then(|guard| self.start_blocking(source, guard));
        self.exit_code(result)
    }

    fn exit_code(&self, result: Result<()>) -> i32 {
        match result {
            Ok(()) => {
                info!("[{}] Stopped", self.short_id());
                0
            }
            Err(e) => {
                error!("[{}] Engine failed: {}", self.short_id(), e);
                e.exit_code()
            }
        }
    }

    /// Mark the engine running and arm a fresh stop flag
    fn claim(&self) -> Result<RunningGuard> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        self.shared.stop_tx.send_replace(false);
        Ok(RunningGuard(self.shared.clone()))
    }

    fn stop_requested(&self) -> bool {
        *self.shared.stop_tx.borrow()
    }

    fn start_blocking(&self, source: &ConfigSource, guard: RunningGuard) -> Result<()> {
        let config = self.shared.validator.validate(source)?;
        if self.stop_requested() {
            return Ok(());
        }

        let descriptor = self.shared.resolver.resolve()?;
        debug!("[{}] Using descriptor {}", self.short_id(), descriptor);
        if self.stop_requested() {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(async {
            let device = self.shared.resolver.open(descriptor, config.packet_info)?;
            if self.stop_requested() {
                return Ok(());
            }
            self.run_claimed(config, device, guard).await
        })
    }

    /// Run [`Engine::start`] on a background thread. The exit code goes to
    /// `callback` and to the returned receiver.
    ///
    /// If the thread cannot be spawned the receiver resolves with an error
    /// and `callback` is never called.
    pub fn start_async<F>(&self, source: ConfigSource, callback: F) -> oneshot::Receiver<i32>
    where
        F: FnOnce(i32) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        // claimed here so a stop() right after this call is not lost
        let guard = match self.claim() {
            Ok(guard) => guard,
            Err(e) => {
                let code = self.exit_code(Err(e));
                callback(code);
                let _ = tx.send(code);
                return rx;
            }
        };

        let engine = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("sockstun-{}", self.short_id()))
            .spawn(move || {
                let code = engine.exit_code(engine.start_blocking(&source, guard));
                callback(code);
                let _ = tx.send(code);
            });

        if let Err(e) = spawned {
            error!("[{}] Cannot spawn engine thread: {}", self.short_id(), e);
        }
        rx
    }

    /// The main loop, for hosts that already own a runtime and a device.
    pub async fn run(&self, config: Arc<Config>, device: Arc<dyn TunDevice>) -> Result<()> {
        let guard = self.claim()?;
        self.run_claimed(config, device, guard).await
    }

    async fn run_claimed(
        &self,
        config: Arc<Config>,
        device: Arc<dyn TunDevice>,
        _guard: RunningGuard,
    ) -> Result<()> {
        let stop = self.shared.stop_tx.subscribe();

        info!(
            "[{}] sockstun v{} on {} via {} ({})",
            self.short_id(),
            env!("CARGO_PKG_VERSION"),
            device.name(),
            config.server,
            config.listen
        );

        let pool = ConnectionPool::new(config.pool_size, config.pool_idle_timeout);
        let retries = Arc::new(RetryTable::new(config.retry_limit));
        *self.shared.live.lock() = Some(LiveState {
            pool: pool.clone(),
            retries: retries.clone(),
        });

        let ctx = Arc::new(SessionContext {
            connector: ProxyConnector::new(
                Arc::new(TcpTransport::new()),
                config.server.clone(),
                config.handshake_timeout,
            ),
            client: Socks5Client::new(config.socks5_config()),
            writer: PacketWriter::new(device.clone(), self.shared.metrics.clone()),
            metrics: self.shared.metrics.clone(),
            stop: stop.clone(),
            pool,
            retries,
            config,
        });

        let mut demux = Demux::new(ctx.clone());
        let mut refill = None;
        let result = self
            .serve(&ctx, &mut demux, &mut refill, device.as_ref(), stop)
            .await;

        // sessions watch the same flag
        self.shared.stop_tx.send_replace(true);
        if let Some(task) = refill.take() {
            task.abort();
        }
        demux.shutdown(SHUTDOWN_GRACE).await;
        let closed = ctx.pool.clear();
        *self.shared.live.lock() = None;

        let snapshot = self.metrics();
        info!(
            "[{}] Closed {} pooled connections; out {} packets / {}, in {} packets / {}",
            self.short_id(),
            closed,
            snapshot.outbound.packets,
            format_bytes(snapshot.outbound.bytes),
            snapshot.inbound.packets,
            format_bytes(snapshot.inbound.bytes)
        );

        result
    }

    async fn serve(
        &self,
        ctx: &Arc<SessionContext>,
        demux: &mut Demux,
        refill: &mut Option<JoinHandle<()>>,
        device: &dyn TunDevice,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut buf = vec![0u8; ctx.config.buffer_size];
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if *stop.borrow_and_update() {
                info!("[{}] Stop requested", self.short_id());
                return Ok(());
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }

                Some((key, id)) = demux.next_closed() => {
                    demux.remove(key, Some(id));
                }

                _ = heartbeat.tick() => {
                    self.heartbeat(ctx, refill);
                }

                n = device.read_packet(&mut buf) => match n {
                    Ok(0) => {}
                    Ok(n) => {
                        self.shared.metrics.record_outbound(n);
                        let outcome = demux.dispatch(&buf[..n]).await;
                        trace!("Frame of {} bytes: {:?}", n, outcome);
                    }
                    Err(Error::ConnectionClosed) => {
                        info!("[{}] Interface closed", self.short_id());
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }

    fn heartbeat(&self, ctx: &SessionContext, refill: &mut Option<JoinHandle<()>>) {
        let sample = self.collect_performance();
        if sample.is_healthy() {
            trace!("[{}] Health: {:?}", self.short_id(), sample);
        } else {
            warn!(
                "[{}] Unhealthy: cpu {:.1}%, memory {}, latency {:.3}s, error rate {:.3}",
                self.short_id(),
                sample.cpu_usage,
                format_bytes(sample.memory_usage),
                sample.connection_latency,
                sample.error_rate
            );
        }
        self.shared.health.lock().last_check = SystemTime::now();

        let purged = self.shared.validator.purge_expired();
        let expired = ctx.pool.cleanup();
        if purged > 0 || expired > 0 {
            debug!(
                "[{}] Purged {} config entries, {} idle connections",
                self.short_id(),
                purged,
                expired
            );
        }

        let target = ctx.config.pool_prewarm;
        let busy = refill.as_ref().is_some_and(|task| !task.is_finished());
        if target > ctx.pool.idle_count() && !busy {
            let pool = ctx.pool.clone();
            let connector = ctx.connector.clone();
            *refill = Some(tokio::spawn(async move {
                if let Err(e) = pool.refill(target, || connector.open()).await {
                    debug!("Pool pre-warm stopped: {}", e);
                }
            }));
        }
    }

    /// Traffic counters since the engine was created
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Ask the loop to stop. Safe from any thread, repeated calls are no-ops.
    pub fn stop(&self) {
        if self.is_running() {
            debug!("[{}] Stop signalled", self.short_id());
        }
        self.shared.stop_tx.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Take a performance sample and append it to the bounded history.
    pub fn collect_performance(&self) -> PerformanceSample {
        let usage = resource::current();
        let total_bytes = self.metrics().total_bytes();

        let (retry_total, tracked, limit) = match self.live() {
            Some(live) => (
                live.retries.total(),
                live.retries.len() as u64,
                u64::from(live.retries.limit()),
            ),
            None => (0, 0, 0),
        };
        let budget = (tracked * limit).max(1);

        let sample = {
            let mut clock = self.shared.health.lock();
            let wall = clock.sampled_at.elapsed();
            let sample = PerformanceSample {
                cpu_usage: resource::cpu_percent(&clock.usage, &usage, wall),
                memory_usage: usage.resident_bytes,
                connection_latency: self.shared.metrics.mean_handshake_secs(),
                throughput: total_bytes.saturating_sub(clock.total_bytes) as f64
                    / wall.as_secs_f64().max(1.0),
                error_rate: retry_total as f64 / budget as f64,
                uptime: clock.started.elapsed().as_secs_f64(),
            };
            clock.sampled_at = Instant::now();
            clock.usage = usage;
            clock.total_bytes = total_bytes;
            sample
        };

        let mut history = self.shared.history.lock();
        if history.len() >= PERFORMANCE_HISTORY {
            history.pop_front();
        }
        history.push_back(sample.clone());
        sample
    }

    /// Recorded samples, oldest first
    pub fn performance_history(&self) -> Vec<PerformanceSample> {
        self.shared.history.lock().iter().cloned().collect()
    }

    /// Drop cached configs, idle connections, retry counters and the
    /// performance history.
    pub fn cleanup(&self) {
        self.shared.validator.clear();
        if let Some(live) = self.live() {
            live.pool.clear();
            live.retries.clear();
        }
        self.shared.history.lock().clear();
        *self.shared.health.lock() = HealthClock::new();
        debug!("[{}] Cleaned up", self.short_id());
    }

    /// Snapshot of internal state for host-side diagnostics
    pub fn diagnostics(&self) -> Map<String, Value> {
        let live = self.live();
        let pool = live.as_ref().map(|l| l.pool.stats()).unwrap_or_default();
        let retry_attempts = live.as_ref().map(|l| l.retries.len()).unwrap_or(0);

        let last_check = self
            .shared
            .health
            .lock()
            .last_check
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let cpu = self
            .shared
            .history
            .lock()
            .back()
            .map(|s| s.cpu_usage)
            .unwrap_or(0.0);
        let usage = resource::current();

        let mut map = Map::new();
        map.insert("engine_id".into(), json!(self.shared.id.to_string()));
        map.insert("running".into(), json!(self.is_running()));
        map.insert("cached_configurations".into(), json!(self.shared.validator.len()));
        map.insert("connection_pool_size".into(), json!(pool.idle));
        map.insert("connection_pool_live".into(), json!(pool.live));
        map.insert("connection_pool_capacity".into(), json!(pool.capacity));
        map.insert("connection_pool_reused".into(), json!(pool.reused));
        map.insert(
            "performance_history_count".into(),
            json!(self.shared.history.lock().len()),
        );
        map.insert("retry_attempts".into(), json!(retry_attempts));
        map.insert(
            "active_flows".into(),
            json!(self.shared.metrics.flows_active.get()),
        );
        map.insert("last_health_check".into(), json!(last_check));
        map.insert(
            "memory_usage_mb".into(),
            json!(usage.resident_bytes / 1024 / 1024),
        );
        map.insert("cpu_usage_percent".into(), json!(cpu));
        map
    }

    /// Text exposition of this engine's counters
    pub fn prometheus_text(&self) -> Result<String> {
        self.shared.metrics.encode_text()
    }

    fn live(&self) -> Option<LiveState> {
        self.shared.live.lock().clone()
    }

    fn short_id(&self) -> String {
        self.shared.id.simple().to_string()[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FixedResolver, MemoryDevice};

    const CONFIG: &str = "listen=127.0.0.1:1080\nserver=127.0.0.1:9\ntype=socks5\n";

    #[test]
    fn test_health_thresholds() {
        let mut sample = PerformanceSample {
            cpu_usage: 10.0,
            memory_usage: 64 * 1024 * 1024,
            connection_latency: 0.05,
            throughput: 0.0,
            error_rate: 0.0,
            uptime: 1.0,
        };
        assert!(sample.is_healthy());

        sample.error_rate = 0.05;
        assert!(!sample.is_healthy());
        sample.error_rate = 0.0;
        sample.connection_latency = 6.0;
        assert!(!sample.is_healthy());
    }

    #[test]
    fn test_history_is_bounded() {
        let engine = Engine::new(FixedResolver(0)).unwrap();
        for _ in 0..PERFORMANCE_HISTORY + 5 {
            engine.collect_performance();
        }
        assert_eq!(engine.performance_history().len(), PERFORMANCE_HISTORY);

        engine.cleanup();
        assert!(engine.performance_history().is_empty());
    }

    #[test]
    fn test_diagnostics_keys() {
        let engine = Engine::new(FixedResolver(0)).unwrap();
        let diagnostics = engine.diagnostics();
        for key in [
            "cached_configurations",
            "connection_pool_size",
            "performance_history_count",
            "retry_attempts",
            "last_health_check",
            "memory_usage_mb",
            "cpu_usage_percent",
        ] {
            assert!(diagnostics.contains_key(key), "missing {}", key);
        }
        assert_eq!(diagnostics["running"], json!(false));
    }

    #[test]
    fn test_start_reports_exit_codes() {
        let engine = Engine::new(FixedResolver(0)).unwrap();
        assert_eq!(engine.start(&ConfigSource::text("server=1.2.3.4:1080\n")), 1);
        assert_eq!(
            engine.start(&ConfigSource::file("/nonexistent/sockstun.conf")),
            2
        );

        let engine = Engine::new(FixedResolver(-1)).unwrap();
        assert_eq!(engine.start(&ConfigSource::text(CONFIG)), -1);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_run_stops_when_device_closes() {
        let engine = Engine::new(FixedResolver(0)).unwrap();
        let config = Arc::new(Config::from_text(CONFIG).unwrap());
        let (device, handle) = MemoryDevice::pair(4);
        drop(handle);

        engine.run(config, Arc::new(device)).await.unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let engine = Engine::new(FixedResolver(0)).unwrap();
        let config = Arc::new(Config::from_text(CONFIG).unwrap());
        let (device, _handle) = MemoryDevice::pair(4);

        let first = {
            let engine = engine.clone();
            let config = config.clone();
            tokio::spawn(async move { engine.run(config, Arc::new(device)).await })
        };
        while !engine.is_running() {
            tokio::task::yield_now().await;
        }

        let (other, _other_handle) = MemoryDevice::pair(4);
        let err = engine.run(config, Arc::new(other)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning));

        engine.stop();
        first.await.unwrap().unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_prewarmed_connections_closed_on_stop() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let text = format!(
            "listen=127.0.0.1:1080\nserver={}\ntype=socks5\npool-size=4\npool-prewarm=2\n",
            listener.local_addr().unwrap()
        );
        let config = Arc::new(Config::from_text(&text).unwrap());
        let engine = Engine::new(FixedResolver(0)).unwrap();
        let (device, _handle) = MemoryDevice::pair(4);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(config, Arc::new(device)).await })
        };

        // the first heartbeat fires immediately and pre-warms the pool
        let mut accepted = Vec::new();
        for _ in 0..2 {
            let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
                .await
                .unwrap()
                .unwrap();
            accepted.push(stream);
        }

        engine.stop();
        task.await.unwrap().unwrap();

        for mut stream in accepted {
            let mut buf = [0u8; 1];
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 0);
        }
    }
}
