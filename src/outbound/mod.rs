//! Outbound connections
//!
//! An [`Outbound`] is owned by the filter that created it. `connect` spawns a
//! driver task that dials (with retries), then pumps data both ways until the
//! stream ends. Everything the task reports to the outside world (state
//! notifications and reply events) goes through one mutex-guarded emitter,
//! which `close` disarms. After `close` returns nothing fires again.

mod driver;
mod link;
#[cfg(feature = "tcp")]
mod tcp;
#[cfg(feature = "udp")]
mod udp;

pub use link::{DialRequest, Dialer, Link, LinkReader, LinkWriter};
#[cfg(feature = "tcp")]
pub use tcp::TcpDialer;
#[cfg(feature = "udp")]
pub use udp::UdpDialer;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectOptions, Protocol};
use crate::error::ProxyError;
use crate::event::{Event, EventSink};
use crate::worker::Worker;
use driver::Driver;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundState {
    Idle,
    Binding,
    Connecting,
    Retrying,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl OutboundState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboundState::Closed | OutboundState::Failed)
    }
}

impl fmt::Display for OutboundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutboundState::Idle => "idle",
            OutboundState::Binding => "binding",
            OutboundState::Connecting => "connecting",
            OutboundState::Retrying => "retrying",
            OutboundState::Connected => "connected",
            OutboundState::Closing => "closing",
            OutboundState::Closed => "closed",
            OutboundState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot handed to `onState` callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundInfo {
    pub protocol: Protocol,
    pub state: OutboundState,
    pub host: String,
    pub port: u16,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Retries made so far
    pub retries: u32,
    /// Time from `connect` to `Connected`
    pub connection_time: Option<Duration>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error: Option<ProxyError>,
}

impl OutboundInfo {
    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            state: OutboundState::Idle,
            host: String::new(),
            port: 0,
            local_addr: None,
            remote_addr: None,
            retries: 0,
            connection_time: None,
            bytes_sent: 0,
            bytes_received: 0,
            error: None,
        }
    }
}

/// Invoked on every state transition, in transition order.
///
/// Runs without the outbound's state lock held, so it may query the outbound
/// it is attached to or send to it.
pub type StateCallback = Arc<dyn Fn(&OutboundInfo) + Send + Sync>;

/// Result of a successful [`Outbound::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    Clear,
    /// Buffered bytes are above the congestion limit; upstream should pause
    Congested,
}

struct Sinks {
    reply: EventSink,
    on_state: Option<StateCallback>,
}

struct Inner {
    info: OutboundInfo,
    /// `None` once the outbound has finished or been closed
    sinks: Option<Sinks>,
}

/// State shared between the handle and its driver task
pub(crate) struct Shared {
    /// Serializes notifications; reentrant so a callback may end the outbound
    notify: ReentrantMutex<()>,
    inner: Mutex<Inner>,
    buffered: AtomicUsize,
    congestion_limit: Option<usize>,
    congested: watch::Sender<bool>,
}

impl Shared {
    fn new(protocol: Protocol, reply: EventSink, options: &ConnectOptions) -> Self {
        let (congested, _) = watch::channel(false);
        Self {
            notify: ReentrantMutex::new(()),
            inner: Mutex::new(Inner {
                info: OutboundInfo::new(protocol),
                sinks: Some(Sinks {
                    reply,
                    on_state: options.on_state.clone(),
                }),
            }),
            buffered: AtomicUsize::new(0),
            congestion_limit: options.congestion_limit,
            congested,
        }
    }

    fn state(&self) -> OutboundState {
        self.inner.lock().info.state
    }

    fn info(&self) -> OutboundInfo {
        self.inner.lock().info.clone()
    }

    fn is_armed(&self) -> bool {
        self.inner.lock().sinks.is_some()
    }

    /// Apply `update`, enter `state` and notify. Returns false once disarmed.
    fn transition(&self, state: OutboundState, update: impl FnOnce(&mut OutboundInfo)) -> bool {
        let _serial = self.notify.lock();
        let (snapshot, on_state) = {
            let mut inner = self.inner.lock();
            let Inner { info, sinks } = &mut *inner;
            let Some(sinks) = sinks else {
                return false;
            };

            update(info);
            tracing::debug!("outbound {} {} -> {}", info.protocol, info.state, state);
            info.state = state;
            (info.clone(), sinks.on_state.clone())
        };

        if let Some(on_state) = on_state {
            on_state(&snapshot);
        }
        true
    }

    fn update(&self, update: impl FnOnce(&mut OutboundInfo)) {
        update(&mut self.inner.lock().info);
    }

    /// Relay reply events downstream, keeping them ordered with notifications
    fn relay(&self, events: impl IntoIterator<Item = Event>) -> bool {
        let inner = self.inner.lock();
        match &inner.sinks {
            Some(sinks) => {
                for event in events {
                    sinks.reply.send(event);
                }
                true
            }
            None => false,
        }
    }

    /// Enter a terminal state and disarm. With `notify_downstream` a single
    /// `StreamEnd` carrying `error` is emitted after the state notification.
    fn finish(&self, state: OutboundState, error: Option<ProxyError>, notify_downstream: bool) -> bool {
        let _serial = self.notify.lock();
        let (snapshot, sinks) = {
            let mut inner = self.inner.lock();
            let Some(sinks) = inner.sinks.take() else {
                return false;
            };

            let info = &mut inner.info;
            tracing::debug!("outbound {} {} -> {} ({:?})", info.protocol, info.state, state, error);
            info.state = state;
            info.error = error.clone();
            (info.clone(), sinks)
        };

        self.buffered.store(0, Ordering::Release);
        self.congested.send_replace(false);
        if let Some(on_state) = &sinks.on_state {
            on_state(&snapshot);
        }
        if notify_downstream {
            sinks.reply.send(Event::StreamEnd(error));
        }
        true
    }

    /// Account for a send; returns the new buffered total
    fn enqueue(&self, len: usize) -> usize {
        self.buffered.fetch_add(len, Ordering::AcqRel) + len
    }

    /// Account for bytes handed to the socket
    fn drained(&self, len: usize) {
        let previous = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(len)))
            .unwrap_or_default();
        let now = previous.saturating_sub(len);

        if let Some(limit) = self.congestion_limit {
            if now <= limit {
                self.congested.send_if_modified(|congested| std::mem::replace(congested, false));
            }
        }
    }
}

/// Asynchronous client connection over TCP or UDP
pub struct Outbound {
    shared: Arc<Shared>,
    dialer: Arc<dyn Dialer>,
    options: ConnectOptions,
    bind: Option<SocketAddr>,
    commands: mpsc::UnboundedSender<Event>,
    pending: Option<mpsc::UnboundedReceiver<Event>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Receives retry and failure counts
    worker: Weak<Worker>,
}

impl Outbound {
    /// Outbound for `options.protocol`, replying into `reply`
    pub fn new(options: &ConnectOptions, reply: EventSink) -> Result<Self, ProxyError> {
        let dialer: Arc<dyn Dialer> = match options.protocol {
            #[cfg(feature = "tcp")]
            Protocol::Tcp => Arc::new(TcpDialer),
            #[cfg(feature = "udp")]
            Protocol::Udp => Arc::new(UdpDialer),
            #[allow(unreachable_patterns)]
            other => {
                return Err(ProxyError::field_error(
                    "protocol",
                    format!("{} support is not compiled in", other),
                ))
            }
        };
        Ok(Self::with_dialer(options, reply, dialer))
    }

    /// Outbound over a custom transport
    pub fn with_dialer(options: &ConnectOptions, reply: EventSink, dialer: Arc<dyn Dialer>) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared::new(dialer.protocol(), reply, options)),
            dialer,
            options: options.clone(),
            bind: None,
            commands,
            pending: Some(pending),
            cancel: CancellationToken::new(),
            task: None,
            worker: Weak::new(),
        }
    }

    /// Account retries and terminal errors in `worker`'s error stats
    pub fn report_to(&mut self, worker: &Arc<Worker>) {
        self.worker = Arc::downgrade(worker);
    }

    pub fn protocol(&self) -> Protocol {
        self.dialer.protocol()
    }

    pub fn state(&self) -> OutboundState {
        self.shared.state()
    }

    pub fn info(&self) -> OutboundInfo {
        self.shared.info()
    }

    /// Bytes accepted by `send` and not yet handed to the socket
    pub fn buffered(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    /// Flips to `true` while above the congestion limit
    pub fn congestion(&self) -> watch::Receiver<bool> {
        self.shared.congested.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == OutboundState::Connected
    }

    /// Set the local endpoint. Only valid before `connect`.
    pub fn bind(&mut self, ip: &str, port: u16) -> Result<(), ProxyError> {
        let state = self.state();
        if self.task.is_some() || !matches!(state, OutboundState::Idle | OutboundState::Binding) {
            return Err(ProxyError::state_error("bind", state));
        }

        let ip: IpAddr = ip
            .parse()
            .map_err(|_| ProxyError::field_error("bind", format!("invalid bind address: {}", ip)))?;
        self.bind = Some(SocketAddr::new(ip, port));
        self.shared.transition(OutboundState::Binding, |_| {});
        Ok(())
    }

    /// Start connecting to `host:port`. Returns immediately; progress is
    /// reported through `onState` and the reply sink.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ProxyError> {
        let state = self.state();
        if self.task.is_some() || !matches!(state, OutboundState::Idle | OutboundState::Binding) {
            return Err(ProxyError::state_error("connect", state));
        }
        let Some(commands) = self.pending.take() else {
            return Err(ProxyError::state_error("connect", state));
        };

        self.shared.update(|info| {
            info.host = host.to_string();
            info.port = port;
        });

        let request = DialRequest {
            host: host.to_string(),
            port,
            bind: self.bind,
            keep_alive: self.options.keep_alive,
            no_delay: self.options.no_delay,
        };
        tracing::debug!("🔌 outbound {} connecting to {}", self.protocol(), request.target());

        let driver = Driver::new(
            self.shared.clone(),
            self.dialer.clone(),
            request,
            &self.options,
            commands,
            self.cancel.clone(),
            self.worker.clone(),
        );
        self.task = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Queue an event for the peer.
    ///
    /// Data sent before the connection is up is buffered and flushed once
    /// connected. Crossing the buffer limit closes the outbound with
    /// `BufferOverflow`, which is also delivered downstream.
    pub fn send(&self, event: Event) -> Result<Backpressure, ProxyError> {
        if !self.shared.is_armed() || self.cancel.is_cancelled() {
            return Err(ProxyError::state_error("send", self.state()));
        }

        let len = event.payload_len();
        let buffered = self.shared.enqueue(len);
        if let Some(limit) = self.options.buffer_limit {
            if buffered > limit {
                let error = ProxyError::buffer_overflow(buffered, limit);
                tracing::warn!("⚠️ outbound buffer overflow: {} > {}", buffered, limit);
                if let Some(worker) = self.worker.upgrade() {
                    worker.record_error(&error);
                }
                self.shared.finish(OutboundState::Closed, Some(error.clone()), true);
                self.cancel.cancel();
                return Err(error);
            }
        }

        let backpressure = match self.options.congestion_limit {
            Some(limit) if buffered > limit => {
                self.shared.congested.send_if_modified(|congested| !std::mem::replace(congested, true));
                Backpressure::Congested
            }
            _ => Backpressure::Clear,
        };

        self.commands
            .send(event)
            .map_err(|_| ProxyError::state_error("send", self.state()))?;
        Ok(backpressure)
    }

    /// Cancel timers and in-flight I/O, discard buffered data and enter
    /// `Closed`. Idempotent; no callback fires after this returns.
    pub fn close(&mut self) {
        if self.shared.finish(OutboundState::Closed, None, false) {
            tracing::debug!("🔌 outbound {} closed locally", self.protocol());
        }
        self.cancel.cancel();
        self.pending = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info();
        f.debug_struct("Outbound")
            .field("protocol", &info.protocol)
            .field("state", &info.state)
            .field("target", &crate::address::format_host_port(&info.host, info.port))
            .field("buffered", &self.buffered())
            .finish()
    }
}
