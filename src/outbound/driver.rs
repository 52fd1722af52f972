//! Per-outbound task: dial with retries, then pump data both ways

use std::future::pending;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::link::{DialRequest, Dialer, Link, LinkReader, LinkWriter};
use super::{OutboundState, Shared};
use crate::config::ConnectOptions;
use crate::error::{ProxyError, TimeoutPhase};
use crate::event::Event;
use crate::worker::Worker;

pub(super) struct Driver {
    shared: Arc<Shared>,
    dialer: Arc<dyn Dialer>,
    request: DialRequest,
    retry_count: u32,
    retry_delay: Duration,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    commands: mpsc::UnboundedReceiver<Event>,
    cancel: CancellationToken,
    worker: Weak<Worker>,
}

/// How the pump loop ended
enum Exit {
    /// Ends downstream with this state and error
    Finish(OutboundState, Option<ProxyError>),
    /// Cancelled or disarmed; say nothing
    Silent,
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

impl Driver {
    pub(super) fn new(
        shared: Arc<Shared>,
        dialer: Arc<dyn Dialer>,
        request: DialRequest,
        options: &ConnectOptions,
        commands: mpsc::UnboundedReceiver<Event>,
        cancel: CancellationToken,
        worker: Weak<Worker>,
    ) -> Self {
        Self {
            shared,
            dialer,
            request,
            retry_count: options.retry_count,
            retry_delay: options.retry_delay,
            connect_timeout: options.connect_timeout,
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
            idle_timeout: options.idle_timeout,
            commands,
            cancel,
            worker,
        }
    }

    pub(super) async fn run(mut self) {
        let started = Instant::now();
        let Some(link) = self.establish().await else {
            return;
        };

        let Link {
            reader,
            writer,
            local_addr,
            peer_addr,
            framed,
        } = link;

        let connected = self.shared.transition(OutboundState::Connected, |info| {
            info.local_addr = local_addr;
            info.remote_addr = peer_addr;
            info.connection_time = Some(started.elapsed());
        });
        if !connected {
            return;
        }
        tracing::info!(
            "✅ outbound connected to {} ({:?} -> {:?})",
            self.request.target(),
            local_addr,
            peer_addr
        );

        match self.pump(reader, writer, framed).await {
            Exit::Finish(state, error) => {
                if let Some(error) = &error {
                    tracing::warn!("❌ outbound to {} ended: {}", self.request.target(), error);
                    self.record_error(error);
                } else {
                    tracing::debug!("outbound to {} ended", self.request.target());
                }
                self.shared.finish(state, error, true);
            }
            Exit::Silent => {}
        }
    }

    /// Dial up to `retry_count + 1` times. On exhaustion the outbound ends in
    /// `Failed` and `None` is returned.
    async fn establish(&mut self) -> Option<Link> {
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                let entered = self.shared.transition(OutboundState::Retrying, |info| {
                    info.retries = attempt;
                });
                if !entered {
                    return None;
                }
                if let Some(worker) = self.worker.upgrade() {
                    worker.record_retry();
                }
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return None,
                    _ = sleep(self.retry_delay) => {}
                }
            }

            if !self.shared.transition(OutboundState::Connecting, |_| {}) {
                return None;
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = self.dial_once() => result,
            };

            let error = match result {
                Ok(link) => return Some(link),
                Err(error) => error,
            };
            tracing::warn!(
                "⚠️ connect to {} failed (attempt {}/{}): {}",
                self.request.target(),
                attempt + 1,
                self.retry_count.saturating_add(1),
                error
            );

            if attempt >= self.retry_count || !error.is_retryable() {
                tracing::error!("❌ giving up on {} after {} attempts", self.request.target(), attempt + 1);
                self.record_error(&error);
                self.shared.finish(OutboundState::Failed, Some(error), true);
                return None;
            }
            attempt += 1;
        }
    }

    fn record_error(&self, error: &ProxyError) {
        if let Some(worker) = self.worker.upgrade() {
            worker.record_error(error);
        }
    }

    async fn dial_once(&self) -> Result<Link, ProxyError> {
        let target = self.request.target();
        let connect_error =
            |e: std::io::Error| ProxyError::connection_error(format!("connect to {} failed: {}", target, e), true);

        let dial = self.dialer.dial(&self.request);
        match self.connect_timeout.filter(|_| self.dialer.has_handshake()) {
            Some(limit) => match timeout(limit, dial).await {
                Ok(result) => result.map_err(connect_error),
                Err(_) => Err(ProxyError::timeout_error(TimeoutPhase::Connect, limit)),
            },
            None => dial.await.map_err(connect_error),
        }
    }

    async fn pump(&mut self, mut reader: Box<dyn LinkReader>, mut writer: Box<dyn LinkWriter>, framed: bool) -> Exit {
        let deadline = |limit: Option<Duration>| limit.map(|d| Instant::now() + d);
        let mut idle_deadline = deadline(self.idle_timeout);
        let mut read_deadline = deadline(self.read_timeout);
        let mut closing = false;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Exit::Silent,

                command = self.commands.recv(), if !closing => {
                    let Some(event) = command else {
                        return Exit::Silent;
                    };
                    match event {
                        Event::StreamEnd(reason) => {
                            if let Some(error) = reason {
                                return Exit::Finish(OutboundState::Closed, Some(error));
                            }
                            if framed {
                                return Exit::Finish(OutboundState::Closed, None);
                            }
                            if let Err(exit) = self.half_close(writer.as_mut()).await {
                                return exit;
                            }
                            closing = true;
                            if !self.shared.transition(OutboundState::Closing, |_| {}) {
                                return Exit::Silent;
                            }
                        }
                        event => {
                            if let Err(exit) = self.write(writer.as_mut(), event).await {
                                return exit;
                            }
                            idle_deadline = deadline(self.idle_timeout);
                        }
                    }
                }

                result = reader.read() => {
                    match result {
                        Ok(Some(data)) => {
                            let len = data.len() as u64;
                            self.shared.update(|info| info.bytes_received += len);
                            idle_deadline = deadline(self.idle_timeout);
                            read_deadline = deadline(self.read_timeout);
                            if !self.deliver(data, framed) {
                                return Exit::Silent;
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("📥 peer {} closed", self.request.target());
                            return Exit::Finish(OutboundState::Closed, None);
                        }
                        Err(e) => {
                            let error = ProxyError::connection_error(format!("read failed: {}", e), false);
                            return Exit::Finish(OutboundState::Failed, Some(error));
                        }
                    }
                }

                _ = sleep_opt(idle_deadline) => {
                    let limit = self.idle_timeout.unwrap_or_default();
                    return Exit::Finish(OutboundState::Closed, Some(ProxyError::timeout_error(TimeoutPhase::Idle, limit)));
                }

                _ = sleep_opt(read_deadline) => {
                    let limit = self.read_timeout.unwrap_or_default();
                    return Exit::Finish(OutboundState::Closed, Some(ProxyError::timeout_error(TimeoutPhase::Read, limit)));
                }
            }
        }
    }

    fn deliver(&self, data: Bytes, framed: bool) -> bool {
        if framed {
            self.shared
                .relay([Event::MessageStart, Event::Data(data), Event::MessageEnd])
        } else {
            self.shared.relay([Event::Data(data)])
        }
    }

    async fn write(&self, writer: &mut dyn LinkWriter, event: Event) -> Result<(), Exit> {
        let len = event.payload_len();
        let op = async {
            match event {
                Event::Data(data) => writer.write(data).await,
                Event::MessageStart => writer.message_start().await,
                Event::MessageEnd => writer.message_end().await,
                Event::StreamEnd(_) => Ok(()),
            }
        };

        let result = match self.write_timeout {
            Some(limit) => match timeout(limit, op).await {
                Ok(result) => result,
                Err(_) => {
                    let error = ProxyError::timeout_error(TimeoutPhase::Write, limit);
                    return Err(Exit::Finish(OutboundState::Closed, Some(error)));
                }
            },
            None => op.await,
        };

        match result {
            Ok(()) => {
                self.shared.drained(len);
                self.shared.update(|info| info.bytes_sent += len as u64);
                Ok(())
            }
            Err(e) => {
                let error = ProxyError::connection_error(format!("write failed: {}", e), false);
                Err(Exit::Finish(OutboundState::Failed, Some(error)))
            }
        }
    }

    async fn half_close(&self, writer: &mut dyn LinkWriter) -> Result<(), Exit> {
        let op = async {
            writer.flush().await?;
            writer.shutdown().await
        };
        let result = match self.write_timeout {
            Some(limit) => match timeout(limit, op).await {
                Ok(result) => result,
                Err(_) => {
                    let error = ProxyError::timeout_error(TimeoutPhase::Write, limit);
                    return Err(Exit::Finish(OutboundState::Closed, Some(error)));
                }
            },
            None => op.await,
        };
        result.map_err(|e| {
            let error = ProxyError::connection_error(format!("shutdown failed: {}", e), false);
            Exit::Finish(OutboundState::Failed, Some(error))
        })
    }
}
