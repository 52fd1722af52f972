use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use super::{Filter, StageContext};
use crate::address::{parse_bind, parse_host_port};
use crate::config::{ConnectConfig, ConnectOptions};
use crate::error::ProxyError;
use crate::event::Event;
use crate::options::{resolve_bind, OptionsSource, Setting};
use crate::outbound::{Backpressure, Outbound, OutboundInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Unbound,
    Attaching,
    Attached,
    Closed,
}

/// Resolved target, kept in the filter's context slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

/// Relays the stream to an upstream server over a lazily created [`Outbound`]
///
/// The first event resolves target, options and bind against the context and
/// starts the connection; payload is forwarded to the outbound from then on.
/// Replies from the outbound land directly in this stage's output.
pub struct Connect {
    target: Setting<Value>,
    options: OptionsSource,
    outbound: Option<Outbound>,
    state: ConnectState,
}

impl Connect {
    pub fn new(target: Setting<Value>, options: OptionsSource) -> Self {
        Self {
            target,
            options,
            outbound: None,
            state: ConnectState::Unbound,
        }
    }

    /// Fixed target and static options
    pub fn fixed(target: impl Into<String>, options: ConnectOptions) -> Self {
        Self::new(Setting::Static(Value::String(target.into())), OptionsSource::Static(options))
    }

    pub fn from_config(config: &ConnectConfig) -> Result<Self, ProxyError> {
        config.validate()?;
        Ok(Self::fixed(config.target.clone(), config.options()?))
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    pub fn outbound(&self) -> Option<&Outbound> {
        self.outbound.as_ref()
    }

    pub fn outbound_info(&self) -> Option<OutboundInfo> {
        self.outbound.as_ref().map(Outbound::info)
    }

    async fn attach(&mut self, ctx: &StageContext<'_>) -> Result<(), ProxyError> {
        let target = match self.target.resolve(ctx.context).await? {
            Value::String(target) => target,
            _ => return Err(ProxyError::field_error("target", "target expected to be or return a string")),
        };
        let (host, port) = parse_host_port(&target)
            .ok_or_else(|| ProxyError::field_error("target", format!("invalid target format: {}", target)))?;

        let options = self.options.resolve(ctx.context).await?;
        let bind = resolve_bind(&options, ctx.context).await?;

        let mut outbound = Outbound::new(&options, ctx.output.clone())?;
        if let Some(worker) = ctx.context.worker() {
            outbound.report_to(&worker);
        }
        if let Some(bind) = bind {
            let (ip, bind_port) = parse_bind(&bind);
            outbound.bind(&ip, bind_port)?;
        }
        outbound.connect(&host, port)?;

        ctx.context.data(ctx.slot).set(ConnectTarget { host, port });
        self.outbound = Some(outbound);
        Ok(())
    }

    fn forward(&self, event: Event) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        match outbound.send(event) {
            Ok(Backpressure::Clear) => {}
            Ok(Backpressure::Congested) => {
                tracing::debug!("outbound congested ({} bytes buffered)", outbound.buffered());
            }
            // the outbound has already ended the stream downstream
            Err(e) => tracing::debug!("dropped event for outbound: {}", e),
        }
    }
}

#[async_trait]
impl Filter for Connect {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(Connect::new(self.target.clone(), self.options.clone()))
    }

    async fn process(&mut self, ctx: &StageContext<'_>, event: Event) -> Result<(), ProxyError> {
        match self.state {
            ConnectState::Unbound if event.is_stream_end() => {
                ctx.emit(event);
                self.state = ConnectState::Closed;
            }
            ConnectState::Unbound => {
                self.state = ConnectState::Attaching;
                if let Err(e) = self.attach(ctx).await {
                    tracing::warn!("❌ connect filter failed to attach: {}", e);
                    self.state = ConnectState::Closed;
                    return Err(e);
                }
                self.state = ConnectState::Attached;
                self.forward(event);
            }
            ConnectState::Attached => {
                let end = event.is_stream_end();
                self.forward(event);
                if end {
                    self.state = ConnectState::Closed;
                }
            }
            ConnectState::Attaching => {
                return Err(ProxyError::state_error("process", "attaching"));
            }
            ConnectState::Closed => {
                tracing::trace!("connect filter closed, dropping {:?}", event);
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        if let Some(mut outbound) = self.outbound.take() {
            outbound.close();
        }
        self.state = ConnectState::Unbound;
    }
}

impl fmt::Debug for Connect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connect")
            .field("target", &self.target)
            .field("options", &self.options)
            .field("state", &self.state)
            .field("outbound", &self.outbound)
            .finish()
    }
}
