//! Filters: pipeline stages that receive one event at a time and emit zero or
//! more events downstream

mod connect;

pub use connect::{Connect, ConnectState, ConnectTarget};

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::ProxyError;
use crate::event::{Event, EventSink};

/// What a filter sees while processing an event
pub struct StageContext<'a> {
    pub context: &'a Arc<Context>,
    /// Index of this filter's slot in the context
    pub slot: usize,
    /// Input queue of the next stage
    pub output: &'a EventSink,
}

impl<'a> StageContext<'a> {
    pub fn new(context: &'a Arc<Context>, slot: usize, output: &'a EventSink) -> Self {
        Self { context, slot, output }
    }

    pub fn emit(&self, event: Event) -> bool {
        self.output.send(event)
    }
}

#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Independent instance sharing only immutable configuration
    fn clone_filter(&self) -> Box<dyn Filter>;

    /// Handle one event. May suspend; the pipeline does not deliver the next
    /// event for this context until it returns.
    ///
    /// An error aborts this stage; the pipeline turns it into a
    /// `StreamEnd(error)` on the stage's output.
    async fn process(&mut self, ctx: &StageContext<'_>, event: Event) -> Result<(), ProxyError>;

    /// Drop per-stream state so the instance can serve another stream
    fn reset(&mut self) {}
}
