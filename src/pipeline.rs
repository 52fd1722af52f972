//! Pipeline layouts and running pipeline instances
//!
//! A [`PipelineLayout`] is an ordered list of filter templates plus the
//! slot-array pool sized for them. [`PipelineLayout::spawn`] clones every
//! template, allocates a context with one slot per filter and runs the chain
//! on its own task. Events for the instance are handled strictly in arrival
//! order; a filter that suspends holds back the whole chain for that context.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use crate::context::{Context, ContextDataPool};
use crate::event::{Event, EventSink};
use crate::filter::{Filter, StageContext};
use crate::inbound::InboundRef;
use crate::worker::Worker;

pub struct PipelineLayout {
    name: String,
    templates: Vec<Box<dyn Filter>>,
    pool: Arc<ContextDataPool>,
}

pub struct PipelineLayoutBuilder {
    name: String,
    templates: Vec<(Arc<str>, Box<dyn Filter>)>,
}

impl PipelineLayoutBuilder {
    /// Append a filter; `filename` names the unit that defined it in diagnostics
    pub fn filter(mut self, filename: impl Into<Arc<str>>, filter: impl Filter + 'static) -> Self {
        self.templates.push((filename.into(), Box::new(filter)));
        self
    }

    pub fn build(self, worker: &Worker) -> Arc<PipelineLayout> {
        let (filenames, templates): (Vec<_>, Vec<_>) = self.templates.into_iter().unzip();
        tracing::debug!("pipeline layout '{}' built with {} filters", self.name, templates.len());
        Arc::new(PipelineLayout {
            name: self.name,
            pool: worker.context_pool(filenames),
            templates,
        })
    }
}

impl PipelineLayout {
    pub fn builder(name: impl Into<String>) -> PipelineLayoutBuilder {
        PipelineLayoutBuilder {
            name: name.into(),
            templates: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn pool(&self) -> &Arc<ContextDataPool> {
        &self.pool
    }

    /// Start a pipeline instance for a new stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, worker: &Arc<Worker>, inbound: Option<InboundRef>) -> Pipeline {
        let context = worker.new_context(&self.pool, inbound);
        let filters: Vec<Box<dyn Filter>> = self.templates.iter().map(|t| t.clone_filter()).collect();

        // queue `i` feeds stage `i`; the last queue feeds the pipeline output
        let (input, input_rx) = EventSink::channel();
        let mut queues = StreamMap::new();
        queues.insert(0, UnboundedReceiverStream::new(input_rx));

        let mut stages = Vec::with_capacity(filters.len());
        for (slot, filter) in filters.into_iter().enumerate() {
            let (output, rx) = EventSink::channel();
            queues.insert(slot + 1, UnboundedReceiverStream::new(rx));
            stages.push(Stage {
                filter,
                output,
                failed: false,
            });
        }
        let (output, output_rx) = EventSink::channel();

        let cancel = CancellationToken::new();
        let runner = Runner {
            worker: worker.clone(),
            context: context.clone(),
            stages,
            output,
            queues,
            cancel: cancel.clone(),
        };
        tracing::debug!("▶️ pipeline '{}' started for {}", self.name, context.id());

        Pipeline {
            context,
            input,
            output: output_rx,
            cancel,
            task: Some(tokio::spawn(runner.run())),
        }
    }
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("name", &self.name)
            .field("filters", &self.templates.iter().map(|t| t.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// A running pipeline instance
pub struct Pipeline {
    context: Arc<Context>,
    input: EventSink,
    output: mpsc::UnboundedReceiver<Event>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Feed an event into the first stage
    pub fn send(&self, event: Event) -> bool {
        self.input.send(event)
    }

    /// Next event out of the last stage; `None` once the pipeline has ended
    pub async fn recv(&mut self) -> Option<Event> {
        self.output.recv().await
    }

    /// Tear down: resets every filter (closing their outbounds) and releases the context
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Wait for the runner to finish
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("pipeline task failed: {}", e);
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Stage {
    filter: Box<dyn Filter>,
    output: EventSink,
    failed: bool,
}

struct Runner {
    worker: Arc<Worker>,
    context: Arc<Context>,
    stages: Vec<Stage>,
    output: EventSink,
    queues: StreamMap<usize, UnboundedReceiverStream<Event>>,
    cancel: CancellationToken,
}

impl Runner {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.queues.next() => next,
            };
            let Some((index, event)) = next else {
                break;
            };

            if index == self.stages.len() {
                let end = event.is_stream_end();
                self.output.send(event);
                if end {
                    break;
                }
                continue;
            }
            // a filter may be suspended on a callback that never resolves
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.dispatch(index, event) => {}
            }
        }

        for stage in &mut self.stages {
            stage.filter.reset();
        }
        tracing::debug!("⏹️ pipeline for {} finished", self.context.id());
        self.context.finalize();
    }

    async fn dispatch(&mut self, index: usize, event: Event) {
        let Some(stage) = self.stages.get_mut(index) else {
            return;
        };
        if stage.failed {
            return;
        }

        let ctx = StageContext::new(&self.context, index, &stage.output);
        if let Err(error) = stage.filter.process(&ctx, event).await {
            tracing::warn!("filter '{}' failed on {}: {}", stage.filter.name(), self.context.id(), error);
            self.worker.record_error(&error);
            stage.failed = true;
            stage.output.send(Event::StreamEnd(Some(error)));
        }
    }
}
