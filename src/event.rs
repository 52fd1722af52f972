use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ProxyError;

/// 过滤器链中流动的事件
///
/// 单向传递：每个阶段一次处理一个事件，向下一阶段输出零个或多个事件
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// 数据负载
    Data(Bytes),
    /// 消息开始（UDP 中对应一个数据报）
    MessageStart,
    /// 消息结束
    MessageEnd,
    /// 流结束，异常结束时携带错误
    StreamEnd(Option<ProxyError>),
}

impl Event {
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Event::Data(payload.into())
    }

    /// 正常结束
    pub fn end() -> Self {
        Event::StreamEnd(None)
    }

    pub fn is_stream_end(&self) -> bool {
        matches!(self, Event::StreamEnd(_))
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Event::Data(_))
    }

    /// 负载字节数，标记事件为 0
    pub fn payload_len(&self) -> usize {
        match self {
            Event::Data(bytes) => bytes.len(),
            _ => 0,
        }
    }

    /// 异常 `StreamEnd` 的错误
    pub fn error(&self) -> Option<&ProxyError> {
        match self {
            Event::StreamEnd(Some(err)) => Some(err),
            _ => None,
        }
    }
}

impl From<Bytes> for Event {
    fn from(bytes: Bytes) -> Self {
        Event::Data(bytes)
    }
}

impl From<ProxyError> for Event {
    fn from(error: ProxyError) -> Self {
        Event::StreamEnd(Some(error))
    }
}

#[derive(Debug, Default)]
struct SinkStats {
    events: AtomicU64,
    bytes: AtomicU64,
    ended: AtomicBool,
}

/// 阶段输出队列的发送端
///
/// Outbound 持有一个克隆作为回复通道，回复与过滤器自身输出进入同一队列
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
    stats: Arc<SinkStats>,
}

impl EventSink {
    /// 创建发送端及对应的接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                stats: Arc::new(SinkStats::default()),
            },
            rx,
        )
    }

    /// 向下游发送事件，接收端已关闭时返回 false
    pub fn send(&self, event: Event) -> bool {
        self.stats.events.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes
            .fetch_add(event.payload_len() as u64, Ordering::Relaxed);
        if event.is_stream_end() {
            self.stats.ended.store(true, Ordering::Release);
        }

        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!("downstream gone, dropping {:?}", e.0);
                false
            }
        }
    }

    /// 是否已经发送过 `StreamEnd`
    pub fn has_ended(&self) -> bool {
        self.stats.ended.load(Ordering::Acquire)
    }

    pub fn events_sent(&self) -> u64 {
        self.stats.events.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.stats.bytes.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
