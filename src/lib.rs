//! relayflow - 可编程代理的数据面核心
//!
//! 数据流进入由过滤器布局构建的 [`pipeline::Pipeline`]。每个管道实例持有一个
//! 池化的 [`Context`]，每个过滤器一个槽位，并弱引用创建它的入站连接。
//! [`filter::Connect`] 过滤器通过 [`Outbound`] 把数据流转发到上游服务器，
//! Outbound 是带重试、背压和超时的 TCP/UDP 连接状态机。所有错误都以单个
//! `StreamEnd(error)` 事件到达下游。

// 地址与配置
pub mod address;
pub mod config;
pub mod options;

// 核心类型
pub mod error;
pub mod event;

// 执行模型
pub mod context;
pub mod inbound;
pub mod worker;

// 过滤器与连接
pub mod filter;
pub mod outbound;
pub mod pipeline;

pub type Result<T> = std::result::Result<T, ProxyError>;

// 重新导出核心类型
pub use config::{ConfigError, ConnectConfig, ConnectOptions, Protocol, WorkerConfig};
pub use context::{Context, ContextDataBase, ContextDataPool, ContextId};
pub use error::{ErrorStats, ProxyError, TimeoutPhase};
pub use event::{Event, EventSink};
pub use filter::{Connect, Filter, StageContext};
pub use inbound::{Inbound, InboundInfo, InboundRef, InboundRegistry};
pub use options::{OptionsSource, Setting};
pub use outbound::{Backpressure, Outbound, OutboundInfo, OutboundState};
pub use pipeline::{Pipeline, PipelineLayout};
pub use worker::Worker;
