use std::fmt;
use std::time::Duration;

/// 超时发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutPhase {
    Connect,
    Read,
    Write,
    Idle,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::Read => "read",
            TimeoutPhase::Write => "write",
            TimeoutPhase::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// 统一代理错误类型
///
/// 可克隆，随 `StreamEnd` 事件传递给下游过滤器
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ProxyError {
    /// 配置错误：目标、选项或绑定地址无效，在创建套接字之前中止
    #[error("{reason}")]
    Config {
        field: Option<String>,
        reason: String,
    },

    /// 连接相关错误
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// 超时错误（连接 / 读 / 写 / 空闲）
    #[error("{phase} timeout after {duration:?}")]
    Timeout {
        phase: TimeoutPhase,
        duration: Duration,
    },

    /// 写缓冲区超过上限
    #[error("Buffer overflow: {buffered} bytes buffered, limit {limit}")]
    BufferOverflow {
        buffered: usize,
        limit: usize,
    },

    /// 当前状态下不允许的操作，例如 connect 之后 bind
    #[error("Cannot {operation} while {state}")]
    State {
        operation: String,
        state: String,
    },
}

impl ProxyError {
    /// 判断错误是否可重试
    ///
    /// 只有连接阶段的失败会重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ProxyError::Connection { retryable, .. } => *retryable,
            ProxyError::Timeout { phase, .. } => *phase == TimeoutPhase::Connect,
            ProxyError::Config { .. } => false,
            ProxyError::BufferOverflow { .. } => false,
            ProxyError::State { .. } => false,
        }
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::Config { .. } => "CONFIG_ERROR",
            ProxyError::Connection { .. } => "CONNECT_ERROR",
            ProxyError::Timeout { .. } => "TIMEOUT_ERROR",
            ProxyError::BufferOverflow { .. } => "BUFFER_OVERFLOW_ERROR",
            ProxyError::State { .. } => "STATE_ERROR",
        }
    }
}

/// 便利构造函数
impl ProxyError {
    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::Config {
            field: None,
            reason: reason.into(),
        }
    }

    pub fn field_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: Some(field.into()),
            reason: reason.into(),
        }
    }

    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn timeout_error(phase: TimeoutPhase, duration: Duration) -> Self {
        Self::Timeout { phase, duration }
    }

    pub fn buffer_overflow(buffered: usize, limit: usize) -> Self {
        Self::BufferOverflow { buffered, limit }
    }

    pub fn state_error(operation: impl Into<String>, state: impl fmt::Display) -> Self {
        Self::State {
            operation: operation.into(),
            state: state.to_string(),
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::AddrNotAvailable
                | std::io::ErrorKind::NotFound
                | std::io::ErrorKind::Interrupted
        );

        ProxyError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}

impl From<crate::config::ConfigError> for ProxyError {
    fn from(error: crate::config::ConfigError) -> Self {
        ProxyError::Config {
            field: error.field().map(str::to_string),
            reason: error.to_string(),
        }
    }
}

/// 错误统计
#[derive(Debug, Default, Clone)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub config_errors: u64,
    pub connection_errors: u64,
    pub timeout_errors: u64,
    pub overflow_errors: u64,
    pub state_errors: u64,
    pub retries: u64,
    pub last_error: Option<ProxyError>,
}

impl ErrorStats {
    pub fn record_error(&mut self, error: &ProxyError) {
        self.total_errors += 1;

        match error {
            ProxyError::Config { .. } => self.config_errors += 1,
            ProxyError::Connection { .. } => self.connection_errors += 1,
            ProxyError::Timeout { .. } => self.timeout_errors += 1,
            ProxyError::BufferOverflow { .. } => self.overflow_errors += 1,
            ProxyError::State { .. } => self.state_errors += 1,
        }

        self.last_error = Some(error.clone());
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
