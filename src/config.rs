//! 配置层
//!
//! 选项对象以 `serde_json::Value` 形式传入，解析失败不会留下半应用的快照

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::options::Setting;
use crate::outbound::{OutboundInfo, StateCallback};

/// 配置错误
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for option '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Invalid address: {address} - {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("{message}")]
    Invalid { message: String },
}

impl ConfigError {
    fn invalid_value(field: &str, value: &Value, reason: &str) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    /// 出错的选项名
    pub fn field(&self) -> Option<&str> {
        match self {
            ConfigError::InvalidValue { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Outbound 使用的传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(ConfigError::InvalidValue {
                field: "protocol".to_string(),
                value: s.to_string(),
                reason: "expected \"tcp\" or \"udp\"".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// 值语法
// ---------------------------------------------------------------------------

/// 解析 `"64k"`、`"16MB"`、`"1024"` 为字节数（单位按 1024 计）
pub fn parse_binary_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: f64 = number.parse().ok()?;
    let scale: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1024.0,
        "m" | "mb" => 1024.0 * 1024.0,
        "g" | "gb" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    let bytes = number * scale;
    if !bytes.is_finite() || bytes < 0.0 {
        return None;
    }
    Some(bytes as usize)
}

/// 解析 `"500ms"`、`"1.5s"`、`"2m"`、`"1h"`、`"1d"`，纯数字按秒计
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: f64 = number.parse().ok()?;
    let seconds = match unit.trim().to_ascii_lowercase().as_str() {
        "ms" => number / 1000.0,
        "" | "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        "d" => number * 86400.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(seconds).ok()
}

/// 缺失和 `null` 都视为未设置
fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(v) => Some(v),
    }
}

pub fn get_bool(obj: &Map<String, Value>, key: &str) -> Result<Option<bool>, ConfigError> {
    match field(obj, key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(v) => Err(ConfigError::invalid_value(key, v, "expected a boolean")),
    }
}

pub fn get_count(obj: &Map<String, Value>, key: &str) -> Result<Option<u32>, ConfigError> {
    match field(obj, key) {
        None => Ok(None),
        Some(v @ Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| ConfigError::invalid_value(key, v, "expected a non-negative integer")),
        Some(v) => Err(ConfigError::invalid_value(key, v, "expected a non-negative integer")),
    }
}

pub fn get_binary_size(obj: &Map<String, Value>, key: &str) -> Result<Option<usize>, ConfigError> {
    let parsed = match field(obj, key) {
        None => return Ok(None),
        Some(Value::Number(n)) => n.as_f64().filter(|f| *f >= 0.0).map(|f| f as usize),
        Some(Value::String(s)) => parse_binary_size(s),
        Some(_) => None,
    };
    match parsed {
        Some(size) => Ok(Some(size)),
        None => Err(ConfigError::invalid_value(
            key,
            &obj[key],
            "expected a size such as 1024, \"64k\" or \"16m\"",
        )),
    }
}

pub fn get_seconds(obj: &Map<String, Value>, key: &str) -> Result<Option<Duration>, ConfigError> {
    let parsed = match field(obj, key) {
        None => return Ok(None),
        Some(Value::Number(n)) => n.as_f64().and_then(|f| Duration::try_from_secs_f64(f).ok()),
        Some(Value::String(s)) => parse_duration(s),
        Some(_) => None,
    };
    match parsed {
        Some(d) => Ok(Some(d)),
        None => Err(ConfigError::invalid_value(
            key,
            &obj[key],
            "expected seconds or a duration such as \"500ms\" or \"5s\"",
        )),
    }
}

/// 超时为 0 表示不限时
fn time_limit(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

pub fn get_string<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<Option<&'a str>, ConfigError> {
    match field(obj, key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(v) => Err(ConfigError::invalid_value(key, v, "expected a string")),
    }
}

// ---------------------------------------------------------------------------
// 连接选项
// ---------------------------------------------------------------------------

/// 一次连接尝试使用的选项快照
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// 传输协议，默认 TCP
    pub protocol: Protocol,
    /// 本地绑定地址，`host[:port]` 字符串或返回它的回调
    pub bind: Option<Setting<Value>>,
    /// 每次 Outbound 状态变化时调用
    pub on_state: Option<StateCallback>,
    /// 拥塞水位线
    pub congestion_limit: Option<usize>,
    /// 缓冲区上限，超过即关闭连接
    pub buffer_limit: Option<usize>,
    /// 首次连接失败后的重试次数
    pub retry_count: u32,
    /// 每次重试前的固定延迟
    pub retry_delay: Duration,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub keep_alive: bool,
    pub no_delay: bool,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析选项对象，忽略未知键
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        Self::default().merge_value(value)
    }

    /// 用 `value` 中存在的键覆盖当前选项
    ///
    /// 缺失的键保持原值，模板上设置的回调选项在动态覆盖后仍然有效
    pub fn merge_value(mut self, value: &Value) -> Result<Self, ConfigError> {
        let obj = value.as_object().ok_or_else(|| ConfigError::Invalid {
            message: format!("options expected to be an object, got {}", value),
        })?;

        if let Some(protocol) = get_string(obj, "protocol")? {
            self.protocol = protocol.parse()?;
        }
        if let Some(bind) = get_string(obj, "bind")? {
            self.bind = Some(Setting::Static(Value::String(bind.to_string())));
        }
        if let Some(limit) = get_binary_size(obj, "congestionLimit")? {
            self.congestion_limit = Some(limit);
        }
        if let Some(limit) = get_binary_size(obj, "bufferLimit")? {
            self.buffer_limit = Some(limit);
        }
        if let Some(count) = get_count(obj, "retryCount")? {
            self.retry_count = count;
        }
        if let Some(delay) = get_seconds(obj, "retryDelay")? {
            self.retry_delay = delay;
        }
        if let Some(t) = get_seconds(obj, "connectTimeout")? {
            self.connect_timeout = time_limit(t);
        }
        if let Some(t) = get_seconds(obj, "readTimeout")? {
            self.read_timeout = time_limit(t);
        }
        if let Some(t) = get_seconds(obj, "writeTimeout")? {
            self.write_timeout = time_limit(t);
        }
        if let Some(t) = get_seconds(obj, "idleTimeout")? {
            self.idle_timeout = time_limit(t);
        }
        if let Some(b) = get_bool(obj, "keepAlive")? {
            self.keep_alive = b;
        }
        if let Some(b) = get_bool(obj, "noDelay")? {
            self.no_delay = b;
        }

        self.validate()?;
        Ok(self)
    }

    /// 仅做提示，类型正确的取值组合都会被接受
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(congestion), Some(buffer)) = (self.congestion_limit, self.buffer_limit) {
            if congestion > buffer {
                tracing::warn!(
                    "⚠️ congestionLimit ({}) above bufferLimit ({}), sends overflow before signalling congestion",
                    congestion,
                    buffer
                );
            }
        }
        Ok(())
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = Some(Setting::Static(Value::String(bind.into())));
        self
    }

    pub fn with_bind_setting(mut self, bind: Setting<Value>) -> Self {
        self.bind = Some(bind);
        self
    }

    pub fn with_on_state<F>(mut self, f: F) -> Self
    where
        F: Fn(&OutboundInfo) + Send + Sync + 'static,
    {
        self.on_state = Some(Arc::new(f));
        self
    }

    pub fn with_congestion_limit(mut self, limit: usize) -> Self {
        self.congestion_limit = Some(limit);
        self
    }

    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = Some(limit);
        self
    }

    pub fn with_retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = time_limit(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = time_limit(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = time_limit(timeout);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = time_limit(timeout);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("protocol", &self.protocol)
            .field("bind", &self.bind)
            .field("on_state", &self.on_state.is_some())
            .field("congestion_limit", &self.congestion_limit)
            .field("buffer_limit", &self.buffer_limit)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("keep_alive", &self.keep_alive)
            .field("no_delay", &self.no_delay)
            .finish()
    }
}

/// Connect 过滤器的声明式配置，可从 JSON 或 TOML 加载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// 上游 `host:port`
    pub target: String,
    /// 选项对象，见 [`ConnectOptions::from_value`]
    #[serde(default)]
    pub options: Value,
}

impl ConnectConfig {
    pub fn options(&self) -> Result<ConnectOptions, ConfigError> {
        match &self.options {
            Value::Null => Ok(ConnectOptions::default()),
            value => ConnectOptions::from_value(value),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if crate::address::parse_host_port(&self.target).is_none() {
            return Err(ConfigError::InvalidAddress {
                address: self.target.clone(),
                reason: "expected host:port".to_string(),
            });
        }
        self.options().map(|_| ())
    }
}

/// Worker 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 日志中使用的名称
    pub name: String,
    /// 每个管道布局缓存的槽数组数量
    pub context_pool_capacity: usize,
    /// 传给该 worker 创建的每个上下文的全局对象
    pub global: Value,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            context_pool_capacity: 1024,
            global: Value::Null,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid {
                message: "worker name must not be empty".to_string(),
            });
        }
        if !matches!(self.global, Value::Null | Value::Object(_)) {
            return Err(ConfigError::InvalidValue {
                field: "global".to_string(),
                value: self.global.to_string(),
                reason: "expected an object".to_string(),
            });
        }
        Ok(())
    }
}
