//! 日志出口（BusLogger）
//!
//! 总线内部只通过 `BusLogger` 输出日志，宿主可以替换为自己的实现或关闭日志。
//! 默认实现转发到 `tracing`，target 统一为 `flowbus`。
//!
use crate::error::BusError;
use tracing::Level;

/// 日志出口：`log(level, message, error)`
pub trait BusLogger: Send + Sync + 'static {
    fn log(&self, level: Level, message: &str, error: Option<&BusError>);
}

/// 转发到 `tracing` 的默认实现
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl BusLogger for TracingLogger {
    fn log(&self, level: Level, message: &str, error: Option<&BusError>) {
        // tracing 的宏要求 level 为常量，只能逐一展开
        match (level, error) {
            (Level::ERROR, Some(e)) => tracing::error!(target: "flowbus", error = %e, "{message}"),
            (Level::ERROR, None) => tracing::error!(target: "flowbus", "{message}"),
            (Level::WARN, Some(e)) => tracing::warn!(target: "flowbus", error = %e, "{message}"),
            (Level::WARN, None) => tracing::warn!(target: "flowbus", "{message}"),
            (Level::INFO, Some(e)) => tracing::info!(target: "flowbus", error = %e, "{message}"),
            (Level::INFO, None) => tracing::info!(target: "flowbus", "{message}"),
            (Level::DEBUG, Some(e)) => tracing::debug!(target: "flowbus", error = %e, "{message}"),
            (Level::DEBUG, None) => tracing::debug!(target: "flowbus", "{message}"),
            (_, Some(e)) => tracing::trace!(target: "flowbus", error = %e, "{message}"),
            (_, None) => tracing::trace!(target: "flowbus", "{message}"),
        }
    }
}

/// 丢弃所有日志
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLogger;

impl BusLogger for NoopLogger {
    fn log(&self, _level: Level, _message: &str, _error: Option<&BusError>) {}
}
