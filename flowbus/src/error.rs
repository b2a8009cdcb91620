//! 事件总线统一错误定义
//!
//! 投递异常（观察者回调失败）会在投递点被捕获并记录，不会向调用方传播；
//! 这里的错误类型只覆盖调用方真正需要处理的情形：类型不匹配、缺少运行时、
//! 全局注册表重复初始化等。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    // --- 注册表 ---
    #[error("type mismatch: key={key}, expected={expected}, found={found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("registry closed: key={key}")]
    RegistryClosed { key: String },
    #[error("global registry already initialized")]
    AlreadyInitialized,

    // --- 运行时/任务 ---
    #[error("no tokio runtime available: {reason}")]
    NoRuntime { reason: String },
    #[error("post cancelled: key={key}")]
    PostCancelled { key: String },
    #[error("task join error: {reason}")]
    Join { reason: String },

    // --- 观察者 ---
    #[error("observer error: {reason}")]
    Observer { reason: String },
    #[error("observer panicked: {reason}")]
    ObserverPanicked { reason: String },
}

impl BusError {
    /// 供观察者回调返回的失败
    pub fn observer(reason: impl Into<String>) -> Self {
        BusError::Observer {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;

impl From<tokio::task::JoinError> for BusError {
    fn from(err: tokio::task::JoinError) -> Self {
        BusError::Join {
            reason: err.to_string(),
        }
    }
}

impl From<tokio::runtime::TryCurrentError> for BusError {
    fn from(err: tokio::runtime::TryCurrentError) -> Self {
        BusError::NoRuntime {
            reason: err.to_string(),
        }
    }
}
