//! 总线配置（BusConfig）
//!
use crate::error::BusResult;
use crate::logger::{BusLogger, TracingLogger};
use bon::Builder;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;

/// 注册表及其创建的所有总线共享的配置
#[derive(Builder, Clone)]
pub struct BusConfig {
    /// 日志出口，默认转发到 `tracing`
    #[builder(default = default_logger())]
    pub logger: Arc<dyn BusLogger>,
    /// 后台任务使用的运行时；为空时使用调用方所在的运行时
    pub runtime: Option<Handle>,
    /// 是否对每一次投递输出 trace 日志
    #[builder(default)]
    pub trace_deliveries: bool,
}

fn default_logger() -> Arc<dyn BusLogger> {
    Arc::new(TracingLogger)
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            logger: default_logger(),
            runtime: None,
            trace_deliveries: false,
        }
    }
}

impl BusConfig {
    /// 解析后台任务的运行时：显式指定 > 配置 > 当前运行时
    pub(crate) fn runtime_or_current(&self, explicit: Option<&Handle>) -> BusResult<Handle> {
        if let Some(handle) = explicit.or(self.runtime.as_ref()) {
            return Ok(handle.clone());
        }
        Ok(Handle::try_current()?)
    }
}

impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfig")
            .field("runtime", &self.runtime.is_some())
            .field("trace_deliveries", &self.trace_deliveries)
            .finish_non_exhaustive()
    }
}
