//! flowbus：进程内按键发布/订阅的事件总线
//!
//! - 生产者按字符串键投递类型化的值，消费者按键订阅；
//! - 普通键只投递订阅之后的值，粘性键额外回放最近一次的值；
//! - 总线按键懒创建、共享，在没有订阅者也没有绑定中的作用域时自动回收。
//!
//! 可以显式持有一个 `BusRegistry`，也可以使用进程级的全局注册表
//! （`init` / `with` / `with_sticky` / `clear`）。
//!
pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logger;
pub mod registry;

pub use bus::{
    BusInfo, EventBus, EventObserver, ObserveHandle, ObserverId, Payload, PostHandle,
    ScopeOptions, TaskId,
};
pub use config::BusConfig;
pub use error::{BusError, BusResult};
pub use lifecycle::{Lifecycle, LifecycleState, Scope, ScopeState, StateCallback};
pub use logger::{BusLogger, NoopLogger, TracingLogger};
pub use registry::{BusRegistry, Namespace};

use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<BusRegistry> = OnceLock::new();

/// 用给定配置初始化全局注册表；只能在首次使用前调用一次
pub fn init(config: BusConfig) -> BusResult<()> {
    GLOBAL
        .set(BusRegistry::with_config(config))
        .map_err(|_| BusError::AlreadyInitialized)
}

/// 全局注册表，未初始化时使用默认配置
pub fn global() -> &'static BusRegistry {
    GLOBAL.get_or_init(BusRegistry::new)
}

/// 全局注册表上的普通总线
pub fn with<T: Payload>(key: &str) -> BusResult<Arc<EventBus<T>>> {
    global().get(key)
}

/// 全局注册表上的粘性总线
pub fn with_sticky<T: Payload>(key: &str) -> BusResult<Arc<EventBus<T>>> {
    global().get_sticky(key)
}

/// 回收全局注册表中的全部总线
pub fn clear() {
    global().clear();
}
