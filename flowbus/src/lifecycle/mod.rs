//! 作用域（Scope）协议
//!
//! `observe_scoped` 把一次订阅绑定到宿主的生命周期对象上：
//! - 作用域到达终止状态时订阅被强制取消；
//! - 可选的最低状态（`min_state`）用于在作用域“退到后台”时暂停投递、恢复时重新订阅。
//!
//! 任何具备 {当前状态, 状态监听, 终止状态} 的对象都可以实现 `Scope`，
//! 核心不依赖具体的 UI 框架。`Lifecycle` 是随 crate 提供的一个实现。
//!
pub mod owner;

pub use owner::{Lifecycle, LifecycleState};

use std::fmt::Debug;

/// 作用域状态：全序，且至少存在一个终止状态
pub trait ScopeState: Copy + Ord + Debug + Send + Sync + 'static {
    fn is_terminal(&self) -> bool;
}

/// 状态变化回调
pub type StateCallback<S> = Box<dyn Fn(S) + Send + Sync>;

/// 宿主作用域
///
/// 实现方需要保证：
/// - 每次状态变化都调用已注册的回调（可以在任意线程）；
/// - 在已处于终止状态时注册的回调，会立即收到该终止状态。
pub trait Scope: Send + Sync {
    type State: ScopeState;

    fn current_state(&self) -> Self::State;

    fn add_observer(&self, observer: StateCallback<Self::State>);
}
