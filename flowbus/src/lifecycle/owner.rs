use super::{Scope, ScopeState, StateCallback};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// 生命周期状态，按 `Destroyed < Initialized < Created < Started < Resumed` 排序
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Destroyed,
    Initialized,
    Created,
    Started,
    Resumed,
}

impl ScopeState for LifecycleState {
    fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Destroyed)
    }
}

type SharedCallback = Arc<dyn Fn(LifecycleState) + Send + Sync>;

struct Inner {
    state: LifecycleState,
    observers: Vec<SharedCallback>,
}

/// 可手动驱动的生命周期对象
///
/// 回调在状态锁外、按注册顺序同步调用；到达 `Destroyed` 后回调全部释放，
/// 之后的状态设置被忽略。
///
/// 并发的 `set_state` 通过通知锁串行化，回调看到的状态顺序与状态变化顺序一致。
/// 回调内不能再调用同一对象的 `set_state`。
pub struct Lifecycle {
    inner: Mutex<Inner>,
    notify: Mutex<()>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::with_state(LifecycleState::Initialized)
    }

    pub fn with_state(state: LifecycleState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                observers: Vec::new(),
            }),
            notify: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// 切换状态并通知回调；状态未变化或已销毁时不通知
    pub fn set_state(&self, state: LifecycleState) {
        let _notify = self.notify.lock().unwrap_or_else(PoisonError::into_inner);
        let observers = {
            let mut inner = self.lock();
            if inner.state.is_terminal() || inner.state == state {
                return;
            }
            inner.state = state;
            if state.is_terminal() {
                std::mem::take(&mut inner.observers)
            } else {
                inner.observers.clone()
            }
        };
        for observer in observers {
            observer(state);
        }
    }

    pub fn destroy(&self) {
        self.set_state(LifecycleState::Destroyed);
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }
}

impl Scope for Lifecycle {
    type State = LifecycleState;

    fn current_state(&self) -> LifecycleState {
        self.state()
    }

    fn add_observer(&self, observer: StateCallback<LifecycleState>) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            let state = inner.state;
            drop(inner);
            observer(state);
            return;
        }
        inner.observers.push(Arc::from(observer));
    }
}
