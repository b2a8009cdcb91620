//! 事件总线（EventBus）
//!
//! 每个键对应一个总线，总线包装一个 `Channel` 并负责：
//! - `post` / `post_delayed`：立即或延迟入队；
//! - `observe_forever`：不绑定作用域的订阅，必须与 `unregister` 成对使用，否则订阅者永久泄露；
//! - `observe_scoped`：绑定到 `Scope` 的订阅，作用域终止时自动取消；
//! - 回收：活跃订阅者为 0 且没有绑定中的作用域时，总线取消全部任务并从注册表移除自身。
//!
//! 回收判定只在两个时机触发：通道订阅者数量归零的推送、作用域进入终止状态
//! （`unregister` 摘除订阅后立即判定，等价于前者）。判定与新增订阅者共用同一把锁，
//! 因此不会出现“刚判定回收、又有订阅者接入”的竞态。
//!
//! 已回收的总线不会被复用：持有旧 `Arc<EventBus<T>>` 的调用方继续 `post`/`observe_*`
//! 时，调用会转交给注册表中同一键的新总线；`unregister` 只转交给已存在的新总线。
//!
mod handle;
mod observer;

pub use handle::{ObserveHandle, PostHandle, TaskId};
pub use observer::{EventObserver, ObserverId};

use crate::channel::{Channel, ChannelReceiver, ReplayPolicy, SubscriptionId};
use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::lifecycle::{Scope, ScopeState};
use crate::registry::{Namespace, RegistryInner};
use bon::Builder;
use chrono::{DateTime, Utc};
use observer::Delivery;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

/// 可在总线上传递的值
pub trait Payload: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// `observe_scoped` 的可选参数
#[derive(Builder, Clone, Debug)]
pub struct ScopeOptions<S> {
    /// 订阅任务运行的运行时
    pub runtime: Option<Handle>,
    /// 作用域低于该状态时暂停投递，回到该状态后重新订阅
    pub min_state: Option<S>,
}

impl<S> Default for ScopeOptions<S> {
    fn default() -> Self {
        Self {
            runtime: None,
            min_state: None,
        }
    }
}

/// 总线诊断信息
#[derive(Clone, Debug, Serialize)]
pub struct BusInfo {
    pub id: Uuid,
    pub key: String,
    pub namespace: Namespace,
    pub value_type: &'static str,
    pub created_at: DateTime<Utc>,
    pub live_subscribers: usize,
    pub attached_scopes: usize,
    pub observers: usize,
    pub has_replay_value: bool,
    pub disposed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum TaskKey {
    Forever(ObserverId),
    Scoped(TaskId),
}

struct TaskEntry<T> {
    id: TaskId,
    token: CancellationToken,
    subscription: Option<SubscriptionId>,
    // 持有观察者，保证其地址（身份）在注册期间不被复用
    _observer: Arc<dyn EventObserver<T>>,
}

impl<T> TaskEntry<T> {
    fn stop(self, channel: &Channel<T>)
    where
        T: Payload,
    {
        self.token.cancel();
        if let Some(sub) = self.subscription {
            channel.unsubscribe(sub);
        }
    }
}

struct BusState<T> {
    watching: bool,
    scopes: HashSet<TaskId>,
    tasks: HashMap<TaskKey, TaskEntry<T>>,
}

/// 回收判定结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Keep,
    Dispose,
    AlreadyDisposed,
}

enum Step<T> {
    Value(T),
    Resume,
    Pause,
    Stop,
    // 作用域被丢弃，状态通道关闭，按终止处理
    Detached,
}

/// 按键共享的事件总线
pub struct EventBus<T> {
    id: Uuid,
    key: Arc<str>,
    namespace: Namespace,
    created_at: DateTime<Utc>,
    channel: Channel<T>,
    state: Mutex<BusState<T>>,
    // 只在持有 state 锁时写入；注册表无需加锁即可读取
    disposed: AtomicBool,
    token: CancellationToken,
    registry: Weak<RegistryInner>,
    config: BusConfig,
}

impl<T: Payload> EventBus<T> {
    pub(crate) fn new(
        key: &str,
        namespace: Namespace,
        registry: Weak<RegistryInner>,
        config: BusConfig,
    ) -> Self {
        let replay = match namespace {
            Namespace::Ephemeral => ReplayPolicy::None,
            Namespace::Sticky => ReplayPolicy::Last,
        };
        Self {
            id: Uuid::new_v4(),
            key: Arc::from(key),
            namespace,
            created_at: Utc::now(),
            channel: Channel::new(replay),
            state: Mutex::new(BusState {
                watching: false,
                scopes: HashSet::new(),
                tasks: HashMap::new(),
            }),
            disposed: AtomicBool::new(false),
            token: CancellationToken::new(),
            registry,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn is_sticky(&self) -> bool {
        self.namespace == Namespace::Sticky
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn live_subscribers(&self) -> usize {
        self.channel.subscriber_count()
    }

    pub fn attached_scopes(&self) -> usize {
        self.lock().scopes.len()
    }

    pub fn observer_count(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// 粘性总线当前保留的回放值
    pub fn replay_value(&self) -> Option<T> {
        self.channel.last_value()
    }

    pub fn info(&self) -> BusInfo {
        let state = self.lock();
        BusInfo {
            id: self.id,
            key: self.key.to_string(),
            namespace: self.namespace,
            value_type: std::any::type_name::<T>(),
            created_at: self.created_at,
            live_subscribers: self.channel.subscriber_count(),
            attached_scopes: state.scopes.len(),
            observers: state.tasks.len(),
            has_replay_value: self.channel.has_last_value(),
            disposed: self.is_disposed(),
        }
    }

    /// 立即入队，返回时所有当前订阅者都已收到该值（尚未必处理）
    pub fn post(&self, value: T) -> PostHandle {
        let state = self.lock();
        if self.is_disposed() {
            drop(state);
            return match self.successor() {
                Ok(bus) => bus.post(value),
                Err(err) => {
                    self.config.logger.log(
                        Level::WARN,
                        &format!("{} post dropped", self.key),
                        Some(&err),
                    );
                    PostHandle::completed(&self.key)
                }
            };
        }
        self.channel.post(value);
        drop(state);
        PostHandle::completed(&self.key)
    }

    /// 延迟 `delay` 后入队；在后台任务中执行，可通过句柄取消或等待
    ///
    /// 延迟投递不随总线回收而取消，届时转交给同一键上的新总线。
    pub fn post_delayed(self: &Arc<Self>, value: T, delay: Duration) -> BusResult<PostHandle> {
        if delay.is_zero() {
            return Ok(self.post(value));
        }
        let runtime = self.config.runtime_or_current(None)?;
        let token = CancellationToken::new();
        let cancel = token.clone();
        let bus = self.clone();
        let join = runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => {
                    bus.post(value);
                    true
                }
            }
        });
        Ok(PostHandle::deferred(&self.key, token, join))
    }

    /// 不绑定作用域的订阅
    ///
    /// 同一观察者（同一个 `Arc`）重复调用返回同一个句柄。
    /// 调用方必须在不再需要时调用 `unregister`，否则订阅者永远存活，总线也不会被回收。
    pub fn observe_forever(
        self: &Arc<Self>,
        observer: Arc<dyn EventObserver<T>>,
    ) -> BusResult<ObserveHandle> {
        self.observe_forever_on(observer, None)
    }

    /// 同 `observe_forever`，投递任务运行在指定的运行时上
    pub fn observe_forever_on(
        self: &Arc<Self>,
        observer: Arc<dyn EventObserver<T>>,
        runtime: Option<&Handle>,
    ) -> BusResult<ObserveHandle> {
        let runtime = self.config.runtime_or_current(runtime)?;
        let key = TaskKey::Forever(ObserverId::of(&observer));

        let mut state = self.lock();
        if self.is_disposed() {
            drop(state);
            return self
                .successor()?
                .observe_forever_on(observer, Some(&runtime));
        }
        if let Some(entry) = state.tasks.get(&key) {
            if !entry.token.is_cancelled() {
                return Ok(ObserveHandle::new(entry.id, entry.token.clone()));
            }
        }

        self.ensure_watcher(&mut state, &runtime);
        let rx = self.channel.subscribe();
        let id = TaskId::next();
        let token = self.token.child_token();
        state.tasks.insert(
            key,
            TaskEntry {
                id,
                token: token.clone(),
                subscription: Some(rx.id()),
                _observer: observer.clone(),
            },
        );
        drop(state);
        self.debug(format!(
            "{} observe_forever task={id:?}, subscribers={}",
            self.key,
            self.channel.subscriber_count()
        ));

        let bus = self.clone();
        let delivery = self.delivery();
        let cancel = token.clone();
        runtime.spawn(async move {
            run_forever(rx, observer.as_ref(), &cancel, &delivery).await;
            bus.finish_task(key, id);
        });

        Ok(ObserveHandle::new(id, token))
    }

    /// 绑定到作用域的订阅，使用默认参数
    pub fn observe_scoped<S>(
        self: &Arc<Self>,
        scope: &S,
        observer: Arc<dyn EventObserver<T>>,
    ) -> BusResult<ObserveHandle>
    where
        S: Scope + ?Sized,
    {
        self.observe_scoped_with(scope, observer, ScopeOptions::default())
    }

    /// 绑定到作用域的订阅
    ///
    /// 绑定期间计入 `attached_scopes`；作用域进入终止状态时任务被强制取消、
    /// 计数减一并重新判定回收。已处于终止状态的作用域不会绑定，返回已取消的句柄。
    pub fn observe_scoped_with<S>(
        self: &Arc<Self>,
        scope: &S,
        observer: Arc<dyn EventObserver<T>>,
        options: ScopeOptions<S::State>,
    ) -> BusResult<ObserveHandle>
    where
        S: Scope + ?Sized,
    {
        let runtime = self.config.runtime_or_current(options.runtime.as_ref())?;
        let min_state = options.min_state;
        let id = TaskId::next();

        let initial = scope.current_state();
        if initial.is_terminal() {
            self.debug(format!("{} observe_scoped skipped: scope already terminal", self.key));
            let token = CancellationToken::new();
            token.cancel();
            return Ok(ObserveHandle::new(id, token));
        }

        let mut state = self.lock();
        if self.is_disposed() {
            drop(state);
            let options = ScopeOptions {
                runtime: Some(runtime),
                min_state,
            };
            return self.successor()?.observe_scoped_with(scope, observer, options);
        }

        let key = TaskKey::Scoped(id);
        let token = self.token.child_token();
        state.scopes.insert(id);
        state.tasks.insert(
            key,
            TaskEntry {
                id,
                token: token.clone(),
                subscription: None,
                _observer: observer.clone(),
            },
        );
        self.ensure_watcher(&mut state, &runtime);
        let attached = state.scopes.len();
        drop(state);
        self.debug(format!(
            "{} observe_scoped task={id:?}, attached scopes={attached}",
            self.key
        ));

        // 先注册回调再同步当前状态：两者之间的变化由回调送达，不会丢失
        let (state_tx, state_rx) = watch::channel(initial);
        let state_tx = Arc::new(state_tx);
        let notified = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(self);
        let (tx, flag) = (state_tx.clone(), notified.clone());
        scope.add_observer(Box::new(move |s: S::State| {
            tx.send_modify(|current| {
                *current = s;
                flag.store(true, Ordering::Release);
            });
            if !s.is_terminal() {
                return;
            }
            if let Some(bus) = weak.upgrade() {
                bus.release_scope(id);
            }
        }));
        let latest = scope.current_state();
        state_tx.send_if_modified(|current| {
            if notified.load(Ordering::Acquire) || *current == latest {
                return false;
            }
            *current = latest;
            true
        });
        drop(state_tx);

        let bus = self.clone();
        let delivery = self.delivery();
        let cancel = token.clone();
        runtime.spawn(async move {
            bus.run_scoped(id, observer, &cancel, state_rx, min_state, &delivery)
                .await;
            bus.finish_task(key, id);
        });

        Ok(ObserveHandle::new(id, token))
    }

    /// 取消并移除 `observe_forever` 注册的观察者，随后判定回收；未注册时无操作
    pub fn unregister<O>(&self, observer: &Arc<O>)
    where
        O: ?Sized,
    {
        let key = TaskKey::Forever(ObserverId::of(observer));
        let verdict = {
            let mut state = self.lock();
            let Some(entry) = state.tasks.remove(&key) else {
                let disposed = self.is_disposed();
                drop(state);
                if disposed {
                    if let Some(bus) = self.live_successor() {
                        bus.unregister(observer);
                    }
                }
                return;
            };
            entry.stop(&self.channel);
            self.debug(format!(
                "{} unregister, subscribers={}",
                self.key,
                self.channel.subscriber_count()
            ));
            self.check_remove_bus_locked(&mut state)
        };
        self.apply(verdict);
    }

    /// 订阅者数量归零时由监听任务调用；返回监听任务是否应当退出
    fn on_subscribers_drained(&self) -> bool {
        let verdict = {
            let mut state = self.lock();
            self.check_remove_bus_locked(&mut state)
        };
        self.apply(verdict);
        verdict != Verdict::Keep
    }

    /// 作用域进入终止状态：取消对应任务、解除绑定并判定回收；重复通知无操作
    fn release_scope(&self, id: TaskId) {
        let verdict = {
            let mut state = self.lock();
            if !state.scopes.remove(&id) {
                return;
            }
            if let Some(entry) = state.tasks.remove(&TaskKey::Scoped(id)) {
                entry.stop(&self.channel);
            }
            self.debug(format!(
                "{} scope terminated, subscribers={}, attached scopes={}",
                self.key,
                self.channel.subscriber_count(),
                state.scopes.len()
            ));
            self.check_remove_bus_locked(&mut state)
        };
        self.apply(verdict);
    }

    /// 唯一的回收判定点，调用方必须持有 state 锁
    fn check_remove_bus_locked(&self, state: &mut BusState<T>) -> Verdict {
        if self.is_disposed() {
            return Verdict::AlreadyDisposed;
        }
        if self.channel.subscriber_count() > 0 || !state.scopes.is_empty() {
            return Verdict::Keep;
        }
        self.dispose_locked(state);
        Verdict::Dispose
    }

    fn dispose_locked(&self, state: &mut BusState<T>) {
        self.disposed.store(true, Ordering::Release);
        for (_, entry) in state.tasks.drain() {
            entry.stop(&self.channel);
        }
        state.scopes.clear();
        self.token.cancel();
        self.channel.close();
    }

    /// 注册表移除放在锁外：注册表持有分片锁时不会再去获取总线锁
    fn apply(&self, verdict: Verdict) {
        if verdict != Verdict::Dispose {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.namespace, &self.key, self.addr());
        }
        self.debug(format!("remove event bus {} ({})", self.key, self.id));
    }

    fn dispose(&self) {
        let verdict = {
            let mut state = self.lock();
            if self.is_disposed() {
                Verdict::AlreadyDisposed
            } else {
                self.dispose_locked(&mut state);
                Verdict::Dispose
            }
        };
        self.apply(verdict);
    }

    fn successor(&self) -> BusResult<Arc<EventBus<T>>> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| BusError::RegistryClosed {
                key: self.key.to_string(),
            })?;
        registry.bus::<T>(self.namespace, &self.key)
    }

    /// 注册表中同一键的存活总线，不会触发创建
    fn live_successor(&self) -> Option<Arc<EventBus<T>>> {
        self.registry
            .upgrade()?
            .existing::<T>(self.namespace, &self.key)
    }

    /// 重新进入接收循环时订阅通道；总线已回收或任务已取消时返回 `None`
    fn attach(&self, key: TaskKey) -> Option<ChannelReceiver<T>> {
        let mut state = self.lock();
        if self.is_disposed() {
            return None;
        }
        let entry = state.tasks.get_mut(&key)?;
        if entry.token.is_cancelled() {
            return None;
        }
        let rx = self.channel.subscribe();
        entry.subscription = Some(rx.id());
        Some(rx)
    }

    fn finish_task(&self, key: TaskKey, id: TaskId) {
        let mut state = self.lock();
        if !state.tasks.get(&key).is_some_and(|entry| entry.id == id) {
            return;
        }
        if let Some(entry) = state.tasks.remove(&key) {
            entry.stop(&self.channel);
        }
    }

    fn ensure_watcher(self: &Arc<Self>, state: &mut BusState<T>, runtime: &Handle) {
        if state.watching {
            return;
        }
        state.watching = true;

        // 在首个订阅者接入前取得接收端，保证不会漏掉 0 -> 1 之后的任何变化
        let mut counts = self.channel.watch_subscribers();
        let token = self.token.child_token();
        let weak = Arc::downgrade(self);
        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = counts.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let count = *counts.borrow_and_update();
                        let Some(bus) = weak.upgrade() else {
                            break;
                        };
                        bus.debug(format!("{} subscriber count changed: {count}", bus.key));
                        if count == 0 && bus.on_subscribers_drained() {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn run_scoped<S: ScopeState>(
        &self,
        id: TaskId,
        observer: Arc<dyn EventObserver<T>>,
        cancel: &CancellationToken,
        mut states: watch::Receiver<S>,
        min_state: Option<S>,
        delivery: &Delivery,
    ) {
        let active = |s: &S| !s.is_terminal() && min_state.is_none_or(|min| *s >= min);

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Stop,
                ready = async {
                    match states.wait_for(|s| s.is_terminal() || active(s)).await {
                        Ok(s) if s.is_terminal() => Step::<T>::Stop,
                        Ok(_) => Step::Resume,
                        Err(_) => Step::Detached,
                    }
                } => ready,
            };
            match step {
                Step::Resume => {}
                Step::Detached => return self.release_scope(id),
                _ => return,
            }
            let Some(mut rx) = self.attach(TaskKey::Scoped(id)) else {
                return;
            };

            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Stop,
                    paused = async { states.wait_for(|s| !active(s)).await.is_ok() } => {
                        if paused { Step::Pause } else { Step::Detached }
                    }
                    value = rx.recv() => value.map_or(Step::Stop, Step::Value),
                };
                match step {
                    Step::Value(value) => delivery.deliver(observer.as_ref(), value),
                    Step::Pause => break,
                    Step::Detached => {
                        drop(rx);
                        return self.release_scope(id);
                    }
                    Step::Resume | Step::Stop => return,
                }
            }
            drop(rx);
            self.debug(format!("{} scoped task={id:?} paused", self.key));
        }
    }

    fn delivery(&self) -> Delivery {
        Delivery {
            key: self.key.clone(),
            logger: self.config.logger.clone(),
            trace: self.config.trace_deliveries,
        }
    }

    fn debug(&self, message: String) {
        self.config.logger.log(Level::DEBUG, &message, None);
    }

    fn lock(&self) -> MutexGuard<'_, BusState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn addr(&self) -> *const () {
        self as *const Self as *const ()
    }
}

async fn run_forever<T: Payload>(
    mut rx: ChannelReceiver<T>,
    observer: &dyn EventObserver<T>,
    cancel: &CancellationToken,
    delivery: &Delivery,
) {
    loop {
        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            value = rx.recv() => match value {
                Some(value) => value,
                None => break,
            },
        };
        delivery.deliver(observer, value);
    }
}

impl<T> fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("namespace", &self.namespace)
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// 注册表对不同值类型总线的类型擦除视图
pub(crate) trait AnyBus: Send + Sync + 'static {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn value_type(&self) -> &'static str;
    fn is_disposed(&self) -> bool;
    fn dispose(&self);
    fn info(&self) -> BusInfo;
}

impl<T: Payload> AnyBus for EventBus<T> {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn value_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn is_disposed(&self) -> bool {
        EventBus::is_disposed(self)
    }

    fn dispose(&self) {
        EventBus::dispose(self)
    }

    fn info(&self) -> BusInfo {
        EventBus::info(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{Lifecycle, LifecycleState};
    use crate::registry::BusRegistry;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    fn forward<T: Payload>() -> (Arc<dyn EventObserver<T>>, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer: Arc<dyn EventObserver<T>> = Arc::new(move |v: T| -> BusResult<()> {
            let _ = tx.send(v);
            Ok(())
        });
        (observer, rx)
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("observer dropped")
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !cond() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forever_observer_is_idempotent() {
        let registry = BusRegistry::new();
        let bus = registry.get::<u32>("k").unwrap();
        let (observer, mut rx) = forward::<u32>();

        let first = bus.observe_forever(observer.clone()).unwrap();
        let second = bus.observe_forever(observer.clone()).unwrap();
        assert_eq!(first, second);
        assert_eq!(bus.live_subscribers(), 1);

        bus.post(7);
        assert_eq!(next(&mut rx).await, 7);
        sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        bus.unregister(&observer);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unregister_unknown_observer_is_noop() {
        let registry = BusRegistry::new();
        let bus = registry.get_sticky::<u32>("k").unwrap();
        bus.post(1);
        let (observer, _rx) = forward::<u32>();

        bus.unregister(&observer);
        assert!(!bus.is_disposed());
        assert_eq!(bus.replay_value(), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_handle_releases_its_slot() {
        let registry = BusRegistry::new();
        let bus = registry.get::<u32>("k").unwrap();
        let (observer, _rx) = forward::<u32>();

        let handle = bus.observe_forever(observer.clone()).unwrap();
        handle.cancel();
        handle.cancel();
        wait_until(|| bus.is_disposed()).await;
        assert_eq!(bus.observer_count(), 0);
        assert!(!registry.contains("k", Namespace::Ephemeral));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delayed_post_can_be_cancelled() {
        let registry = BusRegistry::new();
        let bus = registry.get::<&'static str>("k").unwrap();
        let (observer, mut rx) = forward::<&'static str>();
        bus.observe_forever(observer.clone()).unwrap();

        let cancelled = bus
            .post_delayed("late", Duration::from_millis(200))
            .unwrap();
        cancelled.cancel();
        assert!(matches!(
            cancelled.await,
            Err(BusError::PostCancelled { .. })
        ));

        let delivered = bus.post_delayed("soon", Duration::from_millis(10)).unwrap();
        delivered.await.unwrap();
        assert_eq!(next(&mut rx).await, "soon");
        assert!(rx.try_recv().is_err());

        bus.unregister(&observer);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scoped_observer_pauses_below_min_state() {
        let registry = BusRegistry::new();
        let bus = registry.get_sticky::<u32>("k").unwrap();
        let lifecycle = Lifecycle::with_state(LifecycleState::Created);
        let (observer, mut rx) = forward::<u32>();

        let options = ScopeOptions::builder()
            .min_state(LifecycleState::Started)
            .build();
        bus.observe_scoped_with(&lifecycle, observer, options)
            .unwrap();
        assert_eq!(bus.attached_scopes(), 1);

        bus.post(1);
        sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        lifecycle.set_state(LifecycleState::Resumed);
        assert_eq!(next(&mut rx).await, 1);

        // 退到后台：订阅者归零，但作用域仍绑定，总线保留
        lifecycle.set_state(LifecycleState::Created);
        wait_until(|| bus.live_subscribers() == 0).await;
        assert!(!bus.is_disposed());
        bus.post(2);
        bus.post(3);

        // 回到前台：粘性总线重新回放最近的值
        lifecycle.set_state(LifecycleState::Started);
        assert_eq!(next(&mut rx).await, 3);

        lifecycle.destroy();
        assert_eq!(bus.attached_scopes(), 0);
        wait_until(|| bus.is_disposed()).await;
        assert!(!registry.contains("k", Namespace::Sticky));
    }

    /// 第一次被读取状态后立刻切换到另一个状态的作用域
    struct ShiftingScope {
        inner: Lifecycle,
        shift_to: LifecycleState,
        shifted: AtomicBool,
    }

    impl Scope for ShiftingScope {
        type State = LifecycleState;

        fn current_state(&self) -> LifecycleState {
            let state = self.inner.state();
            if !self.shifted.swap(true, Ordering::SeqCst) {
                self.inner.set_state(self.shift_to);
            }
            state
        }

        fn add_observer(&self, observer: crate::lifecycle::StateCallback<LifecycleState>) {
            self.inner.add_observer(observer);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn state_change_during_attach_is_not_lost() {
        let registry = BusRegistry::new();
        let bus = registry.get_sticky::<u32>("k").unwrap();
        let scope = ShiftingScope {
            inner: Lifecycle::with_state(LifecycleState::Created),
            shift_to: LifecycleState::Resumed,
            shifted: AtomicBool::new(false),
        };
        let (observer, mut rx) = forward::<u32>();

        let options = ScopeOptions::builder()
            .min_state(LifecycleState::Started)
            .build();
        bus.observe_scoped_with(&scope, observer, options).unwrap();
        assert_eq!(scope.inner.state(), LifecycleState::Resumed);

        bus.post(1);
        assert_eq!(next(&mut rx).await, 1);
        wait_until(|| bus.live_subscribers() == 1).await;

        scope.inner.destroy();
        assert!(bus.is_disposed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_scope_releases_the_bus() {
        let registry = BusRegistry::new();
        let bus = registry.get::<u32>("k").unwrap();
        let (observer, _rx) = forward::<u32>();

        let lifecycle = Lifecycle::with_state(LifecycleState::Resumed);
        bus.observe_scoped(&lifecycle, observer).unwrap();
        assert_eq!(bus.attached_scopes(), 1);

        drop(lifecycle);
        wait_until(|| bus.is_disposed()).await;
        assert_eq!(bus.attached_scopes(), 0);
        assert_eq!(bus.observer_count(), 0);
        assert!(!registry.contains("k", Namespace::Ephemeral));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_paused_scope_releases_the_bus() {
        let registry = BusRegistry::new();
        let bus = registry.get::<u32>("k").unwrap();
        let (observer, _rx) = forward::<u32>();

        let lifecycle = Lifecycle::with_state(LifecycleState::Created);
        let options = ScopeOptions::builder()
            .min_state(LifecycleState::Resumed)
            .build();
        bus.observe_scoped_with(&lifecycle, observer, options)
            .unwrap();
        assert_eq!(bus.live_subscribers(), 0);

        drop(lifecycle);
        wait_until(|| bus.is_disposed()).await;
        assert_eq!(bus.attached_scopes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn destroyed_scope_is_not_attached() {
        let registry = BusRegistry::new();
        let bus = registry.get::<u32>("k").unwrap();
        let lifecycle = Lifecycle::with_state(LifecycleState::Resumed);
        lifecycle.destroy();
        let (observer, _rx) = forward::<u32>();

        let handle = bus.observe_scoped(&lifecycle, observer).unwrap();
        assert!(handle.is_cancelled());
        assert_eq!(bus.attached_scopes(), 0);
        assert_eq!(bus.observer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scope_keeps_bus_alive_after_forever_observer_leaves() {
        let registry = BusRegistry::new();
        let bus = registry.get::<u32>("k").unwrap();
        let lifecycle = Lifecycle::with_state(LifecycleState::Resumed);
        let (scoped, mut scoped_rx) = forward::<u32>();
        let (forever, _forever_rx) = forward::<u32>();

        bus.observe_scoped(&lifecycle, scoped).unwrap();
        bus.observe_forever(forever.clone()).unwrap();
        wait_until(|| bus.live_subscribers() == 2).await;

        bus.unregister(&forever);
        assert!(!bus.is_disposed());
        bus.post(5);
        assert_eq!(next(&mut scoped_rx).await, 5);

        lifecycle.destroy();
        wait_until(|| bus.is_disposed()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_bus_forwards_to_successor() {
        let registry = BusRegistry::new();
        let stale = registry.get_sticky::<u32>("k").unwrap();
        let (observer, _rx) = forward::<u32>();
        stale.observe_forever(observer.clone()).unwrap();
        stale.unregister(&observer);
        assert!(stale.is_disposed());

        stale.post(9);
        let fresh = registry.get_sticky::<u32>("k").unwrap();
        assert_ne!(fresh.id(), stale.id());
        assert_eq!(fresh.replay_value(), Some(9));

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let counting: Arc<dyn EventObserver<u32>> = Arc::new(move |_v: u32| -> BusResult<()> {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        stale.observe_forever(counting.clone()).unwrap();
        assert_eq!(fresh.observer_count(), 1);
        wait_until(|| calls.load(std::sync::atomic::Ordering::SeqCst) == 1).await;

        // 旧句柄上的退订同样转交给新总线
        stale.unregister(&counting);
        assert_eq!(fresh.observer_count(), 0);
        assert!(fresh.is_disposed());
    }
}
