//! 总线注册表（BusRegistry）
//!
//! 两个相互独立的键空间（普通 / 粘性），各自是 `键 -> 总线` 的并发映射：
//! - `get` / `get_sticky`：按键懒创建，同一键的并发创建只会产生一个总线；
//! - `clear`：回收全部已知总线，并发的 `get` 可以重新创建条目；
//! - 总线回收时调用 `remove`，仅当条目仍指向该总线时才移除。
//!
//! 注册表本身不持有跨键的锁，不同键上的总线可以完全并发地操作。
//!
use crate::bus::{AnyBus, BusInfo, EventBus, Payload};
use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use tracing::Level;

/// 键空间：同名的普通键与粘性键互不相干
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Ephemeral,
    Sticky,
}

pub(crate) struct RegistryInner {
    config: BusConfig,
    buses: DashMap<String, Arc<dyn AnyBus>>,
    sticky: DashMap<String, Arc<dyn AnyBus>>,
}

impl RegistryInner {
    fn map(&self, namespace: Namespace) -> &DashMap<String, Arc<dyn AnyBus>> {
        match namespace {
            Namespace::Ephemeral => &self.buses,
            Namespace::Sticky => &self.sticky,
        }
    }

    /// 取得或创建总线；已回收但尚未移除的条目会被直接替换
    pub(crate) fn bus<T: Payload>(
        self: &Arc<Self>,
        namespace: Namespace,
        key: &str,
    ) -> BusResult<Arc<EventBus<T>>> {
        let bus = match self.map(namespace).entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_disposed() => {
                let bus = self.create::<T>(namespace, key);
                occupied.insert(bus.clone());
                bus
            }
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let bus = self.create::<T>(namespace, key);
                vacant.insert(bus.clone());
                bus
            }
        };

        let found = bus.value_type();
        bus.as_any()
            .downcast::<EventBus<T>>()
            .map_err(|_| BusError::TypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
                found,
            })
    }

    /// 只查找未回收的总线
    pub(crate) fn existing<T: Payload>(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Option<Arc<EventBus<T>>> {
        let bus = self.map(namespace).get(key)?.value().clone();
        if bus.is_disposed() {
            return None;
        }
        bus.as_any().downcast::<EventBus<T>>().ok()
    }

    fn create<T: Payload>(self: &Arc<Self>, namespace: Namespace, key: &str) -> Arc<dyn AnyBus> {
        let bus = EventBus::<T>::new(key, namespace, Arc::downgrade(self), self.config.clone());
        self.config.logger.log(
            Level::DEBUG,
            &format!("new event bus {key} ({namespace:?}, {})", bus.id()),
            None,
        );
        Arc::new(bus)
    }

    /// 由总线在回收时调用；条目已被替换时不做任何事
    pub(crate) fn remove(&self, namespace: Namespace, key: &str, bus: *const ()) -> bool {
        self.map(namespace)
            .remove_if(key, |_, current| Arc::as_ptr(current) as *const () == bus)
            .is_some()
    }

    // 先收集再逐个处理：遍历期间持有分片锁，而回收需要总线锁
    fn collect(&self, namespace: Namespace) -> Vec<Arc<dyn AnyBus>> {
        self.map(namespace)
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for namespace in [Namespace::Ephemeral, Namespace::Sticky] {
            for bus in self.collect(namespace) {
                bus.dispose();
            }
        }
    }
}

/// 进程内的键控总线注册表，构造时为空
#[derive(Clone)]
pub struct BusRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for BusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                buses: DashMap::new(),
                sticky: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// 取得（必要时创建）普通总线：只投递订阅之后的值
    ///
    /// 同一键已绑定其他值类型时返回 `BusError::TypeMismatch`。
    pub fn get<T: Payload>(&self, key: &str) -> BusResult<Arc<EventBus<T>>> {
        self.inner.bus::<T>(Namespace::Ephemeral, key)
    }

    /// 取得（必要时创建）粘性总线：新订阅者先收到最近一次投递的值
    pub fn get_sticky<T: Payload>(&self, key: &str) -> BusResult<Arc<EventBus<T>>> {
        self.inner.bus::<T>(Namespace::Sticky, key)
    }

    pub fn contains(&self, key: &str, namespace: Namespace) -> bool {
        self.inner.map(namespace).contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.buses.len() + self.inner.sticky.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 回收两个键空间内当前已知的全部总线
    pub fn clear(&self) {
        for namespace in [Namespace::Ephemeral, Namespace::Sticky] {
            for bus in self.inner.collect(namespace) {
                bus.dispose();
            }
            self.inner.map(namespace).retain(|_, bus| !bus.is_disposed());
        }
        self.inner
            .config
            .logger
            .log(Level::DEBUG, "registry cleared", None);
    }

    /// 当前全部总线的诊断信息，按键空间与键排序
    pub fn snapshot(&self) -> Vec<BusInfo> {
        let mut infos: Vec<BusInfo> = [Namespace::Ephemeral, Namespace::Sticky]
            .into_iter()
            .flat_map(|namespace| self.inner.collect(namespace))
            .map(|bus| bus.info())
            .collect();
        infos.sort_by(|a, b| (a.namespace, &a.key).cmp(&(b.namespace, &b.key)));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventObserver;
    use std::collections::HashSet;
    use tokio::task::JoinSet;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_creates_one_bus() {
        let registry = BusRegistry::new();
        let mut set = JoinSet::new();
        for _ in 0..64 {
            let registry = registry.clone();
            set.spawn(async move { registry.get::<String>("shared").unwrap().id() });
        }
        let mut ids = HashSet::new();
        while let Some(id) = set.join_next().await {
            ids.insert(id.unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn namespaces_are_independent() {
        let registry = BusRegistry::new();
        let plain = registry.get::<u8>("k").unwrap();
        let sticky = registry.get_sticky::<u8>("k").unwrap();
        assert_ne!(plain.id(), sticky.id());
        assert!(!plain.is_sticky());
        assert!(sticky.is_sticky());

        sticky.post(1);
        plain.post(2);
        assert_eq!(sticky.replay_value(), Some(1));
        assert_eq!(plain.replay_value(), None);
    }

    #[test]
    fn key_bound_to_other_type_is_rejected() {
        let registry = BusRegistry::new();
        registry.get::<u8>("k").unwrap();
        match registry.get::<String>("k") {
            Err(BusError::TypeMismatch { key, expected, found }) => {
                assert_eq!(key, "k");
                assert!(expected.contains("String"));
                assert_eq!(found, "u8");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn remove_ignores_replaced_bus() {
        let registry = BusRegistry::new();
        let bus = registry.get::<u8>("k").unwrap();
        let stranger = 0usize as *const ();
        assert!(!registry.inner.remove(Namespace::Ephemeral, "k", stranger));
        assert!(registry.contains("k", Namespace::Ephemeral));

        let addr = Arc::as_ptr(&bus) as *const ();
        assert!(registry.inner.remove(Namespace::Ephemeral, "k", addr));
        assert!(!registry.contains("k", Namespace::Ephemeral));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clear_disposes_everything() {
        let registry = BusRegistry::new();
        let plain = registry.get::<u8>("a").unwrap();
        let sticky = registry.get_sticky::<u8>("b").unwrap();
        let observer: Arc<dyn EventObserver<u8>> = Arc::new(|_v: u8| -> BusResult<()> { Ok(()) });
        let handle = plain.observe_forever(observer).unwrap();
        sticky.post(3);

        registry.clear();

        assert!(registry.is_empty());
        assert!(plain.is_disposed());
        assert!(sticky.is_disposed());
        assert!(handle.is_cancelled());
        assert_eq!(sticky.replay_value(), None);

        let fresh = registry.get_sticky::<u8>("b").unwrap();
        assert!(!fresh.is_disposed());
        assert_eq!(fresh.replay_value(), None);
    }

    #[test]
    fn snapshot_lists_buses_in_order() {
        let registry = BusRegistry::new();
        registry.get_sticky::<u8>("z").unwrap().post(1);
        registry.get::<u8>("b").unwrap();
        registry.get::<u8>("a").unwrap();

        let keys: Vec<(Namespace, String)> = registry
            .snapshot()
            .into_iter()
            .map(|info| (info.namespace, info.key))
            .collect();
        assert_eq!(
            keys,
            vec![
                (Namespace::Ephemeral, "a".to_string()),
                (Namespace::Ephemeral, "b".to_string()),
                (Namespace::Sticky, "z".to_string()),
            ]
        );
        let infos = registry.snapshot();
        assert!(infos[2].has_replay_value);
        assert_eq!(infos[2].value_type, "u8");
    }
}
