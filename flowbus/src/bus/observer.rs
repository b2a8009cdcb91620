//! 观察者（EventObserver）与投递保护
//!
//! 观察者以 `Arc` 持有，身份由 `Arc` 的分配地址决定（`ObserverId`），
//! 同一个实例重复订阅会被识别为同一观察者，值相等的两个实例则互不相干。
//!
use crate::error::{BusError, BusResult};
use crate::logger::BusLogger;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::Level;

/// 事件观察者：接收总线投递的每一个值
///
/// 返回 `Err` 或发生 panic 都只会被记录，不会中断后续投递。
pub trait EventObserver<T>: Send + Sync + 'static {
    fn on_changed(&self, value: T) -> BusResult<()>;
}

impl<T, F> EventObserver<T> for F
where
    F: Fn(T) -> BusResult<()> + Send + Sync + 'static,
{
    fn on_changed(&self, value: T) -> BusResult<()> {
        self(value)
    }
}

/// 观察者身份（`Arc` 分配地址）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(usize);

impl ObserverId {
    pub fn of<O: ?Sized>(observer: &Arc<O>) -> Self {
        ObserverId(Arc::as_ptr(observer) as *const () as usize)
    }
}

/// 单次投递所需的上下文
#[derive(Clone)]
pub(crate) struct Delivery {
    pub(crate) key: Arc<str>,
    pub(crate) logger: Arc<dyn BusLogger>,
    pub(crate) trace: bool,
}

impl Delivery {
    /// 在保护下调用观察者，失败只记录日志
    pub(crate) fn deliver<T: std::fmt::Debug + 'static>(
        &self,
        observer: &dyn EventObserver<T>,
        value: T,
    ) {
        if self.trace {
            self.logger.log(
                Level::TRACE,
                &format!(
                    "{} on_changed thread={:?} value={value:?}",
                    self.key,
                    std::thread::current().name()
                ),
                None,
            );
        }

        let failure = match panic::catch_unwind(AssertUnwindSafe(|| observer.on_changed(value))) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(payload) => BusError::ObserverPanicked {
                reason: panic_reason(payload.as_ref()),
            },
        };
        self.logger.log(
            Level::ERROR,
            &format!("{} on_changed error", self.key),
            Some(&failure),
        );
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
