use crate::error::{BusError, BusResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 订阅任务标识，进程内唯一
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// 订阅任务句柄
///
/// 同一观察者重复调用 `observe_forever` 得到的句柄相等（同一任务）。
/// 直接 `cancel` 与 `unregister` 效果一致：任务退出并释放任务表中的位置。
#[derive(Clone, Debug)]
pub struct ObserveHandle {
    id: TaskId,
    token: CancellationToken,
}

impl ObserveHandle {
    pub(crate) fn new(id: TaskId, token: CancellationToken) -> Self {
        Self { id, token }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// 取消订阅任务；可重复调用
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待任务被取消（显式取消、退订或总线回收）
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl PartialEq for ObserveHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ObserveHandle {}

/// 投递句柄
///
/// 立即投递在返回前已经入队；延迟投递在后台任务中完成，可取消，
/// `await` 句柄得到投递结果（被取消时为 `BusError::PostCancelled`）。
#[derive(Debug)]
pub struct PostHandle {
    key: String,
    token: Option<CancellationToken>,
    join: Option<JoinHandle<bool>>,
}

impl PostHandle {
    pub(crate) fn completed(key: &str) -> Self {
        Self {
            key: key.to_string(),
            token: None,
            join: None,
        }
    }

    pub(crate) fn deferred(key: &str, token: CancellationToken, join: JoinHandle<bool>) -> Self {
        Self {
            key: key.to_string(),
            token: Some(token),
            join: Some(join),
        }
    }

    /// 取消尚未入队的延迟投递；已入队的投递不受影响
    pub fn cancel(&self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Future for PostHandle {
    type Output = BusResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(join) = this.join.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match Pin::new(join).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.join = None;
                Poll::Ready(match result {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(BusError::PostCancelled {
                        key: this.key.clone(),
                    }),
                    Err(err) => Err(err.into()),
                })
            }
        }
    }
}
