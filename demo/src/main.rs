use anyhow::Result;
use flowbus::{BusConfig, BusResult, EventObserver, Lifecycle, LifecycleState, ScopeOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const EVENT_KEY: &str = "event_key";

/// 模拟界面上的文本控件
struct Label {
    name: &'static str,
}

impl EventObserver<String> for Label {
    fn on_changed(&self, text: String) -> BusResult<()> {
        info!(label = self.name, text = %text, "label updated");
        Ok(())
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn print_snapshot(stage: &str) -> Result<()> {
    let snapshot = serde_json::to_string_pretty(&flowbus::global().snapshot())?;
    println!("--- {stage} ---\n{snapshot}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("flowbus=debug,demo=info")),
        )
        .init();
    flowbus::init(BusConfig::default())?;

    let count = AtomicU32::new(0);
    let next_text = || format!(" change txt {}", count.fetch_add(1, Ordering::SeqCst));

    // 先投递再订阅：粘性总线把最近的值回放给新观察者
    flowbus::with_sticky::<String>(EVENT_KEY)?.post(next_text());
    let label: Arc<dyn EventObserver<String>> = Arc::new(Label { name: "collect_text" });
    flowbus::with_sticky::<String>(EVENT_KEY)?.observe_forever(label.clone())?;
    settle().await;

    // 绑定到页面生命周期的观察者，只在 Started 及以上时接收
    let page = Lifecycle::with_state(LifecycleState::Created);
    let banner: Arc<dyn EventObserver<String>> = Arc::new(Label { name: "banner" });
    let options = ScopeOptions::builder()
        .min_state(LifecycleState::Started)
        .build();
    flowbus::with_sticky::<String>(EVENT_KEY)?.observe_scoped_with(&page, banner, options)?;
    page.set_state(LifecycleState::Resumed);

    // “开始”按钮被点了三次
    for _ in 0..3 {
        flowbus::with_sticky::<String>(EVENT_KEY)?.post(next_text());
        settle().await;
    }
    print_snapshot("observing")?;

    // “停止”按钮：退订永久观察者，页面仍然绑定，总线保留
    flowbus::with_sticky::<String>(EVENT_KEY)?.unregister(&label);
    settle().await;
    print_snapshot("after unregister")?;

    // 页面销毁：最后一个作用域解除绑定，总线被回收
    page.destroy();
    settle().await;
    print_snapshot("after destroy")?;

    let fresh = flowbus::with_sticky::<String>(EVENT_KEY)?;
    info!(bus = %fresh.id(), replay = ?fresh.replay_value(), "fresh bus after disposal");

    let delayed = fresh.post_delayed(next_text(), Duration::from_millis(20))?;
    delayed.await?;
    info!(replay = ?fresh.replay_value(), "delayed post landed");

    flowbus::clear();
    print_snapshot("after clear")?;
    Ok(())
}
