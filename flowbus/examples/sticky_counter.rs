//! 粘性计数器：先投递、后订阅，观察者第一次收到的就是最近的值
//!
//! 运行：`cargo run -p flowbus --example sticky_counter`
//!
use flowbus::{BusRegistry, BusResult, EventObserver};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> BusResult<()> {
    let registry = BusRegistry::new();
    let counter = registry.get_sticky::<u64>("counter")?;

    for n in 1..=3 {
        counter.post(n);
    }

    let printer: Arc<dyn EventObserver<u64>> = Arc::new(|n: u64| -> BusResult<()> {
        println!("counter = {n}");
        Ok(())
    });
    counter.observe_forever(printer.clone())?;

    counter.post(4);
    counter.post_delayed(5, Duration::from_millis(10))?.await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    counter.unregister(&printer);
    println!("disposed: {}", counter.is_disposed());
    println!("buses left: {}", registry.len());
    Ok(())
}
