use std::sync::{Arc, Mutex};

use anyhow::Result;

use whalewatch::config::Config;
use whalewatch::detector::LargeOrderDetector;
use whalewatch::feed::binance::BinanceFeed;
use whalewatch::logging::{json_log, obj, v_num, v_str, Domain};
use whalewatch::storage::DetectionStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let mut store = DetectionStore::new(&cfg.sqlite_path)?;
    store.init()?;
    let store = Arc::new(Mutex::new(store));
    let feed = Arc::new(BinanceFeed::new(&cfg));

    json_log(
        Domain::System,
        "startup",
        obj(&[
            ("symbols", v_str(&cfg.symbols.join(","))),
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("notional_threshold", v_num(cfg.notional_threshold)),
            ("detect_interval_secs", v_num(cfg.detect_interval_secs as f64)),
        ]),
    );

    let symbols = cfg.symbols.clone();
    let mut detector = LargeOrderDetector::new(cfg, feed, store);
    detector.start(&symbols).await;

    tokio::signal::ctrl_c().await?;
    json_log(Domain::System, "shutdown_requested", obj(&[]));
    detector.stop_monitoring(None).await;
    json_log(Domain::System, "shutdown_complete", obj(&[]));
    Ok(())
}
