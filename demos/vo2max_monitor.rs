use fitlink::{ble::BtleplugCentral, Readings, Result, SensorDevice, SessionPhase};
use std::{sync::Arc, time::Duration};
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🫁 Fitlink VO2max Monitor Example");

    let central = Arc::new(BtleplugCentral::new().await?);
    let sensor = SensorDevice::vo2max(central);
    let mut observer = sensor.observer();

    info!("Searching for VO2max sensors...");
    if let Err(e) = sensor.start_scan().await {
        error!("❌ Failed to start scan: {}", e);
        return Err(e);
    }

    let state = observer
        .wait_for_phase(Duration::from_secs(60), |p| {
            *p == SessionPhase::Streaming || p.is_terminal()
        })
        .await?;
    if state.phase != SessionPhase::Streaming {
        warn!("❌ {}", state.connection_state);
        return Ok(());
    }

    info!("✅ Connected to: {}", state.device_label);
    info!("Press Ctrl+C to stop monitoring");

    let mut monitor_interval = interval(Duration::from_secs(2));
    let start_time = Instant::now();
    let mut peak_vo2 = 0.0f32;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Stopping...");
                break;
            }
            _ = monitor_interval.tick() => {}
        }

        let state = sensor.state();
        if state.phase.is_terminal() {
            warn!("❌ {}", state.connection_state);
            break;
        }

        let Readings::Vo2Max { vo2, vco2, rq } = state.readings else {
            continue;
        };
        peak_vo2 = peak_vo2.max(vo2);

        let elapsed = start_time.elapsed().as_secs();
        println!("\n📊 {} ({:02}:{:02})", state.device_label, elapsed / 60, elapsed % 60);
        println!("┌──────────────────────────────┐");
        println!("│ VO2:  {vo2:8.2}               │");
        println!("│ VCO2: {vco2:8.2}               │");
        println!("│ RQ:   {rq:8.2}               │");
        println!("└──────────────────────────────┘");

        if rq > 1.0 {
            println!("⚠️  RQ above 1.0, likely above anaerobic threshold");
        }
    }

    info!("🔌 Disconnecting...");
    if let Err(e) = sensor.disconnect().await {
        error!("❌ Failed to disconnect: {}", e);
    }

    println!("\n📊 Final Session Summary:");
    println!(
        "  Duration: {:02}:{:02}",
        start_time.elapsed().as_secs() / 60,
        start_time.elapsed().as_secs() % 60
    );
    println!("  Peak VO2: {peak_vo2:.2}");

    Ok(())
}
