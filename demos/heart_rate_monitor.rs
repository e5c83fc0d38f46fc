use fitlink::{ble::BtleplugCentral, Measurement, Result, SensorDevice, SessionPhase};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("❤️  Fitlink Heart Rate Monitor Example");

    let central = match BtleplugCentral::new().await {
        Ok(central) => Arc::new(central),
        Err(e) => {
            error!("❌ Bluetooth unavailable: {}", e);
            return Err(e);
        }
    };

    let monitor = SensorDevice::heart_rate(central);
    let mut observer = monitor.observer();

    info!("Searching for heart rate monitors...");
    monitor.start_scan().await?;

    let state = match observer
        .wait_for_phase(Duration::from_secs(60), |p| {
            *p == SessionPhase::Streaming || p.is_terminal()
        })
        .await
    {
        Ok(state) => state,
        Err(e) => {
            error!("❌ No heart rate monitor came online: {}", e);
            monitor.disconnect().await?;
            return Err(e);
        }
    };

    if state.phase != SessionPhase::Streaming {
        warn!("❌ {}", state.connection_state);
        return Ok(());
    }

    info!("✅ {} ({})", state.connection_state, state.device_label);
    info!("Press Ctrl+C to stop monitoring");

    let mut phases = observer.clone();
    let start_time = Instant::now();
    let mut samples = 0u32;
    let mut min_bpm = u16::MAX;
    let mut max_bpm = 0u16;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Stopping...");
                break;
            }
            measurement = observer.next_measurement() => {
                let Some(Measurement::HeartRate(bpm)) = measurement else {
                    continue;
                };
                samples += 1;
                min_bpm = min_bpm.min(bpm);
                max_bpm = max_bpm.max(bpm);

                let elapsed = start_time.elapsed().as_secs();
                println!("[{:02}:{:02}] ❤️  {bpm:3} bpm", elapsed / 60, elapsed % 60);
            }
            changed = phases.changed() => {
                if let Ok(state) = changed {
                    if state.phase.is_terminal() {
                        warn!("❌ {}", state.connection_state);
                        break;
                    }
                }
            }
        }
    }

    info!("🔌 Disconnecting...");
    if let Err(e) = monitor.disconnect().await {
        error!("❌ Failed to disconnect: {}", e);
    }

    println!("\n📊 Session Summary:");
    println!(
        "  Duration: {:02}:{:02}",
        start_time.elapsed().as_secs() / 60,
        start_time.elapsed().as_secs() % 60
    );
    println!("  Samples: {samples}");
    if samples > 0 {
        println!("  Range: {min_bpm}-{max_bpm} bpm");
    }

    Ok(())
}
