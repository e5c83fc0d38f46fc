//! Runs both sensor sessions against the in-memory central.

use fitlink::{
    mock::{MockCentral, MockLink},
    PeripheralIdentity, Result, SensorDevice, SessionConfig, SessionPhase,
    HEART_RATE_MEASUREMENT_CHAR_UUID, HEART_RATE_SERVICE_UUID, RQ_CHAR_UUID, VCO2_CHAR_UUID,
    VO2MAX_SERVICE_UUID, VO2_CHAR_UUID,
};
use std::{sync::Arc, time::Duration};
use tracing::info;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let hr_link = MockLink::heart_rate();
    let vo2_link = MockLink::vo2max();

    let central = MockCentral::new();
    central.advertise(
        PeripheralIdentity::new("sim-hr", Some("Simulated HRM".to_string())),
        vec![HEART_RATE_SERVICE_UUID],
        hr_link.clone(),
    );
    central.advertise(
        PeripheralIdentity::new("sim-vo2", Some("Simulated VO2".to_string())),
        vec![VO2MAX_SERVICE_UUID],
        vo2_link.clone(),
    );
    let central = Arc::new(central);

    let config = SessionConfig {
        settle_delay_ms: 50,
        ..SessionConfig::default()
    };
    let heart_rate = SensorDevice::heart_rate(central.clone()).with_config(config.clone());
    let vo2max = SensorDevice::vo2max(central).with_config(config);

    let mut hr_observer = heart_rate.observer();
    let mut vo2_observer = vo2max.observer();

    heart_rate.start_scan().await?;
    vo2max.start_scan().await?;

    hr_observer
        .wait_for_phase(WAIT, |p| *p == SessionPhase::Streaming)
        .await?;
    vo2_observer
        .wait_for_phase(WAIT, |p| *p == SessionPhase::Streaming)
        .await?;

    for step in 0..10u8 {
        // 8-bit heart rate, then a 16-bit one every third frame
        if step % 3 == 0 {
            let bpm = 120 + u16::from(step);
            let [lo, hi] = bpm.to_le_bytes();
            hr_link.notify(HEART_RATE_MEASUREMENT_CHAR_UUID, &[0x01, lo, hi]);
        } else {
            hr_link.notify(HEART_RATE_MEASUREMENT_CHAR_UUID, &[0x00, 110 + step]);
        }

        let vo2 = 1.5 + f32::from(step) * 0.1;
        let vco2 = 1.3 + f32::from(step) * 0.12;
        vo2_link.notify(VO2_CHAR_UUID, &vo2.to_le_bytes());
        vo2_link.notify(VCO2_CHAR_UUID, &vco2.to_le_bytes());
        vo2_link.notify(RQ_CHAR_UUID, &(vco2 / vo2).to_le_bytes());

        tokio::time::sleep(Duration::from_millis(100)).await;

        let hr = heart_rate.state();
        let vo2 = vo2max.state();
        info!(
            "{}: {:?} | {}: {:?}",
            hr.device_label, hr.readings, vo2.device_label, vo2.readings
        );
    }

    hr_link.drop_link();
    let state = hr_observer
        .wait_for_phase(WAIT, |p| *p == SessionPhase::Disconnected)
        .await?;
    info!("{}: {} {:?}", state.device_label, state.connection_state, state.readings);

    vo2max.disconnect().await?;
    vo2_observer
        .wait_for_phase(WAIT, |p| *p == SessionPhase::Disconnected)
        .await?;

    Ok(())
}
