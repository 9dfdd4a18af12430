//! Pump driver operations against a simulated pump.

mod common;

use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use common::{connect_ready, engine, next_event, Behavior, SimulatedPump, TestClock};
use pumplink::bluetooth::{codes, BasalProfile, UserOptions};
use pumplink::{
    BolusStopOutcome, ProtocolEngine, PumpDriver, PumpEvent, SerialPumpDriver, Treatment,
};

fn treatment(insulin: f64) -> Treatment {
    Treatment {
        id: format!("bolus-{}", insulin),
        insulin,
        carbs: 0,
        timestamp: Local::now(),
    }
}

async fn ready_driver(pump: &Arc<SimulatedPump>) -> SerialPumpDriver {
    let engine = engine(pump);
    connect_ready(&engine).await;
    SerialPumpDriver::new(engine)
}

#[tokio::test(start_paused = true)]
async fn test_bolus_delivered() {
    let pump = SimulatedPump::new(Behavior::default());
    let driver = ready_driver(&pump).await;
    let mut events = driver.engine().subscribe();

    assert!(driver.bolus(2.5, 0, Local::now(), treatment(2.5)).await);

    let bolus = driver.engine().pump().bolus();
    assert!(bolus.stopped);
    assert!(!bolus.bolusing);
    assert_eq!(bolus.delivered, 2.5);
    assert!(driver.engine().bolusing_treatment().is_none());
    assert_eq!(pump.count(codes::CARBS_ENTRY), 0);

    let event = next_event(&mut events, |e| matches!(e, PumpEvent::BolusProgress { .. })).await;
    assert_eq!(event, PumpEvent::BolusProgress { delivered: 2.5 });
}

#[tokio::test(start_paused = true)]
async fn test_bolus_with_carbs_sends_carbs_first() {
    let pump = SimulatedPump::new(Behavior::default());
    let driver = ready_driver(&pump).await;

    assert!(driver.bolus(1.0, 30, Local::now(), treatment(1.0)).await);

    assert_eq!(
        pump.received(),
        vec![codes::CHECK_VALUE, codes::CARBS_ENTRY, codes::BOLUS_START]
    );
}

#[tokio::test(start_paused = true)]
async fn test_bolus_rejected_by_pump() {
    let pump = SimulatedPump::new(Behavior {
        reject_bolus: true,
        ..Behavior::default()
    });
    let driver = ready_driver(&pump).await;

    assert!(!driver.bolus(1.0, 0, Local::now(), treatment(1.0)).await);
    assert!(driver.engine().pump().bolus().start_failed);
    assert!(driver.engine().bolusing_treatment().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_second_bolus_refused_while_first_in_flight() {
    let pump = SimulatedPump::new(Behavior {
        finish_bolus: false,
        ..Behavior::default()
    });
    let driver = Arc::new(ready_driver(&pump).await);

    let first = tokio::spawn({
        let driver = driver.clone();
        async move { driver.bolus(3.0, 0, Local::now(), treatment(3.0)).await }
    });
    sleep(Duration::from_millis(300)).await;
    assert_eq!(driver.engine().bolusing_treatment().map(|t| t.insulin), Some(3.0));

    // The slot is taken, nothing is sent for the second request
    assert!(!driver.bolus(1.0, 0, Local::now(), treatment(1.0)).await);
    assert_eq!(pump.count(codes::BOLUS_START), 1);

    // Stopping ends the first delivery
    assert!(matches!(
        driver.bolus_stop().await,
        BolusStopOutcome::Acknowledged { .. }
    ));
    let delivered = timeout(Duration::from_secs(1), first).await.unwrap().unwrap();
    assert!(delivered);
    assert!(driver.engine().bolusing_treatment().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stop_ack_leaves_newer_bolus_in_flight() {
    let pump = SimulatedPump::new(Behavior {
        stop_acks_from: None,
        ..Behavior::default()
    });
    let engine = engine(&pump);
    connect_ready(&engine).await;
    engine.begin_bolus(treatment(3.0)).unwrap();

    let stop = tokio::spawn({
        let engine = engine.clone();
        async move { engine.bolus_stop().await }
    });
    sleep(Duration::from_millis(250)).await;

    // The first bolus is released and a second one claims the slot
    assert!(engine.clear_bolus("bolus-3"));
    engine.begin_bolus(treatment(1.0)).unwrap();

    pump.update(|b| b.stop_acks_from = Some(1));
    let outcome = timeout(Duration::from_secs(1), stop).await.unwrap().unwrap();
    assert_eq!(outcome, BolusStopOutcome::Acknowledged { attempts: 3 });
    assert_eq!(engine.bolusing_treatment().map(|t| t.insulin), Some(1.0));
}

#[tokio::test(start_paused = true)]
async fn test_bolus_ends_on_link_loss() {
    let pump = SimulatedPump::new(Behavior {
        finish_bolus: false,
        ..Behavior::default()
    });
    let driver = Arc::new(ready_driver(&pump).await);

    let task = tokio::spawn({
        let driver = driver.clone();
        async move { driver.bolus(3.0, 0, Local::now(), treatment(3.0)).await }
    });
    sleep(Duration::from_millis(300)).await;
    pump.sever();

    let delivered = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert!(!delivered);
    assert!(!driver.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_status() {
    let pump = SimulatedPump::new(Behavior::default());
    let driver = ready_driver(&pump).await;

    assert!(driver.refresh_status().await);

    let status = driver.engine().pump().status();
    assert_eq!(status.daily_total_units, 5.0);
    assert_eq!(status.max_daily_total_units, 25.0);
    assert_eq!(status.reservoir_units, 150.0);
    assert_eq!(status.battery_percent, 80);
    assert!(!status.suspended);
    assert!(status.temp_basal.is_none());
    assert!(driver.engine().pump().last_approaching_daily_limit().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_daily_limit_warning_is_spaced() {
    let pump = SimulatedPump::new(Behavior {
        // 24.00 of 25.00 U today
        status_basic: [0, 0x09, 0x60, 0x09, 0xC4, 0x3A, 0x98, 80],
        ..Behavior::default()
    });
    let driver = ready_driver(&pump).await;
    let mut events = driver.engine().subscribe();

    assert!(driver.refresh_status().await);
    let event = next_event(&mut events, |e| {
        matches!(e, PumpEvent::DailyLimitApproaching { .. })
    })
    .await;
    assert_eq!(
        event,
        PumpEvent::DailyLimitApproaching {
            total: 24.0,
            max: 25.0
        }
    );
    let warned_at = driver.engine().pump().last_approaching_daily_limit();
    assert!(warned_at.is_some());

    // Within the spacing interval no second warning
    sleep(Duration::from_millis(10)).await;
    assert!(driver.refresh_status().await);
    assert_eq!(driver.engine().pump().last_approaching_daily_limit(), warned_at);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, PumpEvent::DailyLimitApproaching { .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn test_temporary_basal_commands_query_status() {
    let pump = SimulatedPump::new(Behavior::default());
    let driver = ready_driver(&pump).await;

    assert!(driver.set_temporary_basal(150, 2).await);
    assert!(driver.set_short_temporary_basal(200, 30).await);
    assert!(!driver.set_short_temporary_basal(200, 60).await);
    assert!(driver.set_high_temporary_basal(250, 60).await);
    assert!(driver.stop_temporary_basal().await);
    assert!(driver.set_extended_bolus(1.5, 4).await);
    assert!(driver.stop_extended_bolus().await);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(
        pump.received(),
        vec![
            codes::CHECK_VALUE,
            codes::TEMP_BASAL_START,
            codes::STATUS_TEMP_BASAL,
            codes::APS_TEMP_BASAL_START,
            codes::STATUS_TEMP_BASAL,
            codes::APS_TEMP_BASAL_START,
            codes::STATUS_TEMP_BASAL,
            codes::TEMP_BASAL_STOP,
            codes::STATUS_TEMP_BASAL,
            codes::EXTENDED_BOLUS_START,
            codes::STATUS_EXTENDED_BOLUS,
            codes::EXTENDED_BOLUS_STOP,
            codes::STATUS_EXTENDED_BOLUS,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_update_basal_schedule() {
    let pump = SimulatedPump::new(Behavior::default());
    let engine = ProtocolEngine::builder(common::config(), pump.clone())
        .clock(TestClock::at_minute_offset(50_000))
        .build();
    connect_ready(&engine).await;
    let driver = SerialPumpDriver::new(engine);

    assert!(driver.update_basal_schedule(&BasalProfile::flat(0.75)).await);

    assert_eq!(
        pump.received(),
        vec![
            codes::CHECK_VALUE,
            codes::SET_TIME,
            codes::SET_BASAL_PROFILE,
            codes::ACTIVATE_BASAL_PROFILE,
            codes::STATUS_BASIC,
            codes::STATUS_TEMP_BASAL,
            codes::STATUS_EXTENDED_BOLUS,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_load_events_records_fetch_time() {
    let pump = SimulatedPump::new(Behavior::default());
    let driver = ready_driver(&pump).await;
    assert!(driver.last_history_fetched().is_none());

    let result = driver.load_events().await;
    assert!(result.success);
    assert!(driver.last_history_fetched().is_some());
    assert_eq!(pump.count(codes::HISTORY_EVENTS), 1);
    assert_eq!(pump.count(codes::COMM_STOP), 1);
}

#[tokio::test(start_paused = true)]
async fn test_apply_user_options() {
    let pump = SimulatedPump::new(Behavior::default());
    let driver = ready_driver(&pump).await;

    let result = driver.apply_user_options(UserOptions::default()).await;
    assert!(result.success);
    assert!(result.enacted);

    pump.update(|b| b.user_options_ok = false);
    let result = driver.apply_user_options(UserOptions::default()).await;
    assert!(!result.success);
}
