//! Simulated sensors
//!
//! Stands in for the devices when no serial channel could be opened. Values
//! follow a short deterministic cycle and go through the same validation as
//! real frames.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ms_core::{Acceptance, Reading, SensorKind, SensorRegistry};

/// Raw frame text of every decimal sensor for tick `n`
pub fn simulated_frames(n: u64) -> [(SensorKind, String); 3] {
    let weight = 70.5 + (n % 20) as f64 * 0.1;
    let temperature = 36.5 + (n % 8) as f64 * 0.05;
    let height = 1.70 + (n % 10) as f64 * 0.01;
    [
        (SensorKind::Weight, weight.to_string()),
        (SensorKind::Temperature, temperature.to_string()),
        (SensorKind::Height, height.to_string()),
    ]
}

/// Validate and store one tick's worth of simulated frames
pub fn apply_tick(registry: &SensorRegistry, n: u64, at: Instant) {
    for (kind, raw) in simulated_frames(n) {
        if let Err(rejection) = registry.accept(kind, &raw, at) {
            debug!("ACQ: simulated {} rejected: {}", kind, rejection);
        }
    }
}

/// Present the validation card unless a code is already waiting to be read
pub fn present_card(registry: &SensorRegistry, at: Instant) -> bool {
    let Acceptance::Exact { expected } = registry.catalog().spec(SensorKind::ValidationCode).acceptance
    else {
        return false;
    };
    registry
        .write_if_absent(SensorKind::ValidationCode, Reading::Code(expected), at)
        .unwrap_or(false)
}

pub async fn run_simulator(
    registry: Arc<SensorRegistry>,
    period: Duration,
    card_period: Duration,
    cancel: CancellationToken,
) {
    info!(
        "ACQ: simulation running (period {:?}, card every {:?})",
        period, card_period
    );

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // None: the card is due on the next tick
    let mut last_card: Option<tokio::time::Instant> = None;
    let mut n: u64 = 0;

    loop {
        let tick_at = tokio::select! {
            at = ticker.tick() => at,
            _ = cancel.cancelled() => break,
        };

        let now = Instant::now();
        apply_tick(&registry, n, now);
        n = n.wrapping_add(1);

        let card_due = last_card.map_or(true, |last| tick_at.duration_since(last) >= card_period);
        if card_due {
            last_card = Some(tick_at);
            if present_card(&registry, now) {
                debug!("ACQ: simulated validation card presented");
            }
        }
    }

    info!("ACQ: simulation stopped");
}
