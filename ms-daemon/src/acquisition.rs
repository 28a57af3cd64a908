//! Acquisition supervisor
//!
//! Opens every enabled channel during an initial connection phase, then runs
//! each one as its own long-lived task. When no channel reaches `Streaming`
//! (or simulation is forced) a single simulator task replaces them.
//!
//! # Pacing
//! After each poll pass a channel sleeps the busy pause when it read a frame
//! and the idle pause otherwise. Degraded channels retry on a fixed backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ms_core::{BridgeConfig, ChannelConfig, SensorRegistry, TimingConfig};

use crate::channel::{AcquisitionChannel, ChannelState, PollOutcome};
use crate::monitor::SupervisedTask;
use crate::simulator::run_simulator;
use crate::state::{AcquisitionMode, BridgeState};
use crate::transport::Connector;

/// Everything a channel task needs to be (re)started
#[derive(Clone)]
pub struct ChannelContext {
    pub registry: Arc<SensorRegistry>,
    pub connector: Arc<dyn Connector>,
    pub timing: TimingConfig,
    pub error_threshold: u32,
    pub cancel: CancellationToken,
}

impl ChannelContext {
    fn channel(&self, config: ChannelConfig) -> AcquisitionChannel {
        AcquisitionChannel::new(
            config,
            self.connector.clone(),
            self.timing.read_timeout(),
            self.error_threshold,
        )
    }
}

/// Run the initial connection phase and spawn the acquisition tasks.
///
/// Sets the acquisition mode on `state` and returns the tasks for the
/// liveness monitor to supervise.
pub async fn start_acquisition(
    config: &BridgeConfig,
    state: &BridgeState,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
) -> Vec<SupervisedTask> {
    let ctx = ChannelContext {
        registry: state.registry().clone(),
        connector,
        timing: config.timing.clone(),
        error_threshold: config.acquisition.error_threshold,
        cancel: cancel.clone(),
    };

    let channels = if config.acquisition.force_simulation {
        info!("ACQ: simulation forced, serial ports not opened");
        Vec::new()
    } else {
        connect_all(config, &ctx).await
    };

    if !channels.iter().any(|ch| ch.state() == ChannelState::Streaming) {
        if !config.acquisition.force_simulation {
            warn!("ACQ: no serial channel available, falling back to simulation");
        }
        for mut channel in channels {
            channel.close();
        }
        state.set_mode(AcquisitionMode::Simulation);
        return vec![simulator_task(state.registry().clone(), &config.timing, cancel)];
    }

    state.set_mode(AcquisitionMode::Serial);
    let settle = config.timing.settle();
    channels
        .into_iter()
        .map(|channel| channel_task(channel, settle, ctx.clone()))
        .collect()
}

/// Attempt every enabled channel once
async fn connect_all(config: &BridgeConfig, ctx: &ChannelContext) -> Vec<AcquisitionChannel> {
    let mut connected = Vec::new();

    for channel_config in config.enabled_channels() {
        let channel = ctx.channel(channel_config.clone());
        let result = tokio::task::spawn_blocking(move || {
            let mut channel = channel;
            let result = channel.connect();
            (channel, result)
        })
        .await;

        let (mut channel, result) = match result {
            Ok(pair) => pair,
            Err(e) => {
                error!("ACQ: [{}] connect task panicked: {}", channel_config.id, e);
                continue;
            }
        };

        match result {
            Ok(()) => connected.push(channel),
            Err(e) if config.acquisition.retry_unavailable => {
                warn!("ACQ: [{}] unavailable, will keep retrying: {}", channel.id(), e);
                channel.mark_degraded();
                connected.push(channel);
            }
            Err(e) => {
                warn!("ACQ: [{}] unavailable, abandoned: {}", channel.id(), e);
            }
        }
    }

    info!(
        "ACQ: {} of {} enabled channels streaming",
        connected
            .iter()
            .filter(|ch| ch.state() == ChannelState::Streaming)
            .count(),
        config.enabled_channels().count()
    );
    connected
}

fn simulator_task(
    registry: Arc<SensorRegistry>,
    timing: &TimingConfig,
    cancel: CancellationToken,
) -> SupervisedTask {
    let period = timing.simulation_period();
    let card_period = timing.simulation_validation_period();
    SupervisedTask::spawn("simulator", move || {
        tokio::spawn(run_simulator(
            registry.clone(),
            period,
            card_period,
            cancel.clone(),
        ))
    })
}

/// Supervise an already-opened channel. A restarted task begins degraded and
/// reopens the device itself.
fn channel_task(channel: AcquisitionChannel, settle: Duration, ctx: ChannelContext) -> SupervisedTask {
    let name = format!("channel {}", channel.id());
    let config = channel.config().clone();

    let mut first = Some(channel);
    SupervisedTask::spawn(name, move || {
        let (channel, pause) = match first.take() {
            Some(channel) => (channel, settle),
            None => {
                let mut channel = ctx.channel(config.clone());
                channel.mark_degraded();
                (channel, Duration::ZERO)
            }
        };
        tokio::spawn(run_channel(channel, pause, ctx.clone()))
    })
}

/// Drive one channel until cancelled
pub async fn run_channel(mut channel: AcquisitionChannel, settle: Duration, ctx: ChannelContext) {
    let id = channel.id().to_string();

    if !settle.is_zero() && !sleep_or_cancel(settle, &ctx.cancel).await {
        channel.close();
        return;
    }
    debug!("ACQ: [{}] loop starting in state {}", id, channel.state());

    loop {
        let pause = match channel.state() {
            ChannelState::Streaming => {
                let registry = ctx.registry.clone();
                let polled = tokio::task::spawn_blocking(move || {
                    let outcome = channel.poll(&registry);
                    (channel, outcome)
                })
                .await;
                let (polled_channel, outcome) = match polled {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("ACQ: [{}] poll task panicked: {}", id, e);
                        return;
                    }
                };
                channel = polled_channel;
                match outcome {
                    PollOutcome::Degraded(_) => ctx.timing.reconnect_backoff(),
                    other => ctx.timing.pass_pause(other.produced_frame()),
                }
            }
            ChannelState::Degraded | ChannelState::Connecting => {
                let recovered = tokio::task::spawn_blocking(move || {
                    if channel.state() == ChannelState::Connecting {
                        channel.mark_degraded();
                    }
                    let result = channel.recover();
                    (channel, result)
                })
                .await;
                let (recovered_channel, result) = match recovered {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("ACQ: [{}] reconnect task panicked: {}", id, e);
                        return;
                    }
                };
                channel = recovered_channel;
                match result {
                    Ok(()) => ctx.timing.busy_pause(),
                    Err(_) => ctx.timing.reconnect_backoff(),
                }
            }
            ChannelState::Closed => break,
        };

        if !sleep_or_cancel(pause, &ctx.cancel).await {
            break;
        }
    }

    channel.close();
    info!("ACQ: [{}] stopped", id);
}

/// Sleep for `duration`; false when cancelled first
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => !cancel.is_cancelled(),
        _ = cancel.cancelled() => false,
    }
}
