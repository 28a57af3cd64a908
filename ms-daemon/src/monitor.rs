//! Liveness monitor
//!
//! Every heartbeat checks the supervised tasks and respawns any that ended
//! while the daemon is still running. Every few heartbeats it logs the
//! aggregate status. On shutdown it waits for all supervised tasks to exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::BridgeState;

type Spawner = Box<dyn FnMut() -> JoinHandle<()> + Send>;

/// A long-lived task that can be started again
pub struct SupervisedTask {
    name: String,
    spawner: Spawner,
    handle: JoinHandle<()>,
    restarts: u32,
}

impl SupervisedTask {
    /// Start the task now through `spawner`, which is kept for restarts
    pub fn spawn<F>(name: impl Into<String>, mut spawner: F) -> Self
    where
        F: FnMut() -> JoinHandle<()> + Send + 'static,
    {
        let handle = spawner();
        Self {
            name: name.into(),
            spawner: Box::new(spawner),
            handle,
            restarts: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn restart(&mut self) {
        self.restarts += 1;
        self.handle = (self.spawner)();
    }

    async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!("SHUTDOWN: task {} ended abnormally: {}", self.name, e);
        }
    }
}

/// Respawn every finished task. Returns how many were restarted.
pub fn revive_finished(tasks: &mut [SupervisedTask]) -> usize {
    let mut revived = 0;
    for task in tasks.iter_mut().filter(|t| t.is_finished()) {
        warn!(
            "HEARTBEAT: task {} is not running, restarting (restart #{})",
            task.name,
            task.restarts + 1
        );
        task.restart();
        revived += 1;
    }
    revived
}

pub async fn run_monitor(
    mut tasks: Vec<SupervisedTask>,
    state: Arc<BridgeState>,
    heartbeat: Duration,
    status_every: u64,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let status_every = status_every.max(1);
    let mut beats: u64 = 0;

    info!("HEARTBEAT: supervising {} tasks every {:?}", tasks.len(), heartbeat);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(heartbeat) => {}
            _ = cancel.cancelled() => break,
        }
        if cancel.is_cancelled() {
            break;
        }

        beats += 1;
        let revived = revive_finished(&mut tasks);
        debug!("HEARTBEAT: #{} ({} revived)", beats, revived);

        if beats % status_every == 0 {
            log_status(&state, &tasks, started.elapsed());
        }
    }

    info!("SHUTDOWN: waiting for {} tasks", tasks.len());
    for task in tasks {
        task.join().await;
    }
    info!("SHUTDOWN: all supervised tasks stopped");
}

/// One `kind=value<unit>` entry per slot, raw values
fn slot_summary(state: &BridgeState) -> String {
    let registry = state.registry();
    let slots: Vec<String> = registry
        .snapshot()
        .into_iter()
        .map(|(kind, value, at)| {
            let unit = &registry.catalog().spec(kind).unit;
            match (value, at) {
                (Some(v), Some(at)) => {
                    format!("{}={}{} ({}s ago)", kind, v, unit, at.elapsed().as_secs())
                }
                (Some(v), None) => format!("{}={}{}", kind, v, unit),
                (None, _) => format!("{}=none", kind),
            }
        })
        .collect();
    slots.join(" ")
}

fn log_status(state: &BridgeState, tasks: &[SupervisedTask], uptime: Duration) {
    let restarts: u32 = tasks.iter().map(SupervisedTask::restarts).sum();

    info!(
        "HEARTBEAT: uptime={}s mode={} clients={} restarts={} {}",
        uptime.as_secs(),
        state.mode(),
        state.session_count(),
        restarts,
        slot_summary(state)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms_core::{SensorCatalog, SensorRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state() -> Arc<BridgeState> {
        let registry = Arc::new(SensorRegistry::new(Arc::new(SensorCatalog::builtin().unwrap())));
        Arc::new(BridgeState::new(registry, vec![]))
    }

    #[test]
    fn test_slot_summary_carries_units() {
        let state = state();
        state
            .registry()
            .accept(ms_core::SensorKind::Weight, "70.4", Instant::now())
            .unwrap();
        assert_eq!(
            slot_summary(&state),
            "weight=70.4kg (0s ago) temperature=none height=none validation_code=none"
        );
    }

    #[tokio::test]
    async fn test_finished_task_is_restarted() {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = starts.clone();
        let mut tasks = vec![SupervisedTask::spawn("short", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async {})
        })];

        while !tasks[0].is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(revive_finished(&mut tasks), 1);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(tasks[0].restarts(), 1);
    }

    #[tokio::test]
    async fn test_running_task_is_left_alone() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut tasks = vec![SupervisedTask::spawn("long", move || {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        })];

        assert_eq!(revive_finished(&mut tasks), 0);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_joins_tasks_on_shutdown() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = SupervisedTask::spawn("worker", move || {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        });

        let monitor = tokio::spawn(run_monitor(
            vec![task],
            state(),
            Duration::from_secs(10),
            6,
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(65)).await;
        cancel.cancel();
        monitor.await.unwrap();
    }
}
