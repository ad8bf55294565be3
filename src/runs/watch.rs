use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::{ApiClient, ClientError};
use crate::runs::model::{RunRecord, parse_logs};
use crate::runs::sheet;
use crate::runs::steps::{Step, reduce_steps};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// One rendered view of a run: the fetched record plus everything derived
/// from its log stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RunView {
    pub run: RunRecord,
    pub steps: Vec<Step>,
    pub sheet_url: Option<String>,
}

/// The only states the rendering layer ever sees. Network and parse failures
/// stop at the poller boundary; a failed run is a status on its snapshot,
/// not a separate channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchUpdate {
    /// No snapshot fetched yet.
    Loading,
    /// Latest snapshot. Terminal runs deliver their final snapshot here,
    /// after which the subscription closes.
    Snapshot(RunView),
    /// The backend has no run under this id. Polling has stopped.
    NotFound,
}

/// Spawns poll subscriptions against a backend. Construction takes the
/// client and interval explicitly so tests and multi-backend setups can
/// substitute both.
pub struct RunWatcher {
    client: Arc<dyn ApiClient>,
    config: WatchConfig,
}

impl RunWatcher {
    pub fn new(client: Arc<dyn ApiClient>, config: WatchConfig) -> Self {
        Self { client, config }
    }

    /// Start polling `run_id` until it reaches a terminal state. The returned
    /// handle is the only way to observe the run; stopping or dropping it
    /// ends the subscription and guarantees no further state is published.
    pub fn spawn(&self, run_id: &str) -> WatchHandle {
        let (tx, rx) = watch::channel(WatchUpdate::Loading);
        let client = self.client.clone();
        let interval = self.config.interval;
        let run_id = run_id.to_string();

        let task = tokio::spawn(async move {
            poll_loop(client, run_id, interval, tx).await;
        });

        WatchHandle { rx, task }
    }
}

/// Owning handle for an active poll subscription. Each watched run gets its
/// own channel, so a late response for a previous subject cannot leak into a
/// new one.
pub struct WatchHandle {
    rx: watch::Receiver<WatchUpdate>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Wait for the next update. Returns `None` once the poller has exited
    /// and its final update has been observed.
    pub async fn changed(&mut self) -> Option<WatchUpdate> {
        match self.rx.changed().await {
            Ok(()) => Some(self.rx.borrow_and_update().clone()),
            Err(_) => None,
        }
    }

    /// Latest published update, without waiting.
    pub fn latest(&self) -> WatchUpdate {
        self.rx.borrow().clone()
    }

    /// Stop polling immediately. Any in-flight fetch is dropped, not applied.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop(
    client: Arc<dyn ApiClient>,
    run_id: String,
    interval: Duration,
    tx: watch::Sender<WatchUpdate>,
) {
    let mut ticker = tokio::time::interval(interval);
    // Retained for the run's lifetime once found; a later poll that lacks
    // the label never downgrades the result.
    let mut sheet_url: Option<String> = None;

    loop {
        // First tick fires immediately; one fetch in flight at a time since
        // it is awaited inline before the next tick.
        ticker.tick().await;

        let snapshot = match client.fetch_run(&run_id).await {
            Ok(snapshot) => snapshot,
            Err(ClientError::NotFound) => {
                let _ = tx.send(WatchUpdate::NotFound);
                return;
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "poll failed, retrying next tick");
                continue;
            }
        };

        let logs = parse_logs(&snapshot.logs);
        let steps = reduce_steps(&logs);
        if sheet_url.is_none() {
            sheet_url = sheet::scan_logs(&logs);
        }

        let terminal = snapshot.run.status.is_terminal();
        let view = RunView {
            run: snapshot.run,
            steps,
            sheet_url: sheet_url.clone(),
        };

        if tx.send(WatchUpdate::Snapshot(view)).is_err() {
            // Every receiver is gone.
            return;
        }
        if terminal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::model::{LogEvent, RunSnapshot, RunStatus};
    use crate::runs::steps::StepStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run(run_id: &str, status: &str) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            script_name: "api_powerhouse.py".to_string(),
            status: RunStatus::parse(status),
            start_time: "2024-05-01T10:00:00".to_string(),
            end_time: None,
        }
    }

    fn log(event_type: &str, data: serde_json::Value) -> LogEvent {
        LogEvent {
            id: 0,
            run_id: "r".to_string(),
            timestamp: "2024-05-01T10:00:01".to_string(),
            event_type: event_type.to_string(),
            data,
        }
    }

    /// Replays a scripted sequence of responses, then keeps repeating the
    /// last configured fallback. Counts every fetch.
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<RunSnapshot, ClientError>>>,
        fallback: Option<RunSnapshot>,
        fetches: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<RunSnapshot, ClientError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                fallback: None,
                fetches: AtomicUsize::new(0),
            }
        }

        fn repeating(snapshot: RunSnapshot) -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                fallback: Some(snapshot),
                fetches: AtomicUsize::new(0),
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ApiClient for ScriptedClient {
        async fn fetch_run(&self, _run_id: &str) -> Result<RunSnapshot, ClientError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(next) = self.responses.lock().unwrap().pop_front() {
                return next;
            }
            match &self.fallback {
                Some(snapshot) => Ok(snapshot.clone()),
                None => Err(ClientError::NotFound),
            }
        }

        async fn list_runs(&self) -> Result<Vec<RunRecord>, ClientError> {
            Ok(vec![])
        }

        async fn admin_runs(
            &self,
            _limit: usize,
        ) -> Result<Vec<crate::runs::model::AdminRun>, ClientError> {
            Ok(vec![])
        }

        async fn lookup_run(&self, _session_id: &str) -> Result<String, ClientError> {
            Err(ClientError::NotFound)
        }
    }

    fn watcher(client: Arc<ScriptedClient>) -> RunWatcher {
        RunWatcher::new(client, WatchConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_carries_reduced_steps() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(RunSnapshot {
            run: run("r1", "COMPLETED"),
            logs: vec![
                log("step_start", json!({"step_id": "s1", "step_name": "Fetch"})),
                log(
                    "step_end",
                    json!({"step_id": "s1", "status": "success", "output": "Sheet URL: https://docs.google.com/x"}),
                ),
            ],
        })]));
        let mut handle = watcher(client).spawn("r1");

        let update = handle.changed().await.unwrap();
        let WatchUpdate::Snapshot(view) = update else {
            panic!("expected snapshot, got {update:?}");
        };
        assert_eq!(view.run.status, RunStatus::Completed);
        assert_eq!(view.steps.len(), 1);
        assert_eq!(view.steps[0].status, StepStatus::Success);
        assert_eq!(view.sheet_url.as_deref(), Some("https://docs.google.com/x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_status_halts_polling() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(RunSnapshot {
                run: run("r1", "RUNNING"),
                logs: vec![],
            }),
            Ok(RunSnapshot {
                run: run("r1", "COMPLETED"),
                logs: vec![],
            }),
        ]));
        let mut handle = watcher(client.clone()).spawn("r1");

        let first = handle.changed().await.unwrap();
        assert!(matches!(first, WatchUpdate::Snapshot(ref v) if v.run.status == RunStatus::Running));
        let second = handle.changed().await.unwrap();
        assert!(
            matches!(second, WatchUpdate::Snapshot(ref v) if v.run.status == RunStatus::Completed)
        );
        assert!(handle.changed().await.is_none());

        let after_terminal = client.fetch_count();
        assert_eq!(after_terminal, 2);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(client.fetch_count(), after_terminal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_stops_polling() {
        let client = Arc::new(ScriptedClient::new(vec![Err(ClientError::NotFound)]));
        let mut handle = watcher(client.clone()).spawn("ghost");

        assert_eq!(handle.changed().await, Some(WatchUpdate::NotFound));
        assert!(handle.changed().await.is_none());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(client.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retries_without_surfacing() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(ClientError::Api {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body: "upstream down".to_string(),
            }),
            Ok(RunSnapshot {
                run: run("r1", "COMPLETED"),
                logs: vec![],
            }),
        ]));
        let mut handle = watcher(client.clone()).spawn("r1");

        // The failed tick publishes nothing; the next successful tick does.
        let update = handle.changed().await.unwrap();
        assert!(matches!(update, WatchUpdate::Snapshot(_)));
        assert_eq!(client.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sheet_url_retained_once_found() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(RunSnapshot {
                run: run("r1", "RUNNING"),
                logs: vec![log(
                    "SCRIPT_OUTPUT",
                    json!({"stdout": "Sheet URL: https://docs.google.com/kept"}),
                )],
            }),
            // Later snapshot without the label: the link must survive.
            Ok(RunSnapshot {
                run: run("r1", "COMPLETED"),
                logs: vec![],
            }),
        ]));
        let mut handle = watcher(client).spawn("r1");

        let first = handle.changed().await.unwrap();
        let WatchUpdate::Snapshot(view) = first else {
            panic!("expected snapshot");
        };
        assert_eq!(view.sheet_url.as_deref(), Some("https://docs.google.com/kept"));

        let second = handle.changed().await.unwrap();
        let WatchUpdate::Snapshot(view) = second else {
            panic!("expected snapshot");
        };
        assert_eq!(view.sheet_url.as_deref(), Some("https://docs.google.com/kept"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_subscription_never_updates_again() {
        let client_a = Arc::new(ScriptedClient::repeating(RunSnapshot {
            run: run("run-a", "RUNNING"),
            logs: vec![],
        }));
        let mut handle_a = watcher(client_a).spawn("run-a");
        assert!(matches!(
            handle_a.changed().await,
            Some(WatchUpdate::Snapshot(_))
        ));

        // Switch subjects: stop A, start B. B has its own channel, so
        // whatever A's poller had in flight cannot reach it.
        handle_a.stop();

        let client_b = Arc::new(ScriptedClient::new(vec![Ok(RunSnapshot {
            run: run("run-b", "COMPLETED"),
            logs: vec![],
        })]));
        let mut handle_b = watcher(client_b).spawn("run-b");

        while let Some(update) = handle_b.changed().await {
            if let WatchUpdate::Snapshot(view) = update {
                assert_eq!(view.run.run_id, "run-b");
            }
        }

        // A's subscription is closed; nothing further arrives.
        assert!(handle_a.changed().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_log_entries_do_not_abort_snapshot() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(RunSnapshot {
            run: run("r1", "COMPLETED"),
            logs: vec![
                log("step_start", json!("garbage {{")),
                log("step_start", json!({"step_id": "s2", "step_name": "Enrich"})),
            ],
        })]));
        let mut handle = watcher(client).spawn("r1");

        let update = handle.changed().await.unwrap();
        let WatchUpdate::Snapshot(view) = update else {
            panic!("expected snapshot");
        };
        assert_eq!(view.steps.len(), 1);
        assert_eq!(view.steps[0].id, "s2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state_is_loading() {
        let client = Arc::new(ScriptedClient::repeating(RunSnapshot {
            run: run("r1", "RUNNING"),
            logs: vec![],
        }));
        let handle = watcher(client).spawn("r1");
        // Before the first poll completes the view is Loading.
        assert_eq!(handle.latest(), WatchUpdate::Loading);
    }
}
