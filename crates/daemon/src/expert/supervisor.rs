// ExpertSupervisor: one provider call per dedup key at a time.
//
// The in-progress map is guarded by a std mutex held only for a single map
// operation. Waiter accounting happens under the same lock, so a submission
// can never attach to a task that its last waiter is tearing down.
//
// Waiting runs two independent timers: a short poll that detects completion
// and a long heartbeat that only publishes progress. Completion latency is
// bounded by the poll interval alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use conclave_common::ErrorKind;
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::dedup::dedup_key;
use crate::provider::{GenerateRequest, ProviderClient, ProviderError};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpertError {
    #[error("expert analysis timed out after {0:?}")]
    Timeout(Duration),

    #[error("expert analysis failed: {0}")]
    Provider(String),

    #[error("expert analysis was abandoned before it finished")]
    Abandoned,
}

impl ExpertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Provider(_) | Self::Abandoned => ErrorKind::ProviderError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpertSettings {
    /// How often waiters check for completion.
    pub poll_interval: Duration,
    /// How often waiters publish a progress heartbeat.
    pub heartbeat_interval: Duration,
    /// Budget for one provider call (the expert layer of the hierarchy).
    pub task_timeout: Duration,
}

impl Default for ExpertSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(5),
            task_timeout: Duration::from_secs(96),
        }
    }
}

type Outcome = Result<Arc<str>, ExpertError>;
type Registry = Arc<Mutex<HashMap<String, Arc<ExpertTask>>>>;

struct ExpertTask {
    id: u64,
    key: String,
    started_at: Instant,
    /// Mutated only while the registry lock is held.
    waiters: AtomicUsize,
    outcome: Mutex<Option<Outcome>>,
    abort: Mutex<Option<AbortHandle>>,
}

impl ExpertTask {
    fn outcome(&self) -> Option<Outcome> {
        lock(&self.outcome).clone()
    }

    fn finish(&self, outcome: Outcome) {
        let mut slot = lock(&self.outcome);
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }
}

pub struct ExpertSupervisor {
    provider: Arc<dyn ProviderClient>,
    settings: ExpertSettings,
    in_progress: Registry,
    next_id: AtomicU64,
    provider_calls: Arc<AtomicU64>,
}

impl ExpertSupervisor {
    pub fn new(provider: Arc<dyn ProviderClient>, settings: ExpertSettings) -> Self {
        Self {
            provider,
            settings,
            in_progress: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            provider_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn settings(&self) -> ExpertSettings {
        self.settings
    }

    /// Start (or join) the analysis for `request`.
    ///
    /// If a task with the same dedup key is still running, the caller is
    /// attached to it and no provider call is made.
    pub fn submit(&self, request: GenerateRequest) -> ExpertTicket {
        let key = dedup_key(&request.tool, &request.prompt);
        let mut in_progress = lock(&self.in_progress);

        if let Some(task) = in_progress.get(&key) {
            if task.outcome().is_none() {
                let waiters = task.waiters.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(key = %key, waiters, "attached to in-flight expert analysis");
                return ExpertTicket {
                    task: Arc::clone(task),
                    registry: Arc::clone(&self.in_progress),
                    settings: self.settings,
                    merged: true,
                };
            }
        }

        let task = Arc::new(ExpertTask {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key: key.clone(),
            started_at: Instant::now(),
            waiters: AtomicUsize::new(1),
            outcome: Mutex::new(None),
            abort: Mutex::new(None),
        });

        let calls = self.provider_calls.fetch_add(1, Ordering::SeqCst) + 1;
        info!(key = %key, tool = %request.tool, provider_calls = calls, "starting expert analysis");
        let handle = tokio::spawn(run_provider(
            Arc::clone(&self.provider),
            request,
            self.settings.task_timeout,
            Arc::clone(&task),
            Arc::clone(&self.in_progress),
        ));
        *lock(&task.abort) = Some(handle.abort_handle());
        in_progress.insert(key, Arc::clone(&task));

        ExpertTicket {
            task,
            registry: Arc::clone(&self.in_progress),
            settings: self.settings,
            merged: false,
        }
    }

    /// Number of tasks currently registered as in progress.
    pub fn in_progress_len(&self) -> usize {
        lock(&self.in_progress).len()
    }

    /// Total provider calls started since creation.
    pub fn provider_calls(&self) -> u64 {
        self.provider_calls.load(Ordering::SeqCst)
    }
}

async fn run_provider(
    provider: Arc<dyn ProviderClient>,
    request: GenerateRequest,
    timeout: Duration,
    task: Arc<ExpertTask>,
    registry: Registry,
) {
    let outcome = match tokio::time::timeout(timeout, provider.generate(&request, timeout)).await {
        Ok(Ok(content)) => Ok(Arc::<str>::from(content)),
        Ok(Err(ProviderError::Timeout(_))) | Err(_) => Err(ExpertError::Timeout(timeout)),
        Ok(Err(error)) => Err(ExpertError::Provider(error.to_string())),
    };

    match &outcome {
        Ok(content) => debug!(key = %task.key, chars = content.len(), "expert analysis finished"),
        Err(error) => warn!(key = %task.key, %error, "expert analysis failed"),
    }
    task.finish(outcome);
    remove_if_current(&mut lock(&registry), &task);
}

fn remove_if_current(in_progress: &mut HashMap<String, Arc<ExpertTask>>, task: &ExpertTask) {
    if in_progress.get(&task.key).is_some_and(|current| current.id == task.id) {
        in_progress.remove(&task.key);
    }
}

/// A caller's claim on an expert task. Dropping the last ticket of an
/// unfinished task aborts the provider call and frees the dedup key.
pub struct ExpertTicket {
    task: Arc<ExpertTask>,
    registry: Registry,
    settings: ExpertSettings,
    merged: bool,
}

impl ExpertTicket {
    /// True when this ticket joined a task started by someone else.
    pub fn merged(&self) -> bool {
        self.merged
    }

    pub fn key(&self) -> &str {
        &self.task.key
    }

    /// Wait for the task's outcome. `on_heartbeat` is called with the task's
    /// elapsed time every heartbeat interval while it is still running.
    pub async fn wait<F>(self, mut on_heartbeat: F) -> Result<Arc<str>, ExpertError>
    where
        F: FnMut(Duration) + Send,
    {
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let heartbeat_every = self.settings.heartbeat_interval;
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = poll.tick() => {
                    if let Some(outcome) = self.task.outcome() {
                        return outcome;
                    }
                }
                _ = heartbeat.tick() => {
                    if self.task.outcome().is_none() {
                        on_heartbeat(self.task.started_at.elapsed());
                    }
                }
            }
        }
    }
}

impl Drop for ExpertTicket {
    fn drop(&mut self) {
        let mut in_progress = lock(&self.registry);
        let remaining = self.task.waiters.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining > 0 || self.task.outcome().is_some() {
            return;
        }

        if let Some(abort) = lock(&self.task.abort).take() {
            abort.abort();
        }
        self.task.finish(Err(ExpertError::Abandoned));
        remove_if_current(&mut in_progress, &self.task);
        debug!(key = %self.task.key, "last waiter left, expert analysis aborted");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Sleeps for `delay`, then answers or fails.
    struct ScriptedProvider {
        delay: Duration,
        fail_with: Option<ProviderError>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn answering_after(delay: Duration) -> Arc<Self> {
            Arc::new(Self { delay, fail_with: None, calls: AtomicUsize::new(0) })
        }

        fn failing_after(delay: Duration, error: ProviderError) -> Arc<Self> {
            Arc::new(Self { delay, fail_with: Some(error), calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            request: &GenerateRequest,
            _timeout: Duration,
        ) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match &self.fail_with {
                Some(error) => Err(error.clone()),
                None => Ok(format!("analysis of: {}", request.prompt)),
            }
        }
    }

    fn settings(task_timeout: Duration) -> ExpertSettings {
        ExpertSettings {
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(5),
            task_timeout,
        }
    }

    fn request(prompt: &str) -> GenerateRequest {
        GenerateRequest::new("analyze", prompt)
    }

    #[tokio::test(start_paused = true)]
    async fn identical_submissions_share_one_provider_call() {
        let provider = ScriptedProvider::answering_after(Duration::from_secs(2));
        let supervisor = ExpertSupervisor::new(provider.clone(), settings(Duration::from_secs(60)));

        let first = supervisor.submit(request("same findings"));
        tokio::time::advance(Duration::from_millis(10)).await;
        let second = supervisor.submit(request("same findings\r\n"));

        assert!(!first.merged());
        assert!(second.merged());
        assert_eq!(first.key(), second.key());

        let (a, b) = tokio::join!(first.wait(|_| {}), second.wait(|_| {}));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(provider.calls(), 1);
        assert_eq!(supervisor.provider_calls(), 1);
        assert_eq!(supervisor.in_progress_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_is_detected_within_one_poll_interval() {
        let provider = ScriptedProvider::answering_after(Duration::from_millis(1_230));
        let supervisor = ExpertSupervisor::new(provider, settings(Duration::from_secs(60)));

        let started = Instant::now();
        let mut heartbeats = 0;
        let result = supervisor.submit(request("quick")).wait(|_| heartbeats += 1).await;

        assert!(result.is_ok());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_230));
        assert!(
            elapsed <= Duration::from_millis(1_330),
            "completion took {elapsed:?}, far less than the 5s heartbeat"
        );
        assert_eq!(heartbeats, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_fire_on_their_own_schedule() {
        let provider = ScriptedProvider::answering_after(Duration::from_millis(12_050));
        let supervisor = ExpertSupervisor::new(provider, settings(Duration::from_secs(60)));

        let mut beats = Vec::new();
        supervisor.submit(request("slow")).wait(|elapsed| beats.push(elapsed)).await.unwrap();

        assert_eq!(beats.len(), 2);
        assert!(beats[0] >= Duration::from_secs(5) && beats[0] < Duration::from_secs(6));
        assert!(beats[1] >= Duration::from_secs(10) && beats[1] < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_error_reaches_every_waiter_and_frees_the_key() {
        let provider = ScriptedProvider::failing_after(
            Duration::from_millis(300),
            ProviderError::Request("quota exhausted".into()),
        );
        let supervisor = ExpertSupervisor::new(provider.clone(), settings(Duration::from_secs(60)));

        let first = supervisor.submit(request("doomed"));
        let second = supervisor.submit(request("doomed"));
        let (a, b) = tokio::join!(first.wait(|_| {}), second.wait(|_| {}));

        let expected = ExpertError::Provider("provider request failed: quota exhausted".into());
        assert_eq!(a.unwrap_err(), expected);
        assert_eq!(b.unwrap_err(), expected);
        assert_eq!(supervisor.in_progress_len(), 0);

        let retry = supervisor.submit(request("doomed"));
        assert!(!retry.merged());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out_for_all_waiters() {
        let provider = ScriptedProvider::answering_after(Duration::from_secs(30));
        let supervisor = ExpertSupervisor::new(provider, settings(Duration::from_secs(2)));

        let result = supervisor.submit(request("glacial")).wait(|_| {}).await;
        assert_eq!(result.unwrap_err(), ExpertError::Timeout(Duration::from_secs(2)));
        assert_eq!(supervisor.in_progress_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_last_ticket_frees_the_key_immediately() {
        let provider = ScriptedProvider::answering_after(Duration::from_secs(10));
        let supervisor = ExpertSupervisor::new(provider.clone(), settings(Duration::from_secs(60)));

        let ticket = supervisor.submit(request("abandon me"));
        assert_eq!(supervisor.in_progress_len(), 1);
        drop(ticket);
        assert_eq!(supervisor.in_progress_len(), 0);

        let fresh = supervisor.submit(request("abandon me"));
        assert!(!fresh.merged(), "resubmission must start a fresh task, not merge");
        assert_eq!(supervisor.provider_calls(), 2);
        drop(fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_waiter_keeps_the_task_alive() {
        let provider = ScriptedProvider::answering_after(Duration::from_secs(1));
        let supervisor = ExpertSupervisor::new(provider.clone(), settings(Duration::from_secs(60)));

        let first = supervisor.submit(request("shared"));
        let second = supervisor.submit(request("shared"));
        drop(first);
        assert_eq!(supervisor.in_progress_len(), 1);

        let result = second.wait(|_| {}).await.unwrap();
        assert!(result.contains("shared"));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_aborts_the_provider_task() {
        let provider = ScriptedProvider::answering_after(Duration::from_secs(10));
        let supervisor = ExpertSupervisor::new(provider.clone(), settings(Duration::from_secs(60)));

        let waited = tokio::time::timeout(
            Duration::from_secs(1),
            supervisor.submit(request("cut short")).wait(|_| {}),
        )
        .await;
        assert!(waited.is_err());
        assert_eq!(supervisor.in_progress_len(), 0);
    }
}
