use crate::db::{AdjustmentFilter, Database, SortKey};
use crate::errors::{AppError, AppResult};
use crate::lifecycle::Transition;
use crate::models::{AdjustmentKind, AdjustmentRecord};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::time::Duration;

pub const MAX_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledActivation {
    pub adjustment_id: String,
    pub kind: AdjustmentKind,
    pub start_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
}

/// Cancels one pending activation. Clones share the same flag.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as this token, so `changed` only ends on a new value.
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

struct PendingActivation {
    activation: ScheduledActivation,
    token: CancellationToken,
}

pub type ExecutorFuture = Pin<Box<dyn Future<Output = Transition> + Send>>;
pub type Executor = Arc<dyn Fn(String) -> ExecutorFuture + Send + Sync>;

/// Waits for future-dated adjustments to reach their start time and hands
/// them to the executor, which enacts them with an audit of the displaced record.
#[derive(Clone)]
pub struct Scheduler {
    db: Arc<Database>,
    pending: Arc<Mutex<HashMap<String, PendingActivation>>>,
    executor: Arc<RwLock<Option<Executor>>>,
    max_tick: Duration,
}

impl Scheduler {
    pub fn new(db: Arc<Database>, max_tick: Duration) -> Self {
        Self {
            db,
            pending: Arc::new(Mutex::new(HashMap::new())),
            executor: Arc::new(RwLock::new(None)),
            max_tick: max_tick.min(MAX_TICK).max(Duration::from_millis(1)),
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        match self.executor.write() {
            Ok(mut writer) => *writer = Some(executor),
            Err(_) => tracing::error!("scheduler executor lock poisoned; executor not installed"),
        }
    }

    /// Persists `record` disabled with its start time, then arms a timer for it.
    pub async fn schedule(&self, mut record: AdjustmentRecord, start_at: DateTime<Utc>) -> AppResult<ScheduledActivation> {
        if record.is_preset {
            return Err(AppError::InvalidInput("presets cannot be scheduled".to_string()));
        }
        record.enabled = false;
        record.activated_at = start_at;
        record.scheduled_at = Some(start_at);
        record.sync_pending = true;
        self.db.insert_adjustment(&record)?;

        let activation = ScheduledActivation {
            adjustment_id: record.id.clone(),
            kind: record.kind,
            start_at,
            queued_at: Utc::now(),
        };
        self.arm(activation.clone()).await;
        tracing::info!(
            adjustment_id = %record.id,
            kind = record.kind.as_str(),
            start_at = %start_at,
            "adjustment scheduled"
        );
        Ok(activation)
    }

    /// Re-arms scheduled records left over from a previous process.
    pub async fn restore_pending(&self) -> AppResult<usize> {
        let mut restored = 0usize;
        for kind in AdjustmentKind::ALL {
            let records = self
                .db
                .list_adjustments(kind, &AdjustmentFilter::scheduled(), SortKey::ActivatedAt, true)?;
            for record in records {
                let Some(start_at) = record.scheduled_at else {
                    continue;
                };
                self.arm(ScheduledActivation {
                    adjustment_id: record.id,
                    kind,
                    start_at,
                    queued_at: Utc::now(),
                })
                .await;
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::info!(count = restored, "restored pending scheduled adjustments");
        }
        Ok(restored)
    }

    pub async fn cancel(&self, adjustment_id: &str) -> bool {
        let removed = self.pending.lock().await.remove(adjustment_id);
        match removed {
            Some(pending) => {
                pending.token.cancel();
                tracing::info!(adjustment_id = %adjustment_id, "scheduled activation canceled");
                true
            }
            None => false,
        }
    }

    pub async fn pending(&self) -> Vec<ScheduledActivation> {
        let pending = self.pending.lock().await;
        let mut activations = pending
            .values()
            .map(|entry| entry.activation.clone())
            .collect::<Vec<_>>();
        activations.sort_by_key(|activation| activation.start_at);
        activations
    }

    async fn arm(&self, activation: ScheduledActivation) {
        let token = CancellationToken::new();
        {
            let mut pending = self.pending.lock().await;
            if let Some(previous) = pending.insert(
                activation.adjustment_id.clone(),
                PendingActivation {
                    activation: activation.clone(),
                    token: token.clone(),
                },
            ) {
                previous.token.cancel();
            }
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            let reached = wait_until(activation.start_at, &token, scheduler.max_tick).await;
            if !reached {
                return;
            }
            {
                let mut pending = scheduler.pending.lock().await;
                let still_ours = pending
                    .get(&activation.adjustment_id)
                    .is_some_and(|entry| !entry.token.is_cancelled() && Arc::ptr_eq(&entry.token.sender, &token.sender));
                if !still_ours {
                    return;
                }
                pending.remove(&activation.adjustment_id);
            }

            let transition = scheduler.execute(activation.adjustment_id.clone()).await;
            match transition {
                Transition::Aborted => {
                    tracing::warn!(adjustment_id = %activation.adjustment_id, "scheduled activation aborted");
                }
                Transition::NotFound => {
                    tracing::info!(adjustment_id = %activation.adjustment_id, "scheduled adjustment vanished before start");
                }
                _ => {
                    tracing::info!(adjustment_id = %activation.adjustment_id, "scheduled adjustment started");
                }
            }
        });
    }

    async fn execute(&self, adjustment_id: String) -> Transition {
        let executor = match self.executor.read() {
            Ok(reader) => reader.clone(),
            Err(_) => None,
        };
        match executor {
            Some(executor) => executor(adjustment_id).await,
            None => {
                tracing::warn!(adjustment_id = %adjustment_id, "no scheduler executor installed");
                Transition::Aborted
            }
        }
    }
}

/// Sleeps in ticks of at most `max_tick` until `start_at`. Returns false when canceled first.
async fn wait_until(start_at: DateTime<Utc>, token: &CancellationToken, max_tick: Duration) -> bool {
    loop {
        if token.is_cancelled() {
            return false;
        }
        let remaining = start_at.signed_duration_since(Utc::now()).num_milliseconds();
        if remaining <= 0 {
            return true;
        }
        let tick = Duration::from_millis(remaining as u64).min(max_tick);
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = token.cancelled() => return false,
        }
    }
}
