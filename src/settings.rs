use crate::db::Database;
use crate::errors::AppResult;
use crate::models::AdjustmentSettings;
use std::sync::Arc;
use tokio::sync::watch;

/// Read side of the configuration collaborator. Every committed update is
/// published to subscribers as a full settings snapshot.
#[derive(Clone)]
pub struct SettingsHub {
    db: Arc<Database>,
    sender: Arc<watch::Sender<AdjustmentSettings>>,
}

impl SettingsHub {
    pub fn load(db: Arc<Database>) -> AppResult<Self> {
        let settings = db.get_settings()?;
        let (sender, _receiver) = watch::channel(settings);
        Ok(Self {
            db,
            sender: Arc::new(sender),
        })
    }

    pub fn current(&self) -> AdjustmentSettings {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AdjustmentSettings> {
        self.sender.subscribe()
    }

    /// Applies a JSON merge-patch, persists it, then notifies subscribers.
    pub fn update(&self, update: serde_json::Value) -> AppResult<AdjustmentSettings> {
        let settings = self.db.update_settings(update)?;
        self.sender.send_replace(settings.clone());
        tracing::info!(
            units = ?settings.units,
            max_sensitivity_ratio = settings.max_sensitivity_ratio,
            "adjustment settings updated"
        );
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::SettingsHub;
    use crate::db::Database;
    use std::sync::Arc;

    #[test]
    fn subscribers_observe_committed_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let hub = SettingsHub::load(db).expect("hub");
        let mut receiver = hub.subscribe();
        assert!(!receiver.has_changed().expect("sender alive"));

        hub.update(serde_json::json!({ "exerciseMode": true }))
            .expect("update");
        assert!(receiver.has_changed().expect("sender alive"));
        assert!(receiver.borrow_and_update().exercise_mode);
        assert!(hub.current().exercise_mode);
    }

    #[test]
    fn rejected_update_is_not_published() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let hub = SettingsHub::load(db).expect("hub");
        let receiver = hub.subscribe();

        assert!(hub
            .update(serde_json::json!({ "schedulerTickSeconds": 0 }))
            .is_err());
        assert!(!receiver.has_changed().expect("sender alive"));
        assert_eq!(hub.current().scheduler_tick_seconds, 60);
    }
}
