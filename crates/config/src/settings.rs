//! Live view of [`ScheduledJobSettings`] that components observe for changes.

use tokio::sync::watch;

use crate::schema::ScheduledJobSettings;

/// Shared, updatable settings. Cloning yields another handle to the same value.
#[derive(Clone)]
pub struct SettingsHandle {
    tx: watch::Sender<ScheduledJobSettings>,
}

impl SettingsHandle {
    pub fn new(initial: ScheduledJobSettings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Snapshot of the current settings.
    pub fn current(&self) -> ScheduledJobSettings {
        self.tx.borrow().clone()
    }

    /// Receiver that is notified on every effective change.
    pub fn subscribe(&self) -> watch::Receiver<ScheduledJobSettings> {
        self.tx.subscribe()
    }

    /// Replace the settings. Returns `false` when nothing changed, in which
    /// case subscribers are not woken.
    pub fn update(&self, settings: ScheduledJobSettings) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        })
    }

    /// Apply an in-place edit to the current settings.
    pub fn modify(&self, edit: impl FnOnce(&mut ScheduledJobSettings)) -> bool {
        let mut next = self.current();
        edit(&mut next);
        self.update(next)
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(ScheduledJobSettings::default())
    }
}

impl std::fmt::Debug for SettingsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsHandle")
            .field("current", &*self.tx.borrow())
            .finish()
    }
}
