use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Info,
    Warning,
    Error,
    QaFailure,
    ServiceUnhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
}

impl Notification {
    pub fn new(
        notification_type: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_type,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            task_id: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// NotificationSink
// ---------------------------------------------------------------------------

/// Fire-and-forget alert sink.
pub trait NotificationSink: Send + Sync {
    fn on_notification(&self, notification: Notification);
}

// ---------------------------------------------------------------------------
// NotificationManager
// ---------------------------------------------------------------------------

/// Bounded in-memory store; the oldest notifications are evicted first.
#[derive(Debug, Clone)]
pub struct NotificationManager {
    notifications: VecDeque<Notification>,
    max_notifications: usize,
}

impl NotificationManager {
    pub fn new(max: usize) -> Self {
        Self {
            notifications: VecDeque::new(),
            max_notifications: max,
        }
    }

    pub fn push(&mut self, n: Notification) {
        self.notifications.push_back(n);
        while self.notifications.len() > self.max_notifications {
            self.notifications.pop_front();
        }
    }

    pub fn list_all(&self) -> Vec<&Notification> {
        self.notifications.iter().collect()
    }

    pub fn count(&self) -> usize {
        self.notifications.len()
    }
}

// ---------------------------------------------------------------------------
// SharedNotifications
// ---------------------------------------------------------------------------

/// Thread-safe [`NotificationManager`] usable as a [`NotificationSink`].
#[derive(Debug, Clone)]
pub struct SharedNotifications {
    inner: Arc<Mutex<NotificationManager>>,
}

impl SharedNotifications {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NotificationManager::new(max))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NotificationManager> {
        self.inner.lock().unwrap_or_else(|e| {
            warn!("notification store lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Owned copy of every stored notification, oldest first.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.lock().list_all().into_iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.lock().count()
    }
}

impl NotificationSink for SharedNotifications {
    fn on_notification(&self, notification: Notification) {
        debug!(
            kind = ?notification.notification_type,
            title = %notification.title,
            "notification stored"
        );
        self.lock().push(notification);
    }
}
