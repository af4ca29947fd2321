use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

use crate::error::AppError;
use crate::models::tracking::GeoPoint;
use crate::services::{
    AnalyticsService, GeolocationProvider, NotificationProvider, Permission, ShareProvider,
};

/// Notification provider for environments without a notification center.
///
/// Starts from a fixed permission and answers a prompt with a fixed decision.
/// Shown notifications are logged and kept for inspection.
pub struct HeadlessNotifier {
    permission: Mutex<Permission>,
    prompt_answer: Permission,
    prompts: Mutex<usize>,
    shown: Mutex<Vec<(String, String)>>,
    fail_show: Mutex<bool>,
}

impl HeadlessNotifier {
    pub fn new(initial: Permission, prompt_answer: Permission) -> Self {
        Self {
            permission: Mutex::new(initial),
            prompt_answer,
            prompts: Mutex::new(0),
            shown: Mutex::new(Vec::new()),
            fail_show: Mutex::new(false),
        }
    }

    pub fn granted() -> Self {
        Self::new(Permission::Granted, Permission::Granted)
    }

    pub fn prompts(&self) -> usize {
        *self.prompts.lock()
    }

    pub fn shown(&self) -> Vec<(String, String)> {
        self.shown.lock().clone()
    }

    /// Simulates the permission being revoked while a session is running.
    pub fn revoke(&self) {
        *self.permission.lock() = Permission::Denied;
        *self.fail_show.lock() = true;
    }
}

#[async_trait]
impl NotificationProvider for HeadlessNotifier {
    fn permission(&self) -> Permission {
        *self.permission.lock()
    }

    async fn request_permission(&self) -> Permission {
        *self.prompts.lock() += 1;
        let mut permission = self.permission.lock();
        if *permission == Permission::Default {
            *permission = self.prompt_answer;
        }
        *permission
    }

    fn show(&self, title: &str, body: &str) -> Result<(), AppError> {
        if *self.fail_show.lock() {
            return Err(AppError::PermissionDenied(
                "notification permission revoked".to_string(),
            ));
        }
        info!(title, body, "notification shown");
        self.shown.lock().push((title.to_string(), body.to_string()));
        Ok(())
    }
}

/// Geolocation provider answering with a fixed result.
pub struct FixedGeolocation {
    result: Mutex<Result<GeoPoint, AppError>>,
    requests: Mutex<usize>,
}

impl FixedGeolocation {
    pub fn at(point: GeoPoint) -> Self {
        Self::with_result(Ok(point))
    }

    pub fn with_result(result: Result<GeoPoint, AppError>) -> Self {
        Self {
            result: Mutex::new(result),
            requests: Mutex::new(0),
        }
    }

    pub fn set(&self, result: Result<GeoPoint, AppError>) {
        *self.result.lock() = result;
    }

    pub fn requests(&self) -> usize {
        *self.requests.lock()
    }
}

#[async_trait]
impl GeolocationProvider for FixedGeolocation {
    async fn current_position(&self) -> Result<GeoPoint, AppError> {
        *self.requests.lock() += 1;
        self.result.lock().clone()
    }
}

/// Analytics sink that logs every event and records its name.
#[derive(Default)]
pub struct LoggingAnalytics {
    events: Mutex<Vec<(String, Value)>>,
}

impl LoggingAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(|(name, _)| name.clone()).collect()
    }
}

impl AnalyticsService for LoggingAnalytics {
    fn track_event(&self, name: &str, payload: Value) {
        info!(event = name, payload = %payload, "analytics event");
        self.events.lock().push((name.to_string(), payload));
    }
}

#[derive(Default)]
pub struct LoggingShare {
    shared: Mutex<Vec<String>>,
}

impl LoggingShare {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Vec<String> {
        self.shared.lock().clone()
    }
}

#[async_trait]
impl ShareProvider for LoggingShare {
    async fn share(&self, title: &str, text: &str, url: &str) -> Result<(), AppError> {
        info!(title, url, "share requested");
        self.shared.lock().push(format!("{text} {url}"));
        Ok(())
    }
}
