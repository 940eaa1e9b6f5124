use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use fpc_storage::{Clock, Storage};

use crate::{BacklogError, TimeMarks};

const HEALTH_FILE: &str = "service-health";
const SERVICE_STATUS_MARK: &str = "service-status";

/// Seconds transport failures may keep occurring before the service is
/// considered sick.
pub const ISSUE_WINDOW: u64 = 60;

/// Remote service health as seen by this installation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// Requests came back with server errors.
    UnderTheWeather,
    /// Remote calls are refused until a health check succeeds.
    Sick,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::UnderTheWeather => "UNDER_THE_WEATHER",
            Self::Sick => "SICK",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "HEALTHY" => Ok(Self::Healthy),
            "UNDER_THE_WEATHER" => Ok(Self::UnderTheWeather),
            "SICK" => Ok(Self::Sick),
            other => Err(format!("unknown health status: {other}")),
        }
    }
}

/// Tracks [`HealthStatus`] and persists every change to `service-health`.
pub struct HealthMonitor {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    marks: TimeMarks,
    path: PathBuf,
    status: RwLock<HealthStatus>,
}

impl HealthMonitor {
    /// Monitor starting healthy, without reading the stored status.
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            marks: TimeMarks::new(Arc::clone(&storage)),
            storage,
            clock,
            path: PathBuf::from(HEALTH_FILE),
            status: RwLock::new(HealthStatus::Healthy),
        }
    }

    /// Monitor starting from the stored status. A missing or unreadable file
    /// means healthy.
    pub fn load(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        let monitor = Self::new(storage, clock);
        let stored = monitor
            .storage
            .read(&monitor.path)
            .ok()
            .and_then(|raw| String::from_utf8_lossy(&raw).parse().ok());
        if let Some(status) = stored {
            *monitor.status.write().unwrap_or_else(PoisonError::into_inner) = status;
        }
        monitor
    }

    #[must_use]
    pub fn status(&self) -> HealthStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// Change the status and persist it.
    pub fn set(&self, status: HealthStatus) -> Result<(), BacklogError> {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
        self.storage.write(&self.path, status.as_str().as_bytes())?;
        tracing::info!(%status, "Service health changed");
        Ok(())
    }

    /// A request got a response below 500.
    pub fn record_success(&self) -> Result<(), BacklogError> {
        self.marks.unset(SERVICE_STATUS_MARK)
    }

    /// Every attempt of a request got a 5xx response.
    pub fn record_server_errors(&self) -> Result<(), BacklogError> {
        self.set(HealthStatus::UnderTheWeather)
    }

    /// Every attempt of a request failed in transport.
    ///
    /// With the backlog buffering the request the service is sick right away.
    /// Otherwise the first failure is remembered and the service becomes sick
    /// once failures persist past [`ISSUE_WINDOW`].
    pub fn record_failure(&self, backlog_active: bool) -> Result<HealthStatus, BacklogError> {
        if backlog_active {
            self.set(HealthStatus::Sick)?;
            return Ok(HealthStatus::Sick);
        }

        let now = self.clock.now();
        match self.marks.get(SERVICE_STATUS_MARK) {
            None => self.marks.set(SERVICE_STATUS_MARK, now)?,
            Some(first) if now.saturating_sub(first) > ISSUE_WINDOW => {
                self.set(HealthStatus::Sick)?;
            }
            Some(_) => {}
        }
        Ok(self.status())
    }

    /// Run `probe` against the service and set healthy or sick by its result.
    pub fn check(&self, probe: impl FnOnce() -> bool) -> Result<HealthStatus, BacklogError> {
        let status = if probe() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Sick
        };
        self.set(status)?;
        Ok(status)
    }
}
