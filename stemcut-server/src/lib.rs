//! stemcut-server library interface
//!
//! Exposes the application state and router for the binary and for
//! integration tests.

pub mod api;
pub mod cleanup;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod reporting;
pub mod tracking;
pub mod worker;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use stemcut_common::config::Settings;
use stemcut_common::events::EventBus;
use tokio::sync::Semaphore;
use tracing::info;

use crate::cleanup::DiskState;
use crate::db::CatalogDb;
use crate::pipeline::{Pipeline, TrackProcessor};
use crate::queue::{JobQueue, SessionRegistry};
use crate::reporting::{ApiReporter, DatabaseReporter, TrackReporter};
use crate::tracking::{DownloadTracker, TrackerLimits};

/// Broadcast capacity of the event bus
const EVENT_CAPACITY: usize = 256;

/// Application state shared across handlers, workers and background services
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    /// Local database (upload history)
    pub db: SqlitePool,
    /// Catalog database, present only when database mode is active
    pub catalog: Option<CatalogDb>,
    /// Why database mode was requested but is not active
    pub catalog_error: Option<String>,
    pub tracker: Arc<DownloadTracker>,
    pub queue: Arc<JobQueue>,
    pub sessions: Arc<SessionRegistry>,
    pub event_bus: EventBus,
    pub reporter: Arc<dyn TrackReporter>,
    pub processor: Arc<dyn TrackProcessor>,
    pub upload_permits: Arc<Semaphore>,
    pub processed_count: Arc<AtomicUsize>,
    pub disk: Arc<DiskState>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Build the state with the production pipeline
    ///
    /// Reports go to the catalog when one is connected, otherwise to the
    /// external API.
    pub fn new(
        settings: Settings,
        db: SqlitePool,
        catalog: Option<CatalogDb>,
        catalog_error: Option<String>,
    ) -> anyhow::Result<Self> {
        let settings = Arc::new(settings);
        let reporter: Arc<dyn TrackReporter> = match &catalog {
            Some(catalog) => Arc::new(DatabaseReporter::new(catalog.clone())),
            None => Arc::new(ApiReporter::new(&settings.api_endpoint, &settings.api_key)?),
        };
        info!(reporter = reporter.name(), "Completion reporter selected");

        let tracker = Arc::new(DownloadTracker::new(TrackerLimits::from(settings.as_ref())));
        let processor: Arc<dyn TrackProcessor> =
            Arc::new(Pipeline::new(settings.clone(), tracker.clone(), reporter.clone()));

        Ok(Self::assemble(settings, db, catalog, catalog_error, tracker, reporter, processor))
    }

    /// Build the state around a caller-supplied processor and reporter
    pub fn with_processor(
        settings: Settings,
        db: SqlitePool,
        tracker: Arc<DownloadTracker>,
        reporter: Arc<dyn TrackReporter>,
        processor: Arc<dyn TrackProcessor>,
    ) -> Self {
        Self::assemble(Arc::new(settings), db, None, None, tracker, reporter, processor)
    }

    fn assemble(
        settings: Arc<Settings>,
        db: SqlitePool,
        catalog: Option<CatalogDb>,
        catalog_error: Option<String>,
        tracker: Arc<DownloadTracker>,
        reporter: Arc<dyn TrackReporter>,
        processor: Arc<dyn TrackProcessor>,
    ) -> Self {
        let event_bus = EventBus::new(EVENT_CAPACITY);
        Self {
            upload_permits: Arc::new(Semaphore::new(settings.max_concurrent_uploads)),
            settings,
            db,
            catalog,
            catalog_error,
            tracker,
            queue: Arc::new(JobQueue::new(event_bus.clone())),
            sessions: Arc::new(SessionRegistry::new(event_bus.clone())),
            event_bus,
            reporter,
            processor,
            processed_count: Arc::new(AtomicUsize::new(0)),
            disk: Arc::new(DiskState::default()),
            startup_time: Utc::now(),
        }
    }

    /// Whether reports are written to the catalog database
    pub fn database_mode_active(&self) -> bool {
        self.catalog.is_some()
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    api::router(state.clone()).with_state(state)
}
