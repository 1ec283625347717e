use std::path::PathBuf;
use std::sync::Arc;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;
use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// The index is a library and never prints. Callers plug in a listener that forwards these
/// events wherever they want; [`TracingEventListener`] sends them to `tracing`.
pub trait IndexEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: IndexEvent);
}

/// Structured events emitted by the index.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    /// A comparison with a nested binary operand was answered with every series of the
    /// measurement instead of being evaluated.
    NestedComparisonFallback { measurement: String, expr: String },

    SeriesCreated { measurement: String, count: u64 },
    TsidsDeleted { measurement: String, count: u64 },
    MeasurementVersionAdvanced { measurement: String, version: u16 },

    SnapshotWritten { path: PathBuf, items: u64 },
    SnapshotLoaded { path: PathBuf, items: u64 },
    SnapshotFailed { error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl IndexEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: IndexEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn IndexEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing` with structured fields.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl IndexEventListener for TracingEventListener {
    fn on_event(&self, event: IndexEvent) {
        match event {
            IndexEvent::NestedComparisonFallback { measurement, expr } => {
                tracing::info!(%measurement, %expr, "nested comparison resolved to all series")
            }
            IndexEvent::SeriesCreated { measurement, count } => {
                tracing::debug!(%measurement, count, "series created")
            }
            IndexEvent::TsidsDeleted { measurement, count } => {
                tracing::info!(%measurement, count, "tsids deleted")
            }
            IndexEvent::MeasurementVersionAdvanced {
                measurement,
                version,
            } => tracing::info!(%measurement, version, "measurement version advanced"),
            IndexEvent::SnapshotWritten { path, items } => {
                tracing::info!(path = %path.display(), items, "index snapshot written")
            }
            IndexEvent::SnapshotLoaded { path, items } => {
                tracing::info!(path = %path.display(), items, "index snapshot loaded")
            }
            IndexEvent::SnapshotFailed { error } => {
                tracing::error!(%error, "index snapshot failed")
            }
        }
    }
}

pub fn tracing_event_listener() -> Arc<dyn IndexEventListener> {
    Arc::new(TracingEventListener)
}

/// Metrics for the search and write paths.
///
/// Recording goes through the `metrics` facade and costs nothing until a recorder is
/// installed. With the `prometheus` feature, [`index_metrics::InProcessPrometheus`] installs
/// one and renders the exposition text in-process.
pub mod index_metrics {
    use super::*;

    #[cfg(feature = "prometheus")]
    use ::metrics::{describe_counter, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // --- metric names ---
    //
    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const FAST_PATH_SCANS: &str = "ugnos_tsi_fast_path_scans";
    pub const SLOW_PATH_SCANS: &str = "ugnos_tsi_slow_path_scans";
    pub const ROWS_SCANNED: &str = "ugnos_tsi_rows_scanned";
    pub const SKIP_AHEAD_SEEKS: &str = "ugnos_tsi_skip_ahead_seeks";
    pub const SERIES_CREATED: &str = "ugnos_tsi_series_created";
    pub const TSIDS_DELETED: &str = "ugnos_tsi_tsids_deleted";
    pub const QUERY_DURATION_SECONDS: &str = "ugnos_tsi_query_duration_seconds";

    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs the global recorder (once per process) and an upkeep thread calling
        /// `run_upkeep()` every `upkeep_interval`.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("ugnos-tsi-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_fast_path_scan(suffixes: u64) {
        ::metrics::counter!(FAST_PATH_SCANS).increment(suffixes);
    }

    #[inline]
    pub fn record_slow_path_scan(rows: u64, skips: u64) {
        ::metrics::counter!(SLOW_PATH_SCANS).increment(1);
        if rows > 0 {
            ::metrics::counter!(ROWS_SCANNED).increment(rows);
        }
        if skips > 0 {
            ::metrics::counter!(SKIP_AHEAD_SEEKS).increment(skips);
        }
    }

    #[inline]
    pub fn record_series_created(count: u64) {
        if count > 0 {
            ::metrics::counter!(SERIES_CREATED).increment(count);
        }
    }

    #[inline]
    pub fn record_tsids_deleted(count: u64) {
        if count > 0 {
            ::metrics::counter!(TSIDS_DELETED).increment(count);
        }
    }

    #[inline]
    pub fn record_query(duration: Duration) {
        ::metrics::histogram!(QUERY_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[cfg(feature = "prometheus")]
    fn describe_all() {
        describe_counter!(
            FAST_PATH_SCANS,
            Unit::Count,
            "Point scans issued for literal tag filter values."
        );
        describe_counter!(
            SLOW_PATH_SCANS,
            Unit::Count,
            "Tag filters answered by scanning every value of the tag key."
        );
        describe_counter!(
            ROWS_SCANNED,
            Unit::Count,
            "tag->tsids rows visited by slow-path scans."
        );
        describe_counter!(
            SKIP_AHEAD_SEEKS,
            Unit::Count,
            "Re-seeks that jumped over the remaining rows of a non-matching value."
        );
        describe_counter!(SERIES_CREATED, Unit::Count, "Series added to the index.");
        describe_counter!(TSIDS_DELETED, Unit::Count, "TSIDs added to the tombstone set.");
        describe_histogram!(
            QUERY_DURATION_SECONDS,
            Unit::Seconds,
            "Time to resolve a predicate into series ids."
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Capture(Mutex<Vec<IndexEvent>>);

    impl IndexEventListener for Capture {
        fn on_event(&self, event: IndexEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn listeners_receive_events() {
        let c = Capture::default();
        c.on_event(IndexEvent::SeriesCreated {
            measurement: "cpu".into(),
            count: 2,
        });
        assert_eq!(c.0.lock().unwrap().len(), 1);

        // Must not panic without a subscriber or recorder.
        TracingEventListener.on_event(IndexEvent::SnapshotFailed {
            error: "boom".into(),
        });
        index_metrics::record_slow_path_scan(10, 1);
        index_metrics::record_query(Duration::from_millis(1));
    }
}
