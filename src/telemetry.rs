use tracing_subscriber::EnvFilter;

/// Structured JSON logging, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Register descriptions for every metric the server and worker emit.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "detection_jobs_submitted_total",
        "Total detection jobs published to the queue"
    );
    metrics::describe_counter!(
        "detection_jobs_completed_total",
        "Total detection jobs persisted and committed"
    );
    metrics::describe_counter!(
        "detection_jobs_failed_total",
        "Total detection job failures, by failure kind"
    );
    metrics::describe_counter!(
        "detection_jobs_dead_lettered_total",
        "Total detection jobs moved to the dead-letter list"
    );
    metrics::describe_histogram!(
        "detection_processing_seconds",
        "Time from receiving a job to committing it"
    );
    metrics::describe_histogram!(
        "detection_engine_seconds",
        "Time spent in the detection engine per job"
    );
    metrics::describe_gauge!(
        "detection_queue_depth",
        "Current number of visible jobs in the queue"
    );
}
