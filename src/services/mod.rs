pub mod detector;
pub mod ingest;
pub mod labels;
pub mod messaging;
pub mod notifier;
pub mod queue;
pub mod results;
pub mod retry;
pub mod storage;
