use std::sync::Arc;

use crate::services::{
    ingest::IngestionGateway, messaging::Messenger, notifier::ResultNotifier, queue::JobQueue,
    results::ResultStore,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<IngestionGateway>,
    pub notifier: Arc<ResultNotifier>,
    pub results: Arc<dyn ResultStore>,
    pub queue: Arc<dyn JobQueue>,
    pub messenger: Arc<dyn Messenger>,
    /// Secret path segment of the webhook route; `None` disables the webhook.
    pub telegram_token: Option<String>,
}

impl AppState {
    pub fn new(
        gateway: IngestionGateway,
        results: Arc<dyn ResultStore>,
        queue: Arc<dyn JobQueue>,
        messenger: Arc<dyn Messenger>,
        telegram_token: Option<String>,
    ) -> Self {
        let notifier = ResultNotifier::new(Arc::clone(&results), Arc::clone(&messenger));
        Self {
            gateway: Arc::new(gateway),
            notifier: Arc::new(notifier),
            results,
            queue,
            messenger,
            telegram_token,
        }
    }
}
