use std::sync::Arc;

use parley_call::CallRegistry;
use parley_config::Settings;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CallRegistry>,
    pub settings: Arc<Settings>,
}
