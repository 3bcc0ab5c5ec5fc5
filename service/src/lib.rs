use auth::IdentityVerifier;
use config::Config;
use hub::Hub;
use std::sync::Arc;

pub mod config;
pub mod logging;

// Service-level state shared by every request handler
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub hub: Hub,
    pub verifier: Arc<dyn IdentityVerifier>,
}

impl AppState {
    pub fn new(app_config: Config, hub: Hub, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            config: app_config,
            hub,
            verifier,
        }
    }
}
