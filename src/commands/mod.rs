//! Web command handlers
//!
//! Plain async functions over a shared `AppState`, consumed by the HTTP
//! layer. Every handler returns `ErrorResponse` on failure so the caller
//! can map it straight onto a status code.

pub mod device;
pub mod session;

use crate::bus::SampleBus;
use crate::config::Config;
use crate::device::{DeviceCapability, DeviceLink, LinkSettings};
use crate::live::LiveViewFeed;
use crate::session::SessionManager;
use std::sync::Arc;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub link: DeviceLink,
    pub sessions: SessionManager,
    pub live: LiveViewFeed,
}

impl AppState {
    /// Wire the pipeline around a device capability
    pub fn new(capability: Arc<dyn DeviceCapability>, config: Config) -> Self {
        let link = DeviceLink::new(capability, SampleBus::new(), LinkSettings::from(&config));
        let sessions = SessionManager::new(link.clone(), &config);
        let live = LiveViewFeed::new(link.clone(), sessions.clone(), &config);
        Self {
            config,
            link,
            sessions,
            live,
        }
    }
}
