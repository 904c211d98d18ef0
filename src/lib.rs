pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod executor;
pub mod filter;
pub mod hook;
pub mod logging;
pub mod render;
pub mod template;

use std::sync::Arc;

use dispatch::Dispatcher;

pub use config::RunnerConfig;
pub use dispatch::{DispatchOutcome, execute};
pub use error::{Result, RunnerError};
pub use event::Event;
pub use hook::{Hook, HookConfig};

pub struct AppState {
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            dispatcher: Dispatcher::new(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedState = Arc<AppState>;
