//! Command implementations for rollsync.
//!
//! Each command returns the text to print; `sync daemon` streams events
//! while it runs and returns a closing line.

mod cache;
mod completions;
mod queue;
mod sync;

pub use cache::cache;
pub use completions::completions;
pub use queue::queue;
pub use sync::sync;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::cli::args::OutputFormat;
use crate::config::{ColorSetting, Config, Paths};
use crate::error::RollsyncError;
use crate::events::EventBus;
use crate::service::OfflineSync;
use crate::transport::{Disconnected, HttpTransport, NetworkMonitor, Transport};

/// Resolved paths, configuration, and output format for one invocation.
pub struct Context {
    pub paths: Paths,
    pub config: Config,
    pub format: OutputFormat,
}

impl Context {
    /// Resolve the data directory and load configuration. Without an explicit
    /// `format` the configured default is used.
    ///
    /// # Errors
    ///
    /// Returns an error if no data directory can be determined or the config
    /// file is invalid.
    pub fn load(
        data_dir: Option<PathBuf>,
        config_file: Option<PathBuf>,
        format: Option<OutputFormat>,
    ) -> Result<Self, RollsyncError> {
        let paths = match data_dir {
            Some(root) => Paths::with_root(root),
            None => Paths::new()?,
        };
        let config_path = config_file.unwrap_or_else(|| paths.config_file.clone());
        let config = Config::load_from_path(&config_path)?;

        match config.general.color {
            ColorSetting::Always => colored::control::set_override(true),
            ColorSetting::Never => colored::control::set_override(false),
            ColorSetting::Auto => {}
        }
        let format = format.unwrap_or(config.general.default_output);

        Ok(Self {
            paths,
            config,
            format,
        })
    }

    /// Open the service. Without a configured server every upload and
    /// download reports offline, so local inspection still works.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the server
    /// settings are invalid.
    pub fn service(&self) -> Result<OfflineSync, RollsyncError> {
        let events = EventBus::new();
        let network = NetworkMonitor::new(false).with_events(events.clone());

        let transport: Arc<dyn Transport> = if self.config.server.base_url.is_some() {
            Arc::new(HttpTransport::from_config(
                &self.config.server,
                network.clone(),
            )?)
        } else {
            warn!("server.base_url is not set, working offline");
            Arc::new(Disconnected)
        };

        OfflineSync::open(self.config.clone(), &self.paths, transport, network, events)
    }
}
