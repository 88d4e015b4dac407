use env_logger::{Builder, Target};
use log::LevelFilter;
use std::io::Write;

use crate::utils::{Result, SyncError};

/// Installs the global logger. Every line carries the node name so several
/// local nodes can share one terminal. `RUST_LOG` overrides the `info` default.
pub fn setup_logging(node_name: &str) -> Result<()> {
    let node = node_name.to_string();

    Builder::new()
        .target(Target::Stdout)
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format(move |buf, record| {
            writeln!(
                buf,
                "{} {:<5} {} [{}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                node,
                record.target().trim_start_matches("mini_sync::"),
                record.args()
            )
        })
        .try_init()
        .map_err(|e| SyncError::ConfigError(format!("Logger already installed: {}", e)))
}
