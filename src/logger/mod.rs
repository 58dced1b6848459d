// SPDX-License-Identifier: GPL-3.0-only

use anyhow::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn default_filter() -> EnvFilter {
    let crate_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };
    EnvFilter::new(format!("warn,mirror_comp={crate_level},mirror_comp_config={crate_level}"))
}

pub fn init_logger() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());
    let fmt_layer = fmt::layer().compact().with_writer(std::io::stderr);

    let (journald, journald_err) = match tracing_journald::layer() {
        Ok(layer) => (Some(layer), None),
        Err(err) => (None, Some(err)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(journald)
        .try_init()?;
    log_panics::init();

    if let Some(err) = journald_err {
        debug!(?err, "Journald not available, logging to stderr only");
    }
    info!("Version: {}", std::env!("CARGO_PKG_VERSION"));
    if cfg!(debug_assertions) {
        debug!(
            "Debug build ({})",
            std::option_env!("GIT_HASH").unwrap_or("Unknown")
        );
    }
    if std::env::var_os("RUST_LOG").is_some() && EnvFilter::try_from_default_env().is_err() {
        warn!("RUST_LOG could not be parsed, using default filter");
    }

    Ok(())
}
