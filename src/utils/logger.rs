use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use anyhow::Result;

pub fn setup_logging(default_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .with(env_filter)
        .init();

    Ok(())
}
