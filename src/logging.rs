use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive string.
pub const LOG_ENV: &str = "RENDERQ_LOG";

/// Default directive for a number of `-v` flags.
pub fn directive_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug,renderq::render_output=info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the global fmt subscriber writing to stderr. `RENDERQ_LOG` wins
/// over the verbosity flags when set.
pub fn init(verbosity: u8) -> Result<()> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives.trim())
            .map_err(|error| anyhow!("invalid {LOG_ENV} directives: {error}"))?,
        _ => EnvFilter::new(directive_for_verbosity(verbosity)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbosity > 0)
        .try_init()
        .map_err(|error| anyhow!("failed to install logger: {error}"))
}
