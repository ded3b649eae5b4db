use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "GPU_CMD_KIT_LOG";

/// Installs the fmt subscriber once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
