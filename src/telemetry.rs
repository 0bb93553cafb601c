use std::sync::OnceLock;
use tracing_subscriber::{
    EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once. Logs go to stderr so stdout stays free
/// for APDU responses.
pub fn init_tracing() {
    let _ = INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,hce_core=info"));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .with(env_filter)
            .try_init();
    });
}
