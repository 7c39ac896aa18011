use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install the fmt subscriber. `RUST_LOG` wins over the configured filter; an
/// unparsable filter falls back to `info`. Returns false when a subscriber was
/// already installed by the host.
pub fn init_tracing(filter: &str) -> bool {
    let (env_filter, rejected) = match EnvFilter::try_from_default_env() {
        Ok(from_env) => (from_env, None),
        Err(_) => match EnvFilter::try_new(filter) {
            Ok(configured) => (configured, None),
            Err(err) => (EnvFilter::new("info"), Some(err.to_string())),
        },
    };
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let installed = Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();
    if let Some(reason) = rejected {
        warn!(filter, %reason, "invalid log filter; using info");
    }
    debug!(installed, "tracing initialised");
    installed
}
