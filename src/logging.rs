//! Tracing subscriber setup shared by the binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogArgs, LogFormat};

/// Filter used when `RUST_LOG` is unset
pub fn default_filter(log_level: &str) -> String {
    format!("chain_mirror={},info", log_level.to_lowercase())
}

/// Install the global subscriber; `RUST_LOG` takes precedence over `LOG_LEVEL`
pub fn init(args: &LogArgs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&args.log_level)));
    let json = args.log_format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter("DEBUG"), "chain_mirror=debug,info");
    }
}
