//! Tracing subscriber setup for the `deploy-tune` binary.
//!
//! The library only emits events; installing a subscriber is left to the
//! embedding program.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Level used when `RUST_LOG` is unset: 0 = info, 1 = debug, 2+ = trace.
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install a stderr fmt subscriber.
///
/// `RUST_LOG` wins over `verbosity`.  Returns `false` if a global subscriber
/// was already installed.
pub fn init_tracing(verbosity: u8) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("deploy_tune={},warn", level_for(verbosity))));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    Registry::default().with(env_filter).with(fmt_layer).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_verbosity() {
        assert_eq!(level_for(0), Level::INFO);
        assert_eq!(level_for(1), Level::DEBUG);
        assert_eq!(level_for(5), Level::TRACE);
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let _ = init_tracing(0);
        assert!(!init_tracing(2));
    }
}
