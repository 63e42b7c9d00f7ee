//! Log initialization for the `pgvc` binary.
//!
//! `RUST_LOG` wins when set; otherwise the level is `warn`, or `debug` for
//! `-v`. Output goes to stderr so command output on stdout stays clean.
//! Library users install their own subscriber.

use tracing_subscriber::EnvFilter;

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "pgvc=debug"
    } else {
        "warn"
    }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(verbose: bool) {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
    if result.is_err() {
        tracing::debug!("subscriber already installed");
    }
}
