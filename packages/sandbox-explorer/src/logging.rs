use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs logfmt output on stderr, filtered by `RUST_LOG` (default `info`).
///
/// Panics if a global subscriber is already installed; hosts that may have set one
/// up themselves should call [`try_init_logging`].
pub fn init_logging() {
    subscriber().init();
}

pub fn try_init_logging() -> bool {
    subscriber().try_init().is_ok()
}

fn subscriber() -> impl SubscriberInitExt {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(
        tracing_logfmt::builder()
            .layer()
            .with_writer(std::io::stderr),
    )
}
