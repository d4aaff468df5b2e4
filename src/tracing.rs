use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Filter used by `locsync` when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "location_sync=debug,locsync=debug,sqlx=warn,info"
    } else {
        "location_sync=info,locsync=info,sqlx=warn,warn"
    }
}

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_crate_level() {
        assert!(default_filter(true).starts_with("location_sync=debug"));
        assert!(default_filter(false).starts_with("location_sync=info"));
        for f in [default_filter(true), default_filter(false)] {
            assert!(EnvFilter::try_new(f).is_ok(), "{f}");
        }
    }
}
