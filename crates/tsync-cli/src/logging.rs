use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "tsync=info";

/// Install the stderr subscriber. `RUST_LOG` overrides the filter and
/// `RUST_LOG_FORMAT=json` switches to JSON lines. Repeated calls are no-ops.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    if json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init();
        init();
    }

    #[test]
    fn default_filter_parses() {
        let filter = EnvFilter::new(DEFAULT_FILTER);
        assert!(format!("{filter:?}").contains("tsync"));
    }
}
