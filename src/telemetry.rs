//! Tracing setup for the service binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str =
    "msgrelay=info,gateway=info,producer=info,consumer=info,tower_http=debug";

/// Install the global subscriber.
///
/// `RUST_LOG` selects levels; `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let (plain_layer, json_layer) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain_layer)
        .with(json_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_covers_binaries() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());

        let directives: Vec<&str> = DEFAULT_LOG_FILTER.split(',').collect();
        for target in ["msgrelay", "gateway", "producer", "consumer"] {
            assert!(
                directives.contains(&format!("{target}=info").as_str()),
                "{target} missing from default filter"
            );
        }
    }
}
