use std::env;

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "SOFTCASCADE_LOG";
pub const LOG_FORMAT_ENV: &str = "SOFTCASCADE_LOG_FORMAT";
const DEFAULT_FILTER: &str = "softcascade=info,sqlx=warn";

fn filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    env::var(LOG_ENV)
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber on stderr. Safe to call more than once;
/// later calls are no-ops.
pub fn init() {
    let json = env::var(LOG_FORMAT_ENV)
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(true)
        .with_writer(std::io::stderr);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
