//! Tracing subscriber setup.
//!
//! Logs go to stderr so voice replies on stdout stay clean. `RUST_LOG`
//! overrides the default filter; `RUST_LOG_FORMAT=json` switches to one JSON
//! object per line.

use tracing_subscriber::EnvFilter;

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "voicealarm=debug"
    } else {
        "voicealarm=info"
    }
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let is_json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false);

    if is_json {
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
        init(false);
        init(true);
    }

    #[test]
    fn verbose_raises_default_level() {
        assert_eq!(default_directive(false), "voicealarm=info");
        assert_eq!(default_directive(true), "voicealarm=debug");
        let filter = EnvFilter::new(default_directive(true));
        assert!(format!("{filter:?}").contains("voicealarm"));
    }
}
