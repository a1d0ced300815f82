//! Tracing subscriber setup for the `tvfpool` binary.
//!
//! Output goes to stderr in both modes: a worker process's stdout carries
//! protocol frames.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Filter directives: `RUST_LOG` if set, otherwise a level from `TVF_LOG`.
fn filter_directives(rust_log: Option<&str>, tvf_log: Option<&str>) -> String {
    if let Some(directives) = rust_log {
        return directives.to_string();
    }
    let level = match tvf_log {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("tvfpool={level}")
}

pub fn init_tracing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let tvf_log = std::env::var("TVF_LOG").ok();
    let filter = EnvFilter::new(filter_directives(rust_log.as_deref(), tvf_log.as_deref()));

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_wins() {
        assert_eq!(
            filter_directives(Some("tvfpool::router=trace"), Some("error")),
            "tvfpool::router=trace"
        );
    }

    #[test]
    fn tvf_log_selects_level() {
        assert_eq!(filter_directives(None, Some("warning")), "tvfpool=warn");
        assert_eq!(filter_directives(None, Some("debug")), "tvfpool=debug");
        assert_eq!(filter_directives(None, Some("loud")), "tvfpool=info");
        assert_eq!(filter_directives(None, None), "tvfpool=info");
    }
}
