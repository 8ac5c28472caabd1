use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "rubricd=warn";

/// Logs go to stderr; stdout carries the JSON protocol.
///
/// `RUBRICD_LOG` takes an `EnvFilter` directive (a bare level such as `debug`
/// applies to this crate); `RUBRICD_LOG_JSON=1` switches to JSON lines.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let directive = std::env::var("RUBRICD_LOG").ok();
    let log_json = std::env::var("RUBRICD_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    init_with(directive.as_deref(), log_json)
}

fn filter_for(directive: Option<&str>) -> EnvFilter {
    match directive.map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) if d.contains('=') || d.contains(',') => EnvFilter::new(d),
        Some(level) => EnvFilter::new(format!("rubricd={}", level)),
        None => EnvFilter::new(DEFAULT_FILTER),
    }
}

fn init_with(directive: Option<&str>, log_json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let registry = tracing_subscriber::registry().with(filter_for(directive));

    if log_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    }

    Ok(())
}
