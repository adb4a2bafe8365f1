//! Tracing setup shared by every boxlet process.
//!
//! `RUST_LOG` wins when set; otherwise `BOXLET_LOG` picks the level
//! (`debug`, `info`, `warn`, `error`) for boxlet itself and for the
//! application binary's crate. Everything else stays at `warn`.
//! `LOG_FORMAT=json` switches to JSON lines. Output goes to stderr so a
//! child's stdout stays free.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level directive derived from `BOXLET_LOG`.
fn base_level(boxlet_log: Option<&str>) -> &'static str {
    match boxlet_log {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_from<F>(lookup: F, app_target: Option<&str>) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(directives) = lookup("RUST_LOG") {
        return EnvFilter::new(directives);
    }
    let level = base_level(lookup("BOXLET_LOG").as_deref());
    let mut directives = format!("warn,boxlet={level}");
    if let Some(target) = app_target.filter(|t| *t != "boxlet") {
        directives.push_str(&format!(",{target}={level}"));
    }
    EnvFilter::new(directives)
}

/// Tracing target of the running binary's crate, `my-app` → `my_app`.
fn app_target() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    let stem = exe.file_stem()?.to_str()?;
    Some(stem.replace('-', "_"))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let lookup = |name: &str| std::env::var(name).ok();
    let filter = filter_from(lookup, app_target().as_deref());
    let use_json = lookup("LOG_FORMAT").as_deref() == Some("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}
