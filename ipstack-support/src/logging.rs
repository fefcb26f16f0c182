//! Structured logging, initialised once at startup from the environment.
//!
//! Replaces the kernel's `klog` backend-registration model (a single global
//! level filter dispatching through a function pointer) with the ecosystem
//! equivalent for a hosted process: the `log` facade plus an `env_logger`
//! builder configured from `IPSTACK_LOG` rather than the conventional
//! `RUST_LOG`, so a stack embedded in a larger program doesn't inherit an
//! unrelated `RUST_LOG` setting.

use std::env;
use std::io::Write;

use env_logger::Builder;
use log::LevelFilter;

const ENV_LEVEL: &str = "IPSTACK_LOG";
const ENV_NO_COLOR: &str = "IPSTACK_LOG_NO_COLOR";

/// Parse `IPSTACK_LOG`, defaulting to `info`. Accepts the same names as
/// `log::Level` plus `fatal`, which maps to `error` (the stack has no
/// level below error; "fatal" conditions are error-level events that also
/// force a state transition).
fn level_from_env() -> LevelFilter {
    match env::var(ENV_LEVEL).ok().as_deref().map(str::to_lowercase).as_deref() {
        Some("trace") => LevelFilter::Trace,
        Some("debug") => LevelFilter::Debug,
        Some("info") => LevelFilter::Info,
        Some("warn") | Some("warning") => LevelFilter::Warn,
        Some("error") | Some("fatal") => LevelFilter::Error,
        Some("off") => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Install the global logger. Safe to call more than once — later calls are
/// no-ops, matching `env_logger::try_init`'s behavior.
pub fn init() {
    let mut builder = Builder::new();
    builder.filter_level(level_from_env());
    if env::var(ENV_NO_COLOR).is_ok() {
        builder.write_style(env_logger::WriteStyle::Never);
    }
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{} {}] {}",
            record.level(),
            record.target(),
            record.args()
        )
    });
    let _ = builder.try_init();
}
