//! Log output setup.
//!
//! An ICD is loaded into arbitrary host processes, so the driver never
//! installs a logger behind the client's back: the shim calls [`init`]
//! once at load time, tests call [`init_test`]. Filtering is driven by
//! the `CLMETAL_LOG` environment variable (`error` … `trace`, plus
//! per-module filters like `clmetal::queue=debug`); the default is
//! `warn`.
//!
//! Level conventions in this crate: `error!` for failures surfaced to
//! the client as status codes, `warn!` for tolerated suspicious input,
//! `info!` for build and submission milestones, `debug!` for
//! per-command encoding detail, `trace!` for reflection internals.

use std::sync::Once;

const FILTER_VAR: &str = "CLMETAL_LOG";

static INSTALL: Once = Once::new();

/// Install the process logger. Safe to call any number of times, and a
/// host process that already owns the global logger keeps it.
pub fn init() {
    INSTALL.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::new().filter_or(FILTER_VAR, "warn"))
            .format_timestamp(None)
            .try_init();
    });
}

/// Logger for tests: capture-friendly output, quiet unless
/// `CLMETAL_LOG` says otherwise. Repeated calls are no-ops.
pub fn init_test() {
    let _ = env_logger::Builder::from_env(env_logger::Env::new().filter_or(FILTER_VAR, "error"))
        .is_test(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        init_test();
        init_test();
        init();
    }
}
