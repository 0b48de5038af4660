//! Environment-driven log initialisation.
//!
//! `LANMESH_LOG` names a file to append log output to; without it,
//! output goes to stderr. `LANMESH_TRACE` set to anything non-zero
//! raises the default level to trace. `RUST_LOG` overrides both.
//! Observability only; nothing here changes behaviour.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

pub fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let trace = std::env::var("LANMESH_TRACE")
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false);
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if trace { "lanmesh=trace" } else { "lanmesh=info" })
        });

        let log_file = std::env::var("LANMESH_LOG").ok().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

        match log_file {
            Some(file) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .try_init();
            }
            None => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .try_init();
            }
        }
    });
}
