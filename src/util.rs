//! Logging setup and small shared helpers.

/// Initializes the process-wide logger at the given level, matching every
/// `oligoalign-*` binary's `-v` flag handling.
pub fn init_logging(level: log::LogLevelFilter) {
    let mut builder = env_logger::LogBuilder::new();
    builder.filter(None, level);
    if std::env::var("RUST_LOG").is_ok() {
        builder.parse(&std::env::var("RUST_LOG").unwrap());
    }
    let _ = builder.init();
}
