pub use slog::{debug, error, info, o, trace, warn, Logger};

/// Builds a terminal logger writing to stderr at the given level. Broker binaries call this once
/// at startup, before touching any other subsystem, and thread the returned `Logger` down into
/// the worker rather than relying on a process-wide global.
pub fn init(level: &str) -> Logger {
    use sloggers::{Config, LoggerConfig};

    let toml = format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    );

    let config: LoggerConfig = serdeconv::from_toml_str(&toml).expect("invalid logging level");

    config.build_logger().expect("failed to build logger")
}

/// A logger that discards everything. Used in tests and anywhere a `Logger` is required but
/// output would just be noise.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
