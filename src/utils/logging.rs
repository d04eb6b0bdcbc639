/// Initialize tracing for a broker process.
///
/// The level comes from `BROKER_LOG` when set, otherwise `default_level`.
pub fn init(default_level: &str) {
    let level = std::env::var("BROKER_LOG").unwrap_or_else(|_| default_level.to_string());
    let lvl = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    // try_init so tests and embedding processes can call this repeatedly
    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::init;

    #[test]
    fn init_accepts_levels() {
        // Should not panic
        init("info");
        init("debug");
        init("warn");
    }
}
