use log::LevelFilter;

pub fn log_format(title: &str, content: &str) -> String {
    format!(
        "\n*** *** *** [{}] *** *** ***\n{}\n*** *** *** [{}] *** *** ***\n\n",
        title, content, title
    )
}

/// For process-fatal points in the binaries: a failure here means the engine can never run.
pub trait StartupExpectation<T> {
    fn startup_expect(self, msg: &str) -> T;
}

impl<T, E> StartupExpectation<T> for Result<T, E>
where
    E: std::fmt::Debug,
{
    fn startup_expect(self, msg: &str) -> T {
        self.expect(&log_format("ENGINE STARTUP EXPECTATION", msg))
    }
}

impl<T> StartupExpectation<T> for Option<T> {
    fn startup_expect(self, msg: &str) -> T {
        self.expect(&log_format("ENGINE STARTUP EXPECTATION", msg))
    }
}

/// Resolve the configured level name, falling back to trace in debug builds and info otherwise.
pub fn level_filter(level: Option<&str>) -> LevelFilter {
    if let Some(filter) = level.and_then(|name| name.trim().parse::<LevelFilter>().ok()) {
        return filter;
    }

    #[cfg(debug_assertions)] // Enable verbose logging in debug builds
    let default_level = LevelFilter::Trace;
    #[cfg(not(debug_assertions))]
    let default_level = LevelFilter::Info;
    default_level
}

#[cfg(not(target_os = "android"))]
pub fn init_host_logging(level: LevelFilter) {
    // `RUST_LOG` still wins over the configured level
    let _ = env_logger::Builder::default()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}
