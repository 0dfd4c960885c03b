/// Tag the library logs under (logcat tag on Android)
pub const LOG_TAG: &str = "BackgroundGeolocation";

/// Install the process logger. Safe to call more than once; later calls are no-ops.
pub fn init() {
    #[cfg(target_os = "android")]
    {
        let _ = android_log::init(LOG_TAG);
    }

    #[cfg(not(target_os = "android"))]
    {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init();
        init();
        log::info!(target: LOG_TAG, "logger installed");
    }
}
