//! Logging for the timechain node: process-wide initialization plus
//! structured progress lines and operation timers.

pub mod performance;
pub mod timechain;

pub use performance::*;
pub use timechain::*;

use log::debug;

/// Initialize the process-wide logger from the environment, defaulting
/// to `info`. Later calls are no-ops.
pub fn init_logger() {
    let env = env_logger::Env::default().default_filter_or("info");
    if env_logger::Builder::from_env(env).try_init().is_err() {
        debug!("logger already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_twice_is_ok() {
        init_logger();
        init_logger();
    }
}
