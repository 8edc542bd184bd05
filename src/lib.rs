pub mod broadcaster;
pub mod channel;
pub mod config;
pub mod context;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod store;

/// Installs the `env_logger` backend. `RUST_LOG` overrides `default_level`.
pub fn init_logging(default_level: &str) {
    let env = env_logger::Env::default().default_filter_or(default_level);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
