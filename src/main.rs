use {
    chat_relay::{config::Config, context::InstanceContext, init_logging, server},
    log::error,
    std::process::exit,
};

fn main() -> anyhow::Result<()> {
    let config = Config::parse_env();
    init_logging(&config.log_level);

    if let Err(error) = config.validate() {
        error!("Invalid configuration: {error:#}");
        exit(1);
    }

    let ctx = match InstanceContext::connect(config) {
        Ok(ctx) => ctx,
        Err(error) => {
            error!("Failed to create store client: {error:#}");
            exit(1);
        }
    };

    // One cooperative event loop per instance.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if let Err(error) = rt.block_on(server::run(ctx)) {
        error!("{error:#}");
        exit(1);
    }
    Ok(())
}
