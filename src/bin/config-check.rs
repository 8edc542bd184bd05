use {chat_relay::config::Config, std::process::exit};

fn main() {
    let config = Config::parse_env();
    match config.validate() {
        Ok(()) => {
            println!("listen:        {}", config.bind_addr());
            println!("cors origin:   {}", config.cors_origin);
            println!(
                "store:         {}",
                if config.uses_memory_store() {
                    "in-process"
                } else {
                    "redis"
                }
            );
            println!("grace period:  {:?}", config.shutdown_grace());
            println!("store retries: {:?}", config.retry_policy());
            println!("log level:     {}", config.log_level);
            println!("Config is OK!");
        }
        Err(error) => {
            eprintln!("Invalid configuration: {error:#}");
            exit(1);
        }
    }
}
