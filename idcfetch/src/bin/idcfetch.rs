use clap::Parser;

use idcfetch::config::{Args, Config};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    };

    match idcfetch::run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    }
}
