use clap::Parser;

use rb_deployer::{
    apply,
    config::{CliArgs, RbDeployerConfig},
};

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    match RbDeployerConfig::from_env_and_args(cli) {
        Ok(config) => {
            if let Err(err) = apply::run(config).await {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}
