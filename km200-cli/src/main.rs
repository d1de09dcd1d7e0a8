use std::error::Error;
use std::time::Duration;

use clap::{Parser, Subcommand};
use km200_lib::{EndpointTree, KM200};

#[derive(Parser)]
#[command(name = "km200", about = "Client for KM200 heating gateways")]
struct Cli {
    /// Base URI of the gateway, e.g. http://192.168.1.10
    #[arg(long)]
    uri: String,

    /// Gateway password from the device's type sign
    #[arg(long)]
    gateway_password: String,

    /// Private password set in EasyControl
    #[arg(long)]
    private_password: String,

    /// Device salt as hex
    #[arg(long)]
    salt: String,

    /// Per-attempt timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Additional attempts after retryable failures, 0 disables retrying
    #[arg(long, default_value_t = 3)]
    retries: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Query a path and print the decrypted JSON
    Query { path: String },

    /// Send a raw JSON payload to a path
    Update { path: String, json: String },

    /// Discover the capability tree and print its leaves
    Explore,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let km200 = KM200::connect_with_retries(
        &cli.uri,
        cli.retries,
        Duration::from_secs(cli.timeout),
        &cli.gateway_password,
        &cli.private_password,
        &cli.salt,
    )
    .await?;

    match cli.command {
        Command::Query { path } => {
            println!("{}", km200.query(&path).await?);
        }
        Command::Update { path, json } => {
            km200.update(&path, &json).await?;
            println!("Updated {path}");
        }
        Command::Explore => {
            let tree = EndpointTree::build(&km200).await?;
            for leaf in tree.leaves() {
                println!("{leaf}");
            }
        }
    }

    Ok(())
}
