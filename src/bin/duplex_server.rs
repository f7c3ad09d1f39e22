use std::{error::Error, net::SocketAddr, process};

use clap::Parser;
use duplex::{
    Router, Server,
    services::{CalculatorService, GreetService},
};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(long, default_value = "0.0.0.0:50051")]
    address: SocketAddr,
    /// Number of handler threads kept warm; busier periods get extra threads
    #[arg(long, default_value_t = 15)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    ctrlc::set_handler(|| {
        info!("interrupted, shutting down");
        process::exit(0);
    })?;

    let router = Router::new()
        .add_service(GreetService::new())
        .add_service(CalculatorService);
    let server = Server::new(router, cli.workers)?;

    server.listen(cli.address)?;
    Ok(())
}
