use dotenv::dotenv;

use crate::config::Config;
use crate::server::Server;

mod auth;
mod codec;
mod config;
mod connections;
mod files;
mod messages;
mod models;
mod protocol;
mod server;
mod session;
mod storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env();
    let addr = config.bind_addr.clone();
    let server = Server::new(config)?;

    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            eprintln!("Server error: {}", e);
        }
    });
    println!("Server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    println!("Shutting down server...");
    Ok(())
}
