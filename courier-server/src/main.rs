use clap::{Parser, Subcommand};
use courier_sync::identity::TokenVerifier;
use courier_sync::server::{ChatServer, ServerConfig};
use courier_sync::storage::{ChatStore, StoreConfig};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "courier-server", version, about = "Real-time one-to-one chat server")]
struct Cli {
    /// WebSocket listen address
    #[arg(long, env = "COURIER_WS_ADDR", default_value = "127.0.0.1:9090")]
    ws_addr: String,

    /// HTTP fallback listen address
    #[arg(long, env = "COURIER_HTTP_ADDR", default_value = "127.0.0.1:9091")]
    http_addr: String,

    /// RocksDB data directory
    #[arg(long, env = "COURIER_DATA_DIR", default_value = "courier_data", value_name = "DIR")]
    data_dir: PathBuf,

    /// Secret used to sign and verify bearer tokens
    #[arg(long, env = "COURIER_TOKEN_SECRET", hide_env_values = true)]
    token_secret: String,

    /// Per-scope broadcast buffer
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Create a user and print its id with a fresh token
    SeedUser {
        display_name: String,
    },
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ServerConfig {
        ws_addr: cli.ws_addr,
        http_addr: cli.http_addr,
        broadcast_capacity: cli.broadcast_capacity,
        storage_path: cli.data_dir,
        token_secret: cli.token_secret,
        ..ServerConfig::default()
    };

    let result = match cli.command {
        Some(Command::SeedUser { display_name }) => seed_user(&config, &display_name),
        None => serve(config).await,
    };
    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let server = ChatServer::open(config)?;
    server.run().await
}

fn seed_user(config: &ServerConfig, display_name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let store = Arc::new(ChatStore::open(StoreConfig {
        path: config.storage_path.clone(),
        ..StoreConfig::default()
    })?);
    let user = store.create_user(display_name)?;
    let token = TokenVerifier::new(&config.token_secret, store).issue(user.id);

    println!("id:    {}", user.id);
    println!("token: {token}");
    Ok(())
}
