use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use stonewire::{
    setup_local_tracing, setup_tracing, AppResult, Connection, Server, ServerEvent,
    StoneWireConfig,
};
use tokio::{runtime, signal};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for rolling log files, console only when absent
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// run an echo server until ctrl-c
    Serve,
    /// send one message and print the first reply
    Send {
        #[arg(short, long)]
        message: String,
        /// seconds to wait for the reply
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },
    PrintConfig,
}

fn level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn load_config(conf: Option<&String>) -> AppResult<StoneWireConfig> {
    let config_path = conf.map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    if conf.is_none() && !config_path.exists() {
        return Ok(StoneWireConfig::default());
    }
    StoneWireConfig::set_up_config(config_path)
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", level(commandline.verbose));
    }
    let _worker_guard = match &commandline.log_dir {
        Some(dir) => Some(setup_tracing(dir, level(commandline.verbose))?),
        None => {
            setup_local_tracing()?;
            None
        }
    };

    let config = load_config(commandline.conf.as_ref())?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    match commandline.command {
        Command::Serve => rt.block_on(serve(config)),
        Command::Send { message, wait } => rt.block_on(send(config, message, wait)),
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

async fn serve(config: StoneWireConfig) -> AppResult<()> {
    let server = Server::new(config.network);
    let events = server.subscribe();
    server.start().await?;

    tokio::select! {
        _ = echo_clients(events) => {}
        _ = signal::ctrl_c() => {
            info!("get shutdown signal");
        }
    }
    server.stop();
    while server.is_running() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

async fn echo_clients(events: async_channel::Receiver<ServerEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            ServerEvent::ClientConnected(connection) => {
                tokio::spawn(echo(connection));
            }
            ServerEvent::Stopped => break,
            _ => {}
        }
    }
}

async fn echo(connection: Arc<Connection>) {
    loop {
        match connection.receive().await {
            Ok(message) => {
                if let Err(err) = connection.send(&message).await {
                    warn!(id = ?connection.id(), "echo failed: {}", err);
                    break;
                }
            }
            Err(err) => {
                // cancelled once the connection is gone
                if !err.is_interrupted() {
                    warn!(id = ?connection.id(), "receive failed: {}", err);
                }
                break;
            }
        }
    }
}

async fn send(config: StoneWireConfig, message: String, wait: u64) -> AppResult<()> {
    let connection = Connection::with_send_timeout(config.network.send_timeout());
    connection
        .connect(&config.network.ip, config.network.port)
        .await?;
    connection.send(&message).await?;
    let result = connection.receive_timeout(Duration::from_secs(wait)).await;
    connection.disconnect().await;
    match result {
        Ok(reply) => {
            println!("{}", reply);
            Ok(())
        }
        Err(err) => {
            error!("no reply: {}", err);
            Err(err)
        }
    }
}
