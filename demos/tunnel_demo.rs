use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_derive::{Parser, Subcommand};
use httptunnel::client_driver::ClientDriver;
use httptunnel::config::{TunnelConfig, DEFAULT_PORT};
use httptunnel::http_transport::HttpTransport;
use httptunnel::relay::http_service::serve_http;
use httptunnel::relay::Relay;
use httptunnel::server_driver::ServerDriver;
use httptunnel::tunnel_handle::TunnelHandle;
use tokio::net::TcpListener;
use tokio::select;
use tracing::{info, warn, Level};

/// Runs one of the three parties of an HTTP tunnel. Start a relay, then a broker linking to it,
///  then any number of clients sending messages through the relay to the broker, which echoes
///  them back.
#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// -v for debug output, -vv for trace output
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    Relay {
        #[clap(long, default_value_t = default_link_address())]
        link_address: String,
        #[clap(long, default_value = "127.0.0.1:8080")]
        http_address: String,
    },
    Broker {
        #[clap(long, default_value_t = default_link_address())]
        relay_address: String,
        #[clap(long, default_value = "broker")]
        service: String,
    },
    Client {
        #[clap(long, default_value = "http://127.0.0.1:8080/tunnel")]
        url: String,
        #[clap(long, default_value = "broker")]
        service: String,
        /// poll every n seconds instead of keeping a pull request open
        #[clap(long)]
        pull_period: Option<u64>,
        messages: Vec<String>,
    },
}

fn default_link_address() -> String {
    format!("127.0.0.1:{}", DEFAULT_PORT)
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    match args.command {
        Command::Relay { link_address, http_address } => run_relay(&link_address, &http_address).await,
        Command::Broker { relay_address, service } => run_broker(relay_address, service).await,
        Command::Client { url, service, pull_period, messages } => run_client(url, &service, pull_period, messages).await,
    }
}

async fn run_relay(link_address: &str, http_address: &str) -> anyhow::Result<()> {
    let relay = Relay::new(TunnelConfig::default())?;
    let link_listener = TcpListener::bind(link_address).await?;
    let http_listener = TcpListener::bind(http_address).await?;

    tokio::spawn(relay.clone().timeout_loop());
    select! {
        result = relay.clone().accept_links(link_listener) => result,
        result = serve_http(relay.clone(), http_listener) => result,
    }
}

async fn run_broker(relay_address: String, service: String) -> anyhow::Result<()> {
    let driver = ServerDriver::new(TunnelConfig::default(), service)?;
    tokio::spawn(driver.clone().run_link(relay_address));
    tokio::spawn(driver.clone().sweep_loop());

    loop {
        select! {
            accepted = driver.accept() => {
                let handle = accepted?;
                info!("accepted {:?}", handle);
                tokio::spawn(echo(handle));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    driver.shutdown(Duration::from_secs(10)).await
}

async fn echo(handle: TunnelHandle) {
    loop {
        match handle.read(4096).await {
            Ok(Some(data)) => {
                if let Err(e) = handle.write(&data).await {
                    warn!("echo to {:?} failed: {}", handle, e);
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("reading from {:?} failed: {}", handle, e);
                return;
            }
        }
    }
    if let Err(e) = handle.close().await {
        warn!("closing {:?} failed: {}", handle, e);
    }
}

async fn run_client(url: String, service: &str, pull_period: Option<u64>, messages: Vec<String>) -> anyhow::Result<()> {
    let config = TunnelConfig::default();
    let connection_timeout = config.poll.default_connection_timeout;
    let driver = ClientDriver::new(config, Arc::new(HttpTransport::new(url)))?;
    tokio::spawn(driver.clone().sweep_loop());

    let handle = driver.open_with(service, pull_period.map(Duration::from_secs), connection_timeout).await?;
    info!("connected: {:?}", handle);

    for message in messages {
        handle.write(message.as_bytes()).await?;

        let mut echoed = Vec::new();
        while echoed.len() < message.len() {
            match handle.read(message.len() - echoed.len()).await? {
                Some(data) => echoed.extend_from_slice(&data),
                None => anyhow::bail!("broker closed the connection"),
            }
        }
        println!("{}", String::from_utf8_lossy(&echoed));
    }

    handle.close().await?;
    driver.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::relay(&["tunnel_demo", "relay"])]
    #[case::broker(&["tunnel_demo", "broker"])]
    fn test_link_address_defaults_to_default_port(#[case] argv: &[&str]) {
        let address = match Args::parse_from(argv.iter().copied()).command {
            Command::Relay { link_address, .. } => link_address,
            Command::Broker { relay_address, .. } => relay_address,
            Command::Client { .. } => unreachable!(),
        };
        assert_eq!(address, format!("127.0.0.1:{}", DEFAULT_PORT));
    }
}
