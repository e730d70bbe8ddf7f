//! Broker daemon entry point: loads configuration, wires the engine's
//! collaborators together, and runs the exchange timer loop and pinger
//! concurrently until shutdown.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use landscape_broker::config::Config;
use landscape_broker::exchange::{run_timer_loop, MessageExchange};
use landscape_broker::identity::Identity;
use landscape_broker::message_store::MessageStore;
use landscape_broker::persist::Persist;
use landscape_broker::pinger::Pinger;
use landscape_broker::reactor::Reactor;
use landscape_broker::registration::RegistrationHandler;
use landscape_broker::transport::{HttpTransport, ProxyConfig};
use landscape_broker::BrokerServer;
use tokio::sync::watch;

/// Durable message-exchange broker multiplexing local clients onto a
/// periodic HTTPS exchange with a remote server.
#[derive(Parser, Debug)]
#[command(name = "landscape-broker", version, about)]
struct Cli {
    /// Override the configured exchange URL.
    #[arg(long)]
    url: Option<String>,

    /// Print the resolved configuration and exit without running.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(url) = cli.url {
        config.url = url;
    }

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    log::info!("starting broker, exchanging with {}", config.url);

    let persist = Arc::new(Mutex::new(Persist::load(config.snapshot_path())));
    let store = Arc::new(Mutex::new(MessageStore::load(&persist.lock().unwrap())));
    let identity = {
        let loaded = Identity::load(&persist.lock().unwrap());
        Arc::new(Mutex::new(Identity {
            computer_title: config.computer_title.clone().or(loaded.computer_title),
            account_name: config.account_name.clone().or(loaded.account_name),
            registration_password: config
                .registration_password
                .clone()
                .or(loaded.registration_password),
            ..loaded
        }))
    };
    let reactor = Arc::new(Reactor::new());

    let proxies = ProxyConfig {
        http_proxy: config.http_proxy.clone(),
        https_proxy: config.https_proxy.clone(),
    };
    let transport = Arc::new(
        HttpTransport::new(
            config.url.clone(),
            config.ping_url.clone(),
            config.ssl_public_key.as_deref(),
            &proxies,
        )
        .context("failed to build HTTP transport")?,
    );

    let exchange = Arc::new(
        MessageExchange::new(
            reactor.clone(),
            store.clone(),
            identity.clone(),
            persist.clone(),
            transport.clone(),
        )
        .with_intervals(config.exchange_interval(), config.urgent_exchange_interval()),
    );

    let registration = RegistrationHandler::install(
        reactor.clone(),
        store.clone(),
        identity.clone(),
        persist.clone(),
        exchange.clone(),
    );

    let server = BrokerServer::new(reactor.clone(), store, persist, exchange.clone(), registration, config.clone());
    server.announce_started();

    let pinger = Arc::new(
        Pinger::new(transport, identity, exchange.clone()).with_interval(config.ping_interval()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctrlc_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutdown signal received");
        let _ = ctrlc_tx.send(true);
    });

    exchange.start();

    let exchange_task = tokio::spawn(run_timer_loop(exchange, shutdown_rx.clone()));
    let pinger_rx = shutdown_rx.clone();
    let pinger_task = tokio::spawn(async move { pinger.run(pinger_rx).await });

    let _ = tokio::join!(exchange_task, pinger_task);

    Ok(())
}
