use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use minivpn::{
    AccountStore, MemoryStore, NetworkId, NetworkRegistry, RangeSpec, Relay, VpnConfig,
};

/// Minimal UDP VPN server with an interactive admin console on stdin.
#[derive(Parser)]
#[command(name = "minivpnd")]
struct Cli {
    /// Path to an INI configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Parser)]
#[command(name = "", no_binary_name = true)]
struct Admin {
    #[command(subcommand)]
    command: AdminCommand,
}

#[derive(Subcommand)]
enum AdminCommand {
    /// Create an account, optionally joining it to a network.
    AddUser {
        username: String,
        password: String,
        #[arg(long)]
        network: Option<u64>,
        /// Fixed virtual address instead of an auto-assigned one.
        #[arg(long)]
        address: Option<Ipv4Addr>,
    },
    /// Create a network from a CIDR range with an address capacity.
    AddNetwork {
        range: String,
        capacity: u32,
    },
    ListUsers,
    ListNetworks,
    /// Per-account transfer totals and current rates.
    Stats,
    Quit,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => VpnConfig::from_file(path)?,
        None => VpnConfig::default(),
    };

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(NetworkRegistry::new());
    let relay = Relay::from_config(
        &config.server,
        Arc::clone(&store) as Arc<dyn AccountStore>,
        Arc::clone(&registry),
    )
    .await?;

    let token = CancellationToken::new();
    let server = relay.spawn(token.clone());
    let _ = relay
        .monitor()
        .spawn_sampler(Duration::from_secs(1), token.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                None => break,
                Some(line) => {
                    let line = line.trim();
                    if !line.is_empty()
                        && !dispatch(line, store.as_ref(), &registry, &relay).await
                    {
                        break;
                    }
                }
            }
        }
    }

    token.cancel();
    server.await?;
    Ok(())
}

/// Runs one admin command; returns false when the server should stop.
async fn dispatch(
    line: &str,
    store: &MemoryStore,
    registry: &NetworkRegistry,
    relay: &Relay,
) -> bool {
    let admin = match Admin::try_parse_from(line.split_whitespace()) {
        Ok(admin) => admin,
        Err(e) => {
            println!("{e}");
            return true;
        }
    };

    match admin.command {
        AdminCommand::AddUser {
            username,
            password,
            network,
            address,
        } => {
            let id = match store.create(&username, &password).await {
                Ok(id) => id,
                Err(e) => {
                    println!("{e}");
                    return true;
                }
            };
            if let Some(network) = network.map(NetworkId) {
                // Fail loudly on a dangling network reference.
                if let Err(e) = registry.get(network) {
                    println!("{e}");
                    return true;
                }
                if let Err(e) = store.add_membership(id, network, false, address).await {
                    println!("{e}");
                    return true;
                }
            }
            println!("created {id}: {username}");
        }
        AdminCommand::AddNetwork { range, capacity } => {
            match registry.create_network(Some(RangeSpec::parse(&range)), capacity) {
                Ok(id) => println!("created {id}: {range}"),
                Err(e) => println!("{e}"),
            }
        }
        AdminCommand::ListUsers => {
            for account in store.list_all().await {
                let networks: Vec<String> = account
                    .networks
                    .iter()
                    .map(|m| match m.address {
                        Some(address) => format!("{} ({address})", m.network),
                        None => format!("{} (unassigned)", m.network),
                    })
                    .collect();
                println!("{} {} [{}]", account.id, account.username, networks.join(", "));
            }
        }
        AdminCommand::ListNetworks => {
            for network in registry.list_networks() {
                println!(
                    "{} {} mask {} capacity {}",
                    network.id, network.subnet.cidr, network.subnet.mask, network.capacity
                );
                for (account, address) in network.bindings() {
                    println!("  {account} -> {address}");
                }
            }
        }
        AdminCommand::Stats => {
            for (account, transfer) in relay.monitor().all_totals() {
                let rates = relay.monitor().rates(account);
                println!(
                    "{account}: down {} up {} ({}/s down, {}/s up)",
                    transfer.download, transfer.upload, rates.download, rates.upload
                );
            }
        }
        AdminCommand::Quit => return false,
    }
    true
}
