//! multiconnect CLI
//!
//! Drives the connection core with embedded wallets and a file-backed store,
//! so a connect in one invocation is rehydrated by the next.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use multiconnect::adapter::{BitcoinAdapter, EvmAdapter, ProviderHandle, SolanaAdapter};
use multiconnect::connector::ids;
use multiconnect::storage::PersistedState;
use multiconnect::wallet::{auth_connector, EvmWallet, SolanaWallet};
use multiconnect::walletconnect::{create_namespaces, PairingUri};
use multiconnect::{
    networks, ConnectConfig, ConnectError, DisconnectParams, FileStorage, MultiConnect, Namespace,
    Storage,
};

/// Anvil / Hardhat development account #0
const DEV_EVM_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const DEV_SOLANA_SEED: &str = "0707070707070707070707070707070707070707070707070707070707070707";

/// multiconnect: multi-namespace wallet connection orchestration
#[derive(Parser)]
#[command(name = "multiconnect")]
#[command(about = "Connect wallets across EVM, Solana and Bitcoin namespaces", long_about = None)]
struct Cli {
    /// Where connection state persists between invocations
    #[arg(long, global = true, default_value = ".multiconnect.json")]
    storage: PathBuf,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hex private key of the embedded EVM wallet
    #[arg(long, global = true, default_value = DEV_EVM_KEY)]
    evm_key: String,

    /// Hex 32-byte seed of the embedded Solana wallet
    #[arg(long, global = true, default_value = DEV_SOLANA_SEED)]
    solana_seed: String,

    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered connectors, merged across namespaces
    Connectors,

    /// List namespaces with their active network
    Namespaces,

    /// Print a fresh WalletConnect pairing URI and the proposal it would carry
    PairingUri,

    /// Connect a wallet in one namespace
    Connect {
        /// Namespace (eip155, solana, bip122)
        #[arg(short, long, default_value = "eip155")]
        namespace: String,

        /// Connector id
        #[arg(short, long, default_value = ids::AUTH)]
        connector: String,
    },

    /// Rehydrate the stored session and show it
    Status,

    /// Sign a message with the active wallet of a namespace
    Sign {
        #[arg(value_name = "MESSAGE")]
        message: String,

        #[arg(short, long, default_value = "eip155")]
        namespace: String,
    },

    /// Disconnect one connector, one namespace or everything
    Disconnect {
        #[arg(short, long)]
        namespace: Option<String>,

        #[arg(short, long)]
        connector: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = run(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ConnectError> {
    let config = match &cli.config {
        Some(path) => ConnectConfig::from_file(path)?,
        None => ConnectConfig::default(),
    };

    if let Commands::PairingUri = cli.command {
        print_pairing_uri(&config);
        return Ok(());
    }

    let client = build_client(&cli, config).await?;
    let restored = client.rehydrate().await;
    debug!("{} namespace(s) restored", restored);

    match cli.command {
        Commands::Connectors => list_connectors(&client),
        Commands::Namespaces => list_namespaces(&client),
        Commands::PairingUri => {}
        Commands::Connect {
            namespace,
            connector,
        } => {
            let namespace = Namespace::new(namespace);
            let connection = client.connect_external(&connector, &namespace).await?;
            info!("Connected {} in {}", connection.connector_id, namespace);
            print_status(&client);
        }
        Commands::Status => print_status(&client),
        Commands::Sign { message, namespace } => {
            let signature = client
                .sign_message(&Namespace::new(namespace), &message)
                .await?;
            println!("{}", signature);
        }
        Commands::Disconnect {
            namespace,
            connector,
        } => {
            let params = DisconnectParams {
                id: connector,
                namespace: namespace.map(Namespace::new),
            };
            client.disconnect(params).await?;
            print_status(&client);
        }
    }
    Ok(())
}

/// Embedded wallets come back authorized when the store says they were
/// connected last time, the way a browser extension remembers a site
async fn build_client(cli: &Cli, config: ConnectConfig) -> Result<MultiConnect, ConnectError> {
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(&cli.storage)?);
    let persisted = PersistedState::new(storage.clone(), config.max_recent_connections);
    let remembered = |ns: &Namespace| {
        persisted
            .get_connected_connector_id(ns)
            .is_some_and(|id| id == ids::AUTH)
    };

    let mut evm_wallet = EvmWallet::from_private_key(&cli.evm_key, 1)?.with_chains(&[137, 42161]);
    if remembered(&Namespace::eip155()) {
        evm_wallet = evm_wallet.authorized();
    }
    let seed = parse_seed(&cli.solana_seed)?;
    let mut solana_wallet = SolanaWallet::from_seed(&seed);
    if remembered(&Namespace::solana()) {
        solana_wallet = solana_wallet.authorized();
    }

    let evm = EvmAdapter::new();
    evm.register_provider(auth_connector(
        Namespace::eip155(),
        ProviderHandle::from(Arc::new(evm_wallet)),
    ))
    .await;
    let solana = SolanaAdapter::new();
    solana
        .register_provider(auth_connector(
            Namespace::solana(),
            ProviderHandle::from(Arc::new(solana_wallet)),
        ))
        .await;

    MultiConnect::builder()
        .config(config)
        .storage(storage)
        .adapter(Arc::new(evm))
        .adapter(Arc::new(solana))
        .adapter(Arc::new(BitcoinAdapter::new()))
        .networks(vec![
            networks::mainnet(),
            networks::polygon(),
            networks::arbitrum(),
            networks::solana(),
            networks::bitcoin(),
        ])
        .build()
        .await
}

fn parse_seed(hex_seed: &str) -> Result<[u8; 32], ConnectError> {
    let bytes = hex::decode(hex_seed)
        .map_err(|e| ConnectError::Config(format!("solana seed: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| ConnectError::Config("solana seed must be 32 bytes".to_string()))
}

fn print_pairing_uri(config: &ConnectConfig) {
    let uri = PairingUri::generate(config.pairing_expiry());
    let proposal = create_namespaces(&networks::all(), config.namespace_overrides.as_ref());

    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│  WALLETCONNECT PAIRING                                      │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│  Topic:   {}", uri.topic);
    println!("│  Expires: in {}s", config.pairing_expiry().as_secs());
    println!("└─────────────────────────────────────────────────────────────┘");
    println!("{}", uri);
    match serde_json::to_string_pretty(&proposal) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("could not render proposal: {}", e),
    }
}

fn list_connectors(client: &MultiConnect) {
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│  CONNECTORS                                                 │");
    println!("├─────────────────────────────────────────────────────────────┤");
    for merged in client.connectors().get_connectors() {
        let namespaces: Vec<String> = merged
            .members()
            .iter()
            .map(|c| c.namespace().to_string())
            .collect();
        println!(
            "│  {:<20} │ {:<12} │ {}",
            merged.name(),
            format!("{:?}", merged.kind()),
            namespaces.join(", ")
        );
    }
    println!("└─────────────────────────────────────────────────────────────┘");
}

fn list_namespaces(client: &MultiConnect) {
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│  NAMESPACES                                                 │");
    println!("├─────────────────────────────────────────────────────────────┤");
    for namespace in client.chains().namespaces() {
        let network = client
            .chains()
            .caip_network(&namespace)
            .map(|n| format!("{} ({})", n.name, n.caip_network_id))
            .unwrap_or_else(|| "-".to_string());
        let requested = client.chains().get_requested_caip_networks(&namespace).len();
        println!("│  {:<8} │ {} │ {} requested", namespace, network, requested);
    }
    println!("└─────────────────────────────────────────────────────────────┘");
}

fn print_status(client: &MultiConnect) {
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│  SESSION                                                    │");
    println!("├─────────────────────────────────────────────────────────────┤");
    for namespace in client.chains().namespaces() {
        let active = client
            .get_active_connection(&namespace)
            .map(|c| c.connector_id)
            .unwrap_or_else(|| "-".to_string());
        let address = client
            .chains()
            .account_address(&namespace)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "│  {:<8} │ {:<12} │ {:<10} │ {}",
            namespace,
            client.status(&namespace).to_string(),
            active,
            address
        );
    }
    if let Some(address) = client.active_caip_address() {
        println!("│  Active: {}", address);
    }
    println!("└─────────────────────────────────────────────────────────────┘");
}
