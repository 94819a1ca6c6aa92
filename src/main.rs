//! Minicoin CLI front-end
//!
//! Thin wrapper over the node service: wallet management, one-off mining,
//! transfers, chain inspection and the long-running P2P node.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use minicoin::core::{Blockchain, ChainParams};
use minicoin::mining::Mempool;
use minicoin::network::{Node, NodeConfig, NodeIdentity};
use minicoin::node::NodeService;
use minicoin::storage::{ChainStore, WalletStore};
use minicoin::wallet::Wallet;

#[derive(Parser)]
#[command(name = "minicoin")]
#[command(version)]
#[command(about = "A Bitcoin-style cryptocurrency node", long_about = None)]
struct Cli {
    /// Data directory for chain, wallet and key storage
    #[arg(short, long, default_value = ".minicoin")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        action: WalletCommands,
    },

    /// Mine blocks to an address
    Mine {
        /// Miner address for the block rewards
        #[arg(short, long)]
        address: String,

        /// Number of blocks to mine
        #[arg(short, long, default_value = "1")]
        count: u32,
    },

    /// Send coins from a stored wallet
    Send {
        #[arg(short, long)]
        from: String,
        #[arg(short, long)]
        to: String,
        #[arg(short, long)]
        amount: i64,
    },

    /// Show chain information
    Chain,

    /// Run the P2P node
    Node {
        /// Port to listen on (0 picks an ephemeral port)
        #[arg(short, long, default_value = "9333")]
        port: u16,

        /// Bootstrap peers, comma separated
        #[arg(long)]
        peers: Option<String>,

        /// Mine to this address while the node runs
        #[arg(long)]
        mine: Option<String>,
    },
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Create a new wallet
    New,
    /// List stored wallets
    List,
    /// Show the balance of an address
    Balance {
        #[arg(short, long)]
        address: String,
    },
}

/// Operator address for genesis: the first stored wallet, created on demand
fn operator_address(wallet_store: &WalletStore) -> Result<String, Box<dyn std::error::Error>> {
    let addresses = wallet_store.addresses()?;
    if let Some(address) = addresses.first() {
        return Ok(address.clone());
    }
    let wallet = Wallet::new();
    wallet_store.save(&wallet.record())?;
    println!("created operator wallet {}", wallet.address());
    Ok(wallet.address())
}

fn open_chain(
    data_dir: &PathBuf,
    wallet_store: &WalletStore,
) -> Result<Blockchain, Box<dyn std::error::Error>> {
    let store = ChainStore::open(data_dir.join("chain"))?;
    let operator = operator_address(wallet_store)?;
    Ok(Blockchain::open(store, &operator, ChainParams::default())?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let wallet_store = Arc::new(WalletStore::open(cli.data_dir.join("wallets"))?);

    match cli.command {
        Commands::Wallet { action } => match action {
            WalletCommands::New => {
                let wallet = Wallet::new();
                wallet_store.save(&wallet.record())?;
                println!("address: {}", wallet.address());
                println!("public key: {}", wallet.public_key_hex());
            }
            WalletCommands::List => {
                for address in wallet_store.addresses()? {
                    println!("{}", address);
                }
            }
            WalletCommands::Balance { address } => {
                let chain = open_chain(&cli.data_dir, &wallet_store)?;
                println!("{}", chain.balance(&address)?);
            }
        },

        Commands::Mine { address, count } => {
            let mut chain = open_chain(&cli.data_dir, &wallet_store)?;
            for _ in 0..count {
                let block = chain.append(vec![], &address)?;
                println!(
                    "mined block {} at height {}",
                    hex::encode(block.hash),
                    chain.height() - 1
                );
            }
        }

        Commands::Send { from, to, amount } => {
            let mut chain = open_chain(&cli.data_dir, &wallet_store)?;
            let record = wallet_store
                .get(&from)?
                .ok_or_else(|| format!("wallet not found: {}", from))?;
            let wallet = Wallet::from_record(&record)?;

            let tx = chain.create_transaction(&from, &to, amount, wallet.key_pair())?;
            let tx_id = hex::encode(tx.id);
            // Without a running node the transfer is committed immediately
            chain.append(vec![tx], &from)?;
            println!("sent {} from {} to {} ({})", amount, from, to, tx_id);
        }

        Commands::Chain => {
            let chain = open_chain(&cli.data_dir, &wallet_store)?;
            let stats = chain.stats();
            println!("height:       {}", stats.height);
            println!("tip:          {}", stats.tip_hash);
            println!("difficulty:   {} bits", stats.difficulty);
            println!("transactions: {}", stats.total_transactions);
        }

        Commands::Node { port, peers, mine } => {
            let identity = NodeIdentity::load_or_generate(&cli.data_dir.join("node_key"))?;
            let chain = Arc::new(RwLock::new(open_chain(&cli.data_dir, &wallet_store)?));
            let mempool = Arc::new(RwLock::new(Mempool::new()));
            let cancel = CancellationToken::new();

            let service =
                NodeService::new(chain.clone(), mempool.clone(), wallet_store, cancel.clone())?;

            let bootstrap_peers: Vec<String> = peers
                .map(|p| p.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            let config = NodeConfig {
                listen_port: port,
                bootstrap_peers,
                ..NodeConfig::default()
            };

            let (events_tx, events_rx) = mpsc::channel(64);
            let node = Node::new(config, identity, chain, mempool, events_tx, cancel.clone());
            node.start().await?;

            service.attach_network(node.clone()).await;
            service.spawn_event_loops(events_rx);

            if let Some(miner_address) = mine {
                service.start_mining(&miner_address).await?;
                println!("mining to {}", miner_address);
            }

            if let Some(addr) = node.local_multiaddr() {
                println!("node address: {}", addr);
            }
            println!("press Ctrl+C to stop");

            tokio::signal::ctrl_c().await?;
            println!("shutting down");
            service.shutdown().await;
        }
    }

    Ok(())
}
