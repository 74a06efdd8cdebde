use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dicechannel_client::{
    transport, Client, ClientError, EngineConfig, EthereumChain,
};
use dicechannel_core::crypto::Signer;
use dicechannel_core::store::BetFilter;
use ethers_core::types::{Address, H256, U256};
use tracing::{debug, info};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "dicechannel.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a channel with a partner, funding it with an initial deposit.
    Open {
        partner: Address,
        /// Deposit in token base units.
        deposit: String,
    },
    /// Top up the deposit in an existing channel.
    Deposit {
        partner: Address,
        /// Amount in token base units.
        amount: String,
    },
    /// Start a wagering round. Requires the host message bus; see the
    /// library documentation for wiring a transport.
    Bet {
        partner: Address,
        /// Bet mask over dice outcomes, hex (e.g. 0x3f).
        mask: String,
        /// Number of dice outcomes.
        modulo: u64,
        /// Stake in token base units.
        value: String,
        /// Optional deterministic seed for the round random.
        #[arg(long)]
        seed: Option<String>,
    },
    /// Unilaterally close a channel with the latest balance proof.
    Close { partner: Address },
    /// Propose a cooperative, dispute-free close.
    CoopClose { partner: Address },
    /// Settle a closed channel after the dispute window.
    Settle { partner: Address },
    /// Release a settled lock.
    Unlock { partner: Address, lock_id: H256 },
    /// Resolve a disputed round on-chain.
    Dispute { channel: H256, bet: H256 },
    /// List all channels.
    Channels,
    /// List bets, optionally for one channel.
    Bets {
        #[arg(long)]
        channel: Option<H256>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing. In order to view logs, run `RUST_LOG=info dicechannel ...`
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = dicechannel_client::config::load_config(&cli.config)?;
    debug!(path = ?cli.config, "configuration loaded");

    let key = hex::decode(config.private_key.trim_start_matches("0x"))?;
    let signer = Signer::from_bytes(&key).map_err(|e| anyhow::anyhow!("private key: {e}"))?;

    let ws_url = config.ws_url.clone().unwrap_or_else(|| config.rpc_url.clone());
    let chain = EthereumChain::connect(
        &config.rpc_url,
        &ws_url,
        &config.private_key,
        config.payment_contract,
    )
    .await?;

    let (bus, inbox) = transport::disconnected();
    let client = Client::builder(signer, EngineConfig::from(&config))
        .transport(Arc::new(bus), inbox)
        .chain(Arc::new(chain))
        .build()
        .await?;
    info!(local = ?client.local(), "client ready");

    run(&client, cli.command).await
}

async fn run(client: &Client, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Open { partner, deposit } => {
            let tx = client.open_channel(partner, parse_amount(&deposit)?).await?;
            println!("open submitted: {tx:#x}");
        }
        Commands::Deposit { partner, amount } => {
            let tx = client.deposit(partner, parse_amount(&amount)?).await?;
            println!("deposit submitted: {tx:#x}");
        }
        Commands::Bet {
            partner,
            mask,
            modulo,
            value,
            seed,
        } => {
            let channel = client.get_channel(partner)?;
            let bet_id = client
                .start_bet(
                    channel.channel_identifier,
                    partner,
                    parse_mask(&mask)?,
                    modulo,
                    parse_amount(&value)?,
                    seed.as_deref().map(str::as_bytes),
                )
                .await?;
            println!("round started, bet id {bet_id:#x}");
        }
        Commands::Close { partner } => {
            let tx = client.close_channel(partner).await?;
            println!("close submitted: {tx:#x}");
        }
        Commands::CoopClose { partner } => {
            client.close_channel_cooperative(partner).await?;
            println!("cooperative settle requested");
        }
        Commands::Settle { partner } => {
            let tx = client.settle_channel(partner).await?;
            println!("settle submitted: {tx:#x}");
        }
        Commands::Unlock { partner, lock_id } => {
            let tx = client.unlock_channel(partner, lock_id).await?;
            println!("unlock submitted: {tx:#x}");
        }
        Commands::Dispute { channel, bet } => {
            let tx = client.initiator_settle(channel, bet).await?;
            println!("dispute submitted: {tx:#x}");
        }
        Commands::Channels => {
            for channel in client.get_all_channels()? {
                println!(
                    "{:#x}  partner {:?}  {}  local {} / remote {}  round {}",
                    channel.channel_identifier,
                    channel.remote,
                    channel.status,
                    channel.local_balance,
                    channel.remote_balance,
                    channel.current_round,
                );
            }
        }
        Commands::Bets {
            channel,
            offset,
            limit,
        } => {
            let filter = BetFilter {
                channel_identifier: channel,
                ..Default::default()
            };
            for bet in client.get_all_bets(&filter, offset, limit)? {
                println!(
                    "{:#x}  round {}  {}  stake {}  mask {:#x}/{}",
                    bet.bet_id(),
                    bet.round,
                    bet.status,
                    bet.value,
                    bet.bet_mask,
                    bet.modulo,
                );
            }
        }
    }
    Ok(())
}

fn parse_amount(s: &str) -> Result<U256, ClientError> {
    U256::from_dec_str(s).map_err(|e| ClientError::Config(format!("bad amount {s:?}: {e}")))
}

fn parse_mask(s: &str) -> Result<U256, ClientError> {
    let trimmed = s.trim_start_matches("0x");
    U256::from_str_radix(trimmed, 16)
        .map_err(|e| ClientError::Config(format!("bad mask {s:?}: {e}")))
}
