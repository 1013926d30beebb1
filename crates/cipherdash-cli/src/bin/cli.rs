use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cipherdash_core::validation::ElectionDraft;
use cipherdash_core::{Address, AppConfig, ChainId, Clock, ContractKind, Deployments, LOCAL_CHAIN_ID};
use cipherdash_crypto::EncryptionCapability;
use cipherdash_indexer::{fetch_dashboard, DashboardPoller, DashboardSnapshot};
use cipherdash_interop::ethers_backend::http_provider;
use cipherdash_interop::{CachedContracts, ChainClient, ContractProvider, EthersChainClient, LocalDevnet};
use cipherdash_state::{CounterSession, ElectionSession, LiveContext, Outcome, RatingScope, RatingSession, SessionDeps};
use cipherdash_wallet_core::{
    dev_accounts, DecryptionSignatureCache, JsonFileStorage, LocalKeySigner, MemoryStorage, StringStorage,
    WalletSigner,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "cipherdash")]
#[command(about = "FHEVM counter, election and rating client", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./cipherdash.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known contract deployments per chain
    Deployments,

    /// Print the effective configuration
    Config,

    /// Dashboard snapshot of a chain
    Dashboard {
        /// JSON-RPC endpoint; defaults to the configured network of --chain-id
        #[arg(long)]
        rpc: Option<String>,

        #[arg(long, default_value_t = LOCAL_CHAIN_ID)]
        chain_id: ChainId,

        /// Account whose balance is reported
        #[arg(long)]
        account: Option<String>,

        /// Keep polling until Ctrl-C
        #[arg(long)]
        watch: bool,
    },

    /// End-to-end runs against an in-process devnet
    Demo {
        #[command(subcommand)]
        scenario: DemoCommand,
    },
}

#[derive(Subcommand)]
enum DemoCommand {
    /// Increment, decrement and decrypt the FHE counter
    Counter {
        #[arg(long, default_value_t = 5)]
        increment: u32,

        #[arg(long, default_value_t = 2)]
        decrement: u32,
    },

    /// Create an election, vote, finalize and read the tally
    Election,

    /// Rate subjects, decrypt the averages and publish them
    Rating {
        #[arg(long, default_value = "Coffee")]
        subject: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Deployments => list_deployments(&config.deployments()?),
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
        Commands::Dashboard { rpc, chain_id, account, watch } => {
            let rpc = match rpc {
                Some(url) => url,
                None => config
                    .rpc_url(chain_id)
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("no RPC URL configured for chain {}", chain_id))?,
            };
            let account = account
                .map(|a| Address::from_str(&a).with_context(|| format!("invalid account {}", a)))
                .transpose()?;
            dashboard(&config, &rpc, account, watch).await?;
        }
        Commands::Demo { scenario } => match scenario {
            DemoCommand::Counter { increment, decrement } => demo_counter(&config, increment, decrement).await?,
            DemoCommand::Election => demo_election(&config).await?,
            DemoCommand::Rating { subject } => demo_rating(&config, &subject).await?,
        },
    }

    Ok(())
}

fn list_deployments(deployments: &Deployments) {
    for (chain_id, deployment) in deployments.chains() {
        println!("{} ({})", deployment.chain_name, chain_id);
        for kind in ContractKind::ALL {
            let info = deployments.resolve(kind, Some(*chain_id));
            match info.address.filter(|_| info.is_deployed()) {
                Some(address) => println!("  {:<18} {:#x}", kind.name(), address),
                None => println!("  {:<18} not deployed", kind.name()),
            }
        }
    }
}

fn print_snapshot(snapshot: &DashboardSnapshot) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    Ok(())
}

async fn dashboard(config: &AppConfig, rpc: &str, account: Option<Address>, watch: bool) -> Result<()> {
    let client: Arc<dyn ChainClient> = Arc::new(EthersChainClient::new(Arc::new(http_provider(rpc)?)));
    let deployments = Arc::new(config.deployments()?);

    if !watch {
        let snapshot = fetch_dashboard(&*client, &deployments, account, &config.dashboard).await;
        return print_snapshot(&snapshot);
    }

    let cancel = CancellationToken::new();
    let poller = DashboardPoller::new(client, deployments, account, config.dashboard.clone()).spawn(cancel.clone());
    let mut updates = poller.subscribe();
    info!("Polling {} every {}s, Ctrl-C to stop", rpc, config.dashboard.poll_interval_secs);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                print_snapshot(&snapshot)?;
            }
        }
    }

    poller.stop().await;
    Ok(())
}

/// Signature storage from `storage_path`, memory when unset.
async fn signature_storage(config: &AppConfig) -> Result<Arc<dyn StringStorage>> {
    let storage: Arc<dyn StringStorage> = match &config.storage_path {
        Some(path) => Arc::new(JsonFileStorage::open(path).await?),
        None => Arc::new(MemoryStorage::new()),
    };
    Ok(storage)
}

struct DemoEnv {
    devnet: LocalDevnet,
    deps: SessionDeps,
}

impl DemoEnv {
    async fn start(config: &AppConfig, signer: Arc<dyn WalletSigner>) -> Result<Self> {
        let devnet = LocalDevnet::start();
        let clock: Arc<dyn Clock> = devnet.clock();
        let signatures =
            DecryptionSignatureCache::with_clock(signature_storage(config).await?, clock.clone(), config.signature_duration_days);

        let context = Arc::new(LiveContext::new(Some(LOCAL_CHAIN_ID), Some(signer)));
        let capability: Arc<dyn EncryptionCapability> = devnet.coprocessor();
        context.set_capability(Some(capability));

        let contracts: Arc<dyn ContractProvider> = match config.contract_ttl_secs {
            Some(seconds) => Arc::new(CachedContracts::with_ttl(devnet.clone(), seconds, clock)),
            None => Arc::new(CachedContracts::new(devnet.clone())),
        };
        let deps = SessionDeps {
            contracts,
            deployments: Arc::new(Deployments::builtin()),
            signatures: Arc::new(signatures),
            context,
        };
        Ok(DemoEnv { devnet, deps })
    }

    fn use_signer(&self, private_key: &str) -> Result<Address> {
        let signer = LocalKeySigner::from_hex(private_key)?;
        let address = signer.address();
        let signer: Arc<dyn WalletSigner> = Arc::new(signer);
        self.deps.context.set_signer(Some(signer));
        Ok(address)
    }
}

fn signer(private_key: &str) -> Result<Arc<dyn WalletSigner>> {
    Ok(Arc::new(LocalKeySigner::from_hex(private_key)?))
}

fn check(step: &str, outcome: Outcome, message: &str) -> Result<()> {
    info!("{:<9} -> {:?} ({})", step, outcome, message);
    if !outcome.is_committed() {
        bail!("{} did not commit: {}", step, message);
    }
    Ok(())
}

async fn demo_counter(config: &AppConfig, increment: u32, decrement: u32) -> Result<()> {
    let env = DemoEnv::start(config, signer(dev_accounts::ALICE)?).await?;
    let session = CounterSession::new(env.deps.clone());

    check("connect", session.connect().await, &session.message())?;
    check("decrypt", session.decrypt_count_handle().await, &session.message())?;
    check("increment", session.increment(increment).await, &session.message())?;
    check("decrypt", session.decrypt_count_handle().await, &session.message())?;
    check("decrement", session.decrement(decrement).await, &session.message())?;
    check("decrypt", session.decrypt_count_handle().await, &session.message())?;

    let view = session.view();
    println!(
        "handle {} = {}",
        view.handle.map(|h| h.to_hex()).unwrap_or_default(),
        view.clear.map(|c| c.value.to_string()).unwrap_or_else(|| "?".to_string())
    );

    let snapshot = fetch_dashboard(
        &**env.devnet.chain(),
        &env.deps.deployments,
        env.deps.context.signer_address(),
        &config.dashboard,
    )
    .await;
    print_snapshot(&snapshot)
}

async fn demo_election(config: &AppConfig) -> Result<()> {
    let env = DemoEnv::start(config, signer(dev_accounts::DEPLOYER)?).await?;
    let session = ElectionSession::with_list_limit(env.deps.clone(), config.list_limit);

    let draft = ElectionDraft {
        title: "Demo election".to_string(),
        description: "Pick a candidate".to_string(),
        candidates: vec!["Ada".to_string(), "Grace".to_string(), "Linus".to_string()],
        duration_hours: 1,
    };
    let id = session
        .create_election(&draft)
        .await
        .ok_or_else(|| anyhow!(session.message()))?;
    info!("Created election {}", id);

    for (key, candidate) in [(dev_accounts::ALICE, 0), (dev_accounts::BOB, 2)] {
        let voter = env.use_signer(key)?;
        let outcome = session.vote(id, candidate).await;
        info!("{:#x} voted for {} -> {:?}", voter, draft.candidates[candidate], outcome);
        if !outcome.is_committed() {
            bail!("vote failed: {}", session.message());
        }
    }

    // past the one-hour voting window
    env.devnet.chain().increase_time(2 * 3600);
    env.use_signer(dev_accounts::DEPLOYER)?;
    if !session.end_election(id).await || !session.finalize_election(id).await {
        bail!("{}", session.message());
    }

    match session.decrypted_vote_sum(id).await {
        Some(sum) => println!("election {} finalized, sum of choices = {}", id, sum),
        None => warn!("election {} has no published tally", id),
    }
    for election in session.list_elections().await {
        println!("{}", serde_json::to_string_pretty(&election)?);
    }
    Ok(())
}

async fn demo_rating(config: &AppConfig, subject: &str) -> Result<()> {
    let env = DemoEnv::start(config, signer(dev_accounts::ALICE)?).await?;
    let session = RatingSession::with_list_limit(env.deps.clone(), config.list_limit);

    for (key, rating) in [(dev_accounts::ALICE, 4), (dev_accounts::BOB, 5)] {
        let rater = env.use_signer(key)?;
        let outcome = session.submit_rating(rating, subject).await;
        info!("{:#x} rated {} {} -> {:?}", rater, subject, rating, outcome);
        if !outcome.is_committed() {
            bail!("rating failed: {}", session.message());
        }
    }

    // the latest sums are allowed to bob
    let scope = RatingScope::Subject(subject.to_string());
    let stats = session
        .decrypt_stats(&scope)
        .await
        .ok_or_else(|| anyhow!(session.message()))?;
    println!("{}: average {} over {} rating(s), decrypted locally", subject, stats.average, stats.count);

    if !session.request_subject_stats(subject).await || !session.request_global_stats().await {
        bail!("{}", session.message());
    }
    println!("{}", serde_json::to_string_pretty(&session.subject_stats(subject).await)?);
    println!("{}", serde_json::to_string_pretty(&session.global_stats().await)?);
    Ok(())
}
