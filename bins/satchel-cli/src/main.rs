//! satchel: command-line front end for the Satchel signing core.
//!
//! Wallet lifecycle, accounts, addresses, balances and the PSBT signing
//! round. Secrets are prompted for without echo and the wallet file only
//! ever holds the sealed vault.

mod config;
mod esplora;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Amount, Denomination, Psbt};
use clap::{Args, Parser, Subcommand};
use zeroize::Zeroizing;

use satchel_core::address::{parse_address, AddressType, MultisigAddressType, Network};
use satchel_core::constants::COIN;
use satchel_core::types::Recipient;
use satchel_wallet::psbt::{self, PsbtState};
use satchel_wallet::transport::{self, ChunkCollector};
use satchel_wallet::{AccountKind, CosignerRecord, Wallet};

use crate::config::Config;
use crate::esplora::EsploraClient;

/// Satchel: non-custodial Bitcoin wallet.
#[derive(Parser)]
#[command(name = "satchel")]
#[command(version, about = "Keys stay here. Everything else is a PSBT.")]
struct Cli {
    /// Path to wallet file (default: ~/.satchel/wallet.json).
    #[arg(short, long, global = true)]
    wallet: Option<PathBuf>,

    /// Network (mainnet, testnet or regtest).
    #[arg(short, long, global = true)]
    network: Option<String>,

    /// Esplora REST endpoint.
    #[arg(long, global = true)]
    esplora: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wallet management subcommands.
    Wallet {
        #[command(subcommand)]
        action: WalletAction,
    },
    /// Account management subcommands.
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },
    /// Show the current receive address (or a fresh one).
    Address(AddressArgs),
    /// Show an account's extended public key.
    Xpub(AccountArgs),
    /// Export this wallet's co-signer key for a multisig setup.
    Cosigner(CosignerArgs),
    /// Query account balance from the network.
    Balance(AccountArgs),
    /// List recent transactions.
    History(HistoryArgs),
    /// Build, sign and (when complete) broadcast a payment.
    Send(SendArgs),
    /// PSBT signing round subcommands.
    Psbt {
        #[command(subcommand)]
        action: PsbtAction,
    },
    /// Address book subcommands.
    Contact {
        #[command(subcommand)]
        action: ContactAction,
    },
    /// Attach a note to a transaction (empty text removes it).
    Note(NoteArgs),
    /// Backup subcommands.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand)]
enum WalletAction {
    /// Create a new wallet with a fresh recovery phrase.
    Create(WalletCreateArgs),
    /// Restore a wallet from a recovery phrase.
    Restore,
    /// Change the wallet password.
    Passwd,
    /// Show wallet summary (no password needed).
    Info,
}

#[derive(Args)]
struct WalletCreateArgs {
    /// Number of words (12, 15, 18, 21 or 24).
    #[arg(long, default_value = "12")]
    words: usize,
}

#[derive(Subcommand)]
enum AccountAction {
    /// Add an HD single-signature account.
    Add(AccountAddArgs),
    /// Add an m-of-n multisig account.
    Multisig(MultisigArgs),
    /// Import a WIF private key as its own account.
    ImportKey(AccountAddArgs),
    /// List accounts.
    List,
}

#[derive(Args)]
struct AccountAddArgs {
    /// Address type (legacy, nested-segwit or native-segwit).
    #[arg(short = 't', long = "type", default_value = "native-segwit")]
    address_type: String,
}

#[derive(Args)]
struct MultisigArgs {
    /// Signatures required.
    #[arg(short)]
    m: usize,

    /// Co-signer keys as `[fingerprint/path]xpub`, excluding this wallet.
    #[arg(long = "cosigner", required = true)]
    cosigners: Vec<String>,

    /// Script type (p2sh, p2sh-p2wsh or p2wsh).
    #[arg(short = 't', long = "type", default_value = "p2wsh")]
    address_type: String,

    /// Include this wallet's own key from multisig account N.
    #[arg(long = "self-account")]
    self_account: Option<u32>,
}

#[derive(Args)]
struct AccountArgs {
    /// Account index.
    #[arg(short, long, default_value = "0")]
    account: u32,
}

#[derive(Args)]
struct AddressArgs {
    #[command(flatten)]
    account: AccountArgs,

    /// Derive a new address instead of showing the current unused one.
    #[arg(long)]
    new: bool,
}

#[derive(Args)]
struct CosignerArgs {
    /// Script type (p2sh, p2sh-p2wsh or p2wsh).
    #[arg(short = 't', long = "type", default_value = "p2wsh")]
    address_type: String,

    /// Multisig account number in the derivation path.
    #[arg(short, long, default_value = "0")]
    account: u32,
}

#[derive(Args)]
struct HistoryArgs {
    #[command(flatten)]
    account: AccountArgs,

    /// Maximum number of transactions.
    #[arg(short, long, default_value = "25")]
    limit: usize,
}

#[derive(Args)]
struct SendArgs {
    #[command(flatten)]
    account: AccountArgs,

    /// Recipient as `address:amount`. Amounts with a decimal point are BTC,
    /// otherwise satoshis. Repeatable.
    #[arg(long = "to", required = true)]
    recipients: Vec<String>,

    /// Fee rate in sat/vB.
    #[arg(short, long)]
    fee_rate: Option<u64>,

    /// Write the signed PSBT here instead of broadcasting.
    #[arg(long)]
    psbt_out: Option<PathBuf>,

    /// Description stored with the pending session.
    #[arg(short, long, default_value = "")]
    description: String,
}

#[derive(Subcommand)]
enum PsbtAction {
    /// Add this wallet's signatures.
    Sign(PsbtSignArgs),
    /// Merge signatures from several copies of one PSBT.
    Combine(PsbtCombineArgs),
    /// Finalize and print the raw transaction, optionally broadcasting it.
    Finalize(PsbtFinalizeArgs),
    /// Show signing progress.
    Inspect(PsbtInput),
    /// List pending signing sessions.
    Pending,
    /// Split a PSBT into text chunks, one per line.
    Chunk(PsbtChunkArgs),
    /// Rebuild a PSBT from text chunks, one per line, in any order.
    Reassemble(PsbtReassembleArgs),
}

#[derive(Args)]
struct PsbtInput {
    /// Base64 PSBT, a file holding one, or a pending session id.
    psbt: String,
}

#[derive(Args)]
struct PsbtSignArgs {
    #[command(flatten)]
    input: PsbtInput,

    #[command(flatten)]
    account: AccountArgs,

    /// Write the signed PSBT here.
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct PsbtCombineArgs {
    /// PSBTs to merge (base64 or files).
    #[arg(required = true, num_args = 2..)]
    psbts: Vec<String>,

    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct PsbtFinalizeArgs {
    #[command(flatten)]
    input: PsbtInput,

    /// Broadcast the finalized transaction.
    #[arg(long)]
    broadcast: bool,
}

#[derive(Args)]
struct PsbtChunkArgs {
    #[command(flatten)]
    input: PsbtInput,

    /// Payload bytes per chunk.
    #[arg(short, long)]
    size: Option<usize>,
}

#[derive(Args)]
struct PsbtReassembleArgs {
    /// File with one chunk per line.
    file: PathBuf,

    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ContactAction {
    /// Add or replace a contact.
    Add {
        name: String,
        address: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Remove a contact.
    Remove { name: String },
    /// List contacts.
    List,
}

#[derive(Args)]
struct NoteArgs {
    txid: String,
    #[arg(default_value = "")]
    text: String,
}

#[derive(Subcommand)]
enum BackupAction {
    /// Write a backup of the wallet file.
    Export {
        /// Destination file.
        out: PathBuf,
    },
    /// Restore the wallet file from a backup.
    Import {
        /// Backup file (any supported version).
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(network) = &cli.network {
        config = config.with_network(parse_network(network)?);
    }
    if let Some(url) = cli.esplora.clone() {
        config.esplora_url = url;
    }
    if let Some(path) = cli.wallet.clone() {
        config.wallet_path = path;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Wallet { action } => match action {
            WalletAction::Create(args) => wallet_create(&config, args),
            WalletAction::Restore => wallet_restore(&config),
            WalletAction::Passwd => wallet_passwd(&config),
            WalletAction::Info => wallet_info(&config),
        },
        Commands::Account { action } => match action {
            AccountAction::Add(args) => account_add(&config, args),
            AccountAction::Multisig(args) => account_multisig(&config, args),
            AccountAction::ImportKey(args) => account_import_key(&config, args),
            AccountAction::List => account_list(&config),
        },
        Commands::Address(args) => show_address(&config, args),
        Commands::Xpub(args) => show_xpub(&config, args),
        Commands::Cosigner(args) => show_cosigner(&config, args),
        Commands::Balance(args) => show_balance(&config, args).await,
        Commands::History(args) => show_history(&config, args).await,
        Commands::Send(args) => send(&config, args).await,
        Commands::Psbt { action } => match action {
            PsbtAction::Sign(args) => psbt_sign(&config, args),
            PsbtAction::Combine(args) => psbt_combine(args),
            PsbtAction::Finalize(args) => psbt_finalize(&config, args).await,
            PsbtAction::Inspect(args) => psbt_inspect(&config, args),
            PsbtAction::Pending => psbt_pending(&config),
            PsbtAction::Chunk(args) => psbt_chunk(&config, args),
            PsbtAction::Reassemble(args) => psbt_reassemble(args),
        },
        Commands::Contact { action } => contact(&config, action),
        Commands::Note(args) => note(&config, args),
        Commands::Backup { action } => match action {
            BackupAction::Export { out } => backup_export(&config, &out),
            BackupAction::Import { input } => backup_import(&config, &input),
        },
    }
}

// --- Wallet ---

/// Create a new wallet and show its recovery phrase once.
fn wallet_create(config: &Config, args: WalletCreateArgs) -> Result<()> {
    ensure_absent(&config.wallet_path)?;
    let password = prompt_new_password()?;

    let mut wallet = Wallet::new(config.wallet_config())?;
    let phrase = wallet
        .create(password.as_bytes(), args.words)
        .context("Failed to create wallet")?;
    let address = wallet.receive_address(0)?;
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;

    println!("\n=== WALLET CREATED ===");
    println!("Network: {}", config.network);
    println!("\nRECOVERY PHRASE ({} WORDS):", args.words);
    println!("  {}", phrase.as_str());
    println!("\nWARNING: This phrase will NOT be shown again.");
    println!("Anyone with this phrase can spend your funds.");
    println!("\nFirst receive address: {}", address.address);
    println!("Wallet saved to: {}", config.wallet_path.display());
    Ok(())
}

/// Restore a wallet from a recovery phrase.
fn wallet_restore(config: &Config) -> Result<()> {
    ensure_absent(&config.wallet_path)?;
    let phrase = Zeroizing::new(prompt_password("Recovery phrase")?);
    let passphrase = Zeroizing::new(prompt_password("BIP-39 passphrase (empty for none)")?);
    let password = prompt_new_password()?;

    let mut wallet = Wallet::new(config.wallet_config())?;
    wallet
        .restore(&phrase, &passphrase, password.as_bytes())
        .context("Failed to restore wallet")?;
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;

    println!("\n=== WALLET RESTORED ===");
    println!("Network: {}", config.network);
    println!("Wallet saved to: {}", config.wallet_path.display());
    Ok(())
}

fn wallet_passwd(config: &Config) -> Result<()> {
    let wallet = load_wallet(config)?;
    let old = Zeroizing::new(prompt_password("Current password")?);
    let new = prompt_new_password()?;
    wallet
        .change_password(old.as_bytes(), new.as_bytes())
        .context("Failed to change password")?;
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;
    println!("Password changed.");
    Ok(())
}

fn wallet_info(config: &Config) -> Result<()> {
    let wallet = load_wallet(config)?;
    println!("\n=== WALLET ===");
    println!("File:     {}", config.wallet_path.display());
    println!("Network:  {}", wallet.network());
    println!("Accounts: {}", wallet.accounts().len());
    println!("Contacts: {}", wallet.contacts().len());
    println!("Pending:  {}", wallet.pending().len());
    Ok(())
}

// --- Accounts ---

fn account_add(config: &Config, args: AccountAddArgs) -> Result<()> {
    let address_type = parse_address_type(&args.address_type)?;
    let mut wallet = load_unlocked(config)?;
    let index = wallet.add_single_sig_account(address_type)?;
    wallet.lock();
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;
    println!("Added {address_type} account {index}.");
    Ok(())
}

fn account_multisig(config: &Config, args: MultisigArgs) -> Result<()> {
    let address_type = parse_multisig_type(&args.address_type)?;
    let mut cosigners = args
        .cosigners
        .iter()
        .map(|s| s.parse::<CosignerRecord>())
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid co-signer key")?;

    let mut wallet = match args.self_account {
        Some(_) => load_unlocked(config)?,
        None => load_wallet(config)?,
    };
    if let Some(account) = args.self_account {
        cosigners.push(wallet.export_cosigner(address_type, account)?);
    }
    let n = cosigners.len();
    let index = wallet.add_multisig_account(cosigners, args.m, n, address_type)?;
    wallet.lock();
    let first = wallet.receive_address(index)?;
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;

    println!("Added {}-of-{} {} account {}.", args.m, n, address_type, index);
    if args.self_account.is_none() {
        println!("No local key included: account is watch-only.");
    }
    println!("First receive address: {}", first.address);
    Ok(())
}

fn account_import_key(config: &Config, args: AccountAddArgs) -> Result<()> {
    let address_type = parse_address_type(&args.address_type)?;
    let mut wallet = load_unlocked(config)?;
    let wif = Zeroizing::new(prompt_password("WIF private key")?);
    let index = wallet.import_raw_key(wif.trim(), address_type)?;
    wallet.lock();
    let address = wallet.receive_address(index)?;
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;
    println!("Imported key as account {index}: {}", address.address);
    Ok(())
}

fn account_list(config: &Config) -> Result<()> {
    let wallet = load_wallet(config)?;
    println!("\n=== ACCOUNTS ===");
    for account in wallet.accounts() {
        let kind = match &account.kind {
            AccountKind::SingleSig {
                address_type, path, ..
            } => format!("{address_type} ({path})"),
            AccountKind::Multisig(ms) => {
                let role = if ms.self_cosigner().is_some() {
                    "signer"
                } else {
                    "watch-only"
                };
                format!("{}-of-{} {} [{role}]", ms.m, ms.n, ms.address_type)
            }
            AccountKind::ImportedKey { address_type, .. } => format!("{address_type} (imported)"),
        };
        let used = account.addresses().filter(|r| r.used).count();
        println!(
            "  #{:<3} {:<40} {} addresses, {} used",
            account.index,
            kind,
            account.addresses().count(),
            used
        );
    }
    Ok(())
}

// --- Addresses and keys ---

fn show_address(config: &Config, args: AddressArgs) -> Result<()> {
    let mut wallet = load_wallet(config)?;
    let record = if args.new {
        wallet.next_address(args.account.account, false)?
    } else {
        wallet.receive_address(args.account.account)?
    };
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;
    println!("{}", record.address);
    Ok(())
}

fn show_xpub(config: &Config, args: AccountArgs) -> Result<()> {
    let wallet = load_wallet(config)?;
    println!("{}", wallet.account_xpub(args.account)?);
    Ok(())
}

fn show_cosigner(config: &Config, args: CosignerArgs) -> Result<()> {
    let address_type = parse_multisig_type(&args.address_type)?;
    let wallet = load_unlocked(config)?;
    let record = wallet.export_cosigner(address_type, args.account)?;
    wallet.lock();
    println!("{record}");
    Ok(())
}

// --- Chain queries ---

async fn show_balance(config: &Config, args: AccountArgs) -> Result<()> {
    let mut wallet = load_wallet(config)?;
    let client = EsploraClient::new(&config.esplora_url)?;
    let balance = wallet
        .balance(&client, args.account)
        .await
        .context("Failed to fetch balance")?;
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;

    println!("\n=== BALANCE (account {}) ===", args.account);
    println!("Confirmed:   {}", format_btc(balance.confirmed));
    println!("Unconfirmed: {}", format_btc(balance.unconfirmed));
    println!("Total:       {}", format_btc(balance.total()));
    println!("UTXOs:       {}", balance.utxo_count);
    Ok(())
}

async fn show_history(config: &Config, args: HistoryArgs) -> Result<()> {
    let mut wallet = load_wallet(config)?;
    let client = EsploraClient::new(&config.esplora_url)?;
    let history = wallet
        .transactions(&client, args.account.account, Some(args.limit))
        .await
        .context("Failed to fetch history")?;

    println!("\n=== HISTORY (account {}) ===", args.account.account);
    for tx in &history {
        let when = match (tx.confirmation.height(), tx.timestamp) {
            (Some(height), Some(ts)) => format!("{} @{height}", ts.format("%Y-%m-%d %H:%M")),
            (Some(height), None) => format!("@{height}"),
            (None, _) => "unconfirmed".to_string(),
        };
        let txid = tx.txid.to_string();
        match wallet.note(&txid) {
            Some(note) => println!("  {txid}  {when}  {note}"),
            None => println!("  {txid}  {when}"),
        }
    }
    if history.is_empty() {
        println!("  (none)");
    }
    Ok(())
}

// --- Sending ---

async fn send(config: &Config, args: SendArgs) -> Result<()> {
    let recipients = args
        .recipients
        .iter()
        .map(|r| parse_recipient(r, config.network))
        .collect::<Result<Vec<_>>>()?;

    let mut wallet = load_unlocked(config)?;
    let client = EsploraClient::new(&config.esplora_url)?;
    let account = args.account.account;

    let unsigned = wallet
        .build_transaction(&client, account, &recipients, args.fee_rate)
        .await
        .context("Failed to build transaction")?;
    let fee = psbt_fee(&unsigned);
    let (signed, added) = wallet.sign_psbt(&unsigned, account)?;
    wallet.lock();

    println!("\n=== TRANSACTION ===");
    for r in &recipients {
        println!("To:  {} ({})", r.address, format_btc(r.amount));
    }
    if let Some(fee) = fee {
        println!("Fee: {fee} sats");
    }
    println!("Signatures added: {added}");

    if let (Ok(tx), None) = (Wallet::finalize_and_extract(&signed), &args.psbt_out) {
        let txid = wallet.broadcast(&client, &tx).await?;
        wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;
        println!("Broadcast: {txid}");
        return Ok(());
    }

    let id = wallet.save_pending(&signed, &args.description)?;
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;
    if args.psbt_out.is_some() {
        write_psbt(&signed, args.psbt_out.as_deref())?;
    }
    println!("Saved pending session {id}.");
    println!("Share the PSBT with co-signers, then run `satchel psbt finalize {id} --broadcast`.");
    Ok(())
}

// --- PSBT round ---

fn psbt_sign(config: &Config, args: PsbtSignArgs) -> Result<()> {
    let mut wallet = load_unlocked(config)?;
    let input = read_psbt(Some(&wallet), &args.input.psbt)?;
    let (signed, added) = wallet.sign_psbt(&input, args.account.account)?;
    wallet.lock();
    if added == 0 {
        bail!("No inputs could be signed by account {}", args.account.account);
    }
    let id = wallet.save_pending(&signed, "")?;
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;
    eprintln!("Added {added} signature(s) to session {id}.");
    write_psbt(&signed, args.out.as_deref())
}

fn psbt_combine(args: PsbtCombineArgs) -> Result<()> {
    let mut iter = args.psbts.iter();
    let first = iter.next().context("No PSBTs given")?;
    let mut merged = read_psbt(None, first)?;
    for next in iter {
        merged = psbt::combine(&merged, &read_psbt(None, next)?)?;
    }
    write_psbt(&merged, args.out.as_deref())
}

async fn psbt_finalize(config: &Config, args: PsbtFinalizeArgs) -> Result<()> {
    let mut wallet = load_wallet(config)?;
    let input = read_psbt(Some(&wallet), &args.input.psbt)?;
    let tx = Wallet::finalize_and_extract(&input).context("PSBT is not fully signed")?;
    let session = input.unsigned_tx.compute_txid().to_string();

    if !args.broadcast {
        println!("{}", serialize_hex(&tx));
        return Ok(());
    }
    let client = EsploraClient::new(&config.esplora_url)?;
    let broadcast = wallet.broadcast(&client, &tx).await?;
    if wallet.take_pending(&session).is_ok() {
        wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;
    }
    println!("Broadcast: {broadcast}");
    Ok(())
}

fn psbt_inspect(config: &Config, args: PsbtInput) -> Result<()> {
    let wallet = load_wallet(config).ok();
    let input = read_psbt(wallet.as_ref(), &args.psbt)?;
    println!("Txid:   {}", input.unsigned_tx.compute_txid());
    println!("Inputs: {}", input.inputs.len());
    for (i, out) in input.unsigned_tx.output.iter().enumerate() {
        println!("Output {i}: {} sats", out.value.to_sat());
    }
    if let Some(fee) = psbt_fee(&input) {
        println!("Fee:    {fee} sats");
    }
    match psbt::state(&input)? {
        PsbtState::Unsigned => println!("State:  unsigned"),
        PsbtState::PartiallySigned {
            signatures,
            required,
        } => println!("State:  {signatures} of {required} signatures"),
        PsbtState::Finalized => println!("State:  finalized"),
    }
    Ok(())
}

fn psbt_pending(config: &Config) -> Result<()> {
    let wallet = load_wallet(config)?;
    println!("\n=== PENDING SESSIONS ===");
    for session in wallet.pending() {
        let progress = psbt::from_base64(&session.psbt)
            .and_then(|p| psbt::state(&p))
            .map(|s| match s {
                PsbtState::Unsigned => "unsigned".to_string(),
                PsbtState::PartiallySigned {
                    signatures,
                    required,
                } => format!("{signatures}/{required}"),
                PsbtState::Finalized => "finalized".to_string(),
            })
            .unwrap_or_else(|e| format!("unreadable: {e}"));
        println!(
            "  {}  {}  {:<10} {}",
            session.id,
            session.created_at.format("%Y-%m-%d %H:%M"),
            progress,
            session.description
        );
    }
    if wallet.pending().is_empty() {
        println!("  (none)");
    }
    Ok(())
}

fn psbt_chunk(config: &Config, args: PsbtChunkArgs) -> Result<()> {
    let wallet = load_wallet(config).ok();
    let input = read_psbt(wallet.as_ref(), &args.input.psbt)?;
    let size = args.size.unwrap_or(config.chunk_size);
    for line in transport::chunk_text(&input.serialize(), size)? {
        println!("{line}");
    }
    Ok(())
}

fn psbt_reassemble(args: PsbtReassembleArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let mut collector = ChunkCollector::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        collector.add_str(line)?;
    }
    let missing = collector.missing();
    if !missing.is_empty() {
        let numbers: Vec<String> = missing.iter().map(|i| (i + 1).to_string()).collect();
        bail!("Missing chunks: {}", numbers.join(", "));
    }
    let bytes = collector.finish()?;
    let reassembled = Psbt::deserialize(&bytes).context("Reassembled data is not a PSBT")?;
    write_psbt(&reassembled, args.out.as_deref())
}

// --- Contacts, notes and backups ---

fn contact(config: &Config, action: ContactAction) -> Result<()> {
    let mut wallet = load_wallet(config)?;
    match action {
        ContactAction::Add {
            name,
            address,
            note,
        } => {
            wallet.add_contact(&name, &address, note)?;
            println!("Saved contact {name}.");
        }
        ContactAction::Remove { name } => {
            if !wallet.remove_contact(&name) {
                bail!("No contact named {name}");
            }
            println!("Removed contact {name}.");
        }
        ContactAction::List => {
            for c in wallet.contacts() {
                match &c.note {
                    Some(note) => println!("  {:<16} {}  {}", c.name, c.address, note),
                    None => println!("  {:<16} {}", c.name, c.address),
                }
            }
            return Ok(());
        }
    }
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")
}

fn note(config: &Config, args: NoteArgs) -> Result<()> {
    let mut wallet = load_wallet(config)?;
    wallet.set_note(&args.txid, &args.text)?;
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")
}

fn backup_export(config: &Config, out: &Path) -> Result<()> {
    let wallet = load_wallet(config)?;
    let bytes = wallet.export_backup()?;
    std::fs::write(out, bytes).with_context(|| format!("Failed to write {}", out.display()))?;
    println!("Backup written to {}", out.display());
    Ok(())
}

fn backup_import(config: &Config, input: &Path) -> Result<()> {
    ensure_absent(&config.wallet_path)?;
    let bytes =
        std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let wallet = Wallet::import_backup(config.wallet_config(), &bytes)
        .context("Failed to import backup")?;
    let password = Zeroizing::new(prompt_password("Wallet password")?);
    wallet
        .unlock(password.as_bytes())
        .context("Backup does not open with this password")?;
    wallet.lock();
    wallet.save_to_file(&config.wallet_path).context("Failed to save wallet")?;
    println!("Restored {} account(s) to {}", wallet.accounts().len(), config.wallet_path.display());
    Ok(())
}

// --- Helpers ---

fn load_wallet(config: &Config) -> Result<Wallet> {
    Wallet::load_from_file(config.wallet_config(), &config.wallet_path)
        .with_context(|| format!("Failed to load wallet from {}", config.wallet_path.display()))
}

fn load_unlocked(config: &Config) -> Result<Wallet> {
    let wallet = load_wallet(config)?;
    let password = Zeroizing::new(prompt_password("Wallet password")?);
    wallet
        .unlock(password.as_bytes())
        .context("Failed to unlock wallet (check password)")?;
    Ok(wallet)
}

fn ensure_absent(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("Wallet file already exists: {}", path.display());
    }
    Ok(())
}

/// Prompt for a password securely (no echo).
fn prompt_password(prompt: &str) -> Result<String> {
    rpassword::prompt_password(format!("{}: ", prompt)).context("Failed to read password")
}

fn prompt_new_password() -> Result<Zeroizing<String>> {
    let password = Zeroizing::new(prompt_password("New wallet password")?);
    let confirm = Zeroizing::new(prompt_password("Confirm password")?);
    if password != confirm {
        bail!("Passwords do not match");
    }
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(password)
}

/// A pending session id, a file, or inline base64.
fn read_psbt(wallet: Option<&Wallet>, source: &str) -> Result<Psbt> {
    if let Some(psbt) = wallet.and_then(|w| w.pending_psbt(source).ok()) {
        return Ok(psbt);
    }
    let path = Path::new(source);
    let text = if path.is_file() {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {source}"))?
    } else {
        source.to_string()
    };
    psbt::from_base64(text.trim()).context("Invalid PSBT")
}

fn write_psbt(psbt: &Psbt, out: Option<&Path>) -> Result<()> {
    let encoded = psbt::to_base64(psbt);
    match out {
        Some(path) => {
            std::fs::write(path, &encoded)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("PSBT written to {}", path.display());
        }
        None => println!("{encoded}"),
    }
    Ok(())
}

/// Fee implied by the PSBT's UTXO data, when every input carries it.
fn psbt_fee(psbt: &Psbt) -> Option<u64> {
    psbt.fee().ok().map(Amount::to_sat)
}

fn parse_recipient(s: &str, network: Network) -> Result<Recipient> {
    let (address, amount) = s
        .rsplit_once(':')
        .with_context(|| format!("Recipient {s} must be address:amount"))?;
    let address = parse_address(address, network)?;
    Ok(Recipient::new(address, parse_amount(amount)?))
}

/// Satoshis, or BTC when the value has a decimal point.
fn parse_amount(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.contains('.') {
        let amount = Amount::from_str_in(s, Denomination::Bitcoin)
            .with_context(|| format!("Invalid BTC amount: {s}"))?;
        Ok(amount.to_sat())
    } else {
        s.parse().with_context(|| format!("Invalid amount in sats: {s}"))
    }
}

fn format_btc(sats: u64) -> String {
    format!("{}.{:08} BTC", sats / COIN, sats % COIN)
}

fn parse_network(s: &str) -> Result<Network> {
    s.parse()
        .context("Invalid network (must be 'mainnet', 'testnet' or 'regtest')")
}

fn parse_address_type(s: &str) -> Result<AddressType> {
    s.parse().context("Invalid address type")
}

fn parse_multisig_type(s: &str) -> Result<MultisigAddressType> {
    s.parse().context("Invalid multisig type")
}
