//! Wallet composition: the command surface.
//!
//! The [`Wallet`] struct ties together the vault, accounts and their address
//! pools, coin selection, PSBT signing, pending signing sessions and the
//! persisted backup container. Blockchain data comes from a caller-supplied
//! [`BlockchainClient`]; its failures are propagated, never papered over.
//!
//! Seeds are derived from the vault only inside the operation that needs
//! them and are zeroized when that operation returns.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::psbt::Psbt;
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use chrono::Utc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use satchel_core::address::{parse_address, AddressType, MultisigAddressType, Network};
use satchel_core::error::{ClientError, ValidationError};
use satchel_core::traits::BlockchainClient;
use satchel_core::types::{dedup_utxos, merge_histories, Recipient, TxSummary, Utxo};

use crate::account::{Account, AccountKind, AddressInfo, AddressRecord};
use crate::backup::{BackupContainer, Contact, PendingSession, CURRENT_BACKUP_VERSION};
use crate::builder::TransactionBuilder;
use crate::coin_selection::CoinSelector;
use crate::config::WalletConfig;
use crate::encryption;
use crate::error::{BackupError, CryptoError, MultisigError, PsbtError, WalletError};
use crate::fee::InputProfile;
use crate::keys::{account_path, derive_node, KeyNode, Seed};
use crate::mnemonic::{check_entropy_quality, generate_mnemonic, mnemonic_to_seed, normalize_phrase};
use crate::multisig::{assemble_account, export_cosigner, CosignerRecord};
use crate::psbt;
use crate::rate_limit::RateLimiter;
use crate::raw_key::decode_raw_key;
use crate::vault::{ImportedKey, Vault, VaultMaterial};

/// Balance of one account, split by confirmation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletBalance {
    pub confirmed: u64,
    pub unconfirmed: u64,
    pub utxo_count: usize,
}

impl WalletBalance {
    pub fn total(&self) -> u64 {
        self.confirmed.saturating_add(self.unconfirmed)
    }
}

/// A UTXO together with the address slot that owns it.
struct OwnedUtxo {
    utxo: Utxo,
    index: u32,
    change: bool,
}

/// How inputs of `account` are spent, for fee estimation.
fn input_profile(account: &Account) -> InputProfile {
    match &account.kind {
        AccountKind::SingleSig { address_type, .. } => {
            InputProfile::single_sig(address_type.script_type(), true)
        }
        AccountKind::ImportedKey {
            address_type,
            public_key,
        } => InputProfile::single_sig(address_type.script_type(), public_key.compressed),
        AccountKind::Multisig(config) => InputProfile::Multisig {
            script_type: config.address_type.script_type(),
            m: config.m,
            n: config.n,
        },
    }
}

/// Non-custodial wallet: one vault, many accounts.
pub struct Wallet {
    config: WalletConfig,
    vault: Option<Vault>,
    accounts: Vec<Account>,
    contacts: Vec<Contact>,
    pending: Vec<PendingSession>,
    tx_notes: Option<BTreeMap<String, String>>,
    selector: CoinSelector,
    creation_limiter: RateLimiter,
    import_limiter: RateLimiter,
}

impl Wallet {
    /// An empty wallet. Call [`Wallet::create`] or [`Wallet::restore`] next.
    pub fn new(config: WalletConfig) -> Result<Self, WalletError> {
        config.validate()?;
        Ok(Self {
            creation_limiter: RateLimiter::from_config(&config.wallet_creation_limit),
            import_limiter: RateLimiter::from_config(&config.key_import_limit),
            config,
            vault: None,
            accounts: Vec::new(),
            contacts: Vec::new(),
            pending: Vec::new(),
            tx_notes: None,
            selector: CoinSelector::new(),
        })
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.vault.is_some()
    }

    pub fn is_unlocked(&self) -> bool {
        self.vault.as_ref().is_some_and(Vault::is_unlocked)
    }

    fn vault(&self) -> Result<&Vault, WalletError> {
        self.vault.as_ref().ok_or(WalletError::Uninitialized)
    }

    fn seed(&self) -> Result<Seed, WalletError> {
        self.vault()?
            .with_material(|m| Ok(mnemonic_to_seed(&m.mnemonic, &m.passphrase)?))
    }

    // --- Wallet lifecycle ---

    /// Generate a new phrase and seal it under `password`.
    ///
    /// Returns the phrase so the user can write it down. Account 0 (native
    /// segwit) is created alongside.
    pub fn create(
        &mut self,
        password: &[u8],
        word_count: usize,
    ) -> Result<Zeroizing<String>, WalletError> {
        self.creation_limiter.check()?;
        if self.vault.is_some() {
            return Err(WalletError::AlreadyInitialized);
        }
        let phrase = Zeroizing::new(generate_mnemonic(word_count)?);
        self.initialize(VaultMaterial::new(phrase.as_str(), ""), password)?;
        info!(network = %self.config.network, words = word_count, "wallet created");
        Ok(phrase)
    }

    /// Restore from an existing phrase.
    ///
    /// Published test-vector phrases and degenerate phrases are refused.
    pub fn restore(
        &mut self,
        phrase: &str,
        passphrase: &str,
        password: &[u8],
    ) -> Result<(), WalletError> {
        self.creation_limiter.check()?;
        if self.vault.is_some() {
            return Err(WalletError::AlreadyInitialized);
        }
        let normalized = Zeroizing::new(normalize_phrase(phrase));
        check_entropy_quality(&normalized)?;
        mnemonic_to_seed(&normalized, passphrase)?;
        self.initialize(VaultMaterial::new(normalized.as_str(), passphrase), password)?;
        info!(network = %self.config.network, "wallet restored");
        Ok(())
    }

    fn initialize(&mut self, material: VaultMaterial, password: &[u8]) -> Result<(), WalletError> {
        let vault = Vault::create(material, password, &self.config.kdf)?;
        self.vault = Some(vault);
        match self.derive_single_sig(AddressType::NativeSegwit) {
            Ok(account) => {
                self.accounts.push(account);
                Ok(())
            }
            Err(e) => {
                self.vault = None;
                Err(e)
            }
        }
    }

    pub fn unlock(&self, password: &[u8]) -> Result<(), WalletError> {
        let result = self.vault()?.unlock(password, &self.config.kdf);
        if let Err(WalletError::Crypto(e)) = &result {
            warn!(error = %e, "unlock failed");
        }
        result
    }

    pub fn lock(&self) {
        if let Some(vault) = &self.vault {
            vault.lock();
        }
    }

    pub fn change_password(&self, old: &[u8], new: &[u8]) -> Result<(), WalletError> {
        self.vault()?.change_password(old, new, &self.config.kdf)
    }

    // --- Accounts ---

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn account(&self, index: u32) -> Result<&Account, WalletError> {
        self.accounts
            .iter()
            .find(|a| a.index == index)
            .ok_or(WalletError::AccountNotFound(index))
    }

    fn account_mut(&mut self, index: u32) -> Result<&mut Account, WalletError> {
        self.accounts
            .iter_mut()
            .find(|a| a.index == index)
            .ok_or(WalletError::AccountNotFound(index))
    }

    fn next_account_index(&self) -> Result<u32, WalletError> {
        u32::try_from(self.accounts.len())
            .map_err(|_| WalletError::KeyDerivation("too many accounts".into()))
    }

    /// Derive the next HD account of `address_type` with its gap filled.
    fn derive_single_sig(&self, address_type: AddressType) -> Result<Account, WalletError> {
        let network = self.config.network;
        let siblings = self
            .accounts
            .iter()
            .filter(|a| {
                matches!(&a.kind, AccountKind::SingleSig { address_type: t, .. } if *t == address_type)
            })
            .count();
        let number = u32::try_from(siblings)
            .map_err(|_| WalletError::KeyDerivation("too many accounts".into()))?;
        let path = account_path(address_type.into(), network, number)?;
        let node = derive_node(&self.seed()?, &path, network)?;
        let mut account = Account::single_sig(self.next_account_index()?, address_type, &node);
        account.ensure_gap(self.config.gap_limit, network)?;
        Ok(account)
    }

    fn push_account(&mut self, account: Account) -> u32 {
        let index = account.index;
        info!(account = index, script_type = ?account.script_type(), "account added");
        self.accounts.push(account);
        index
    }

    /// Add the next HD account of `address_type`. Returns its index.
    pub fn add_single_sig_account(&mut self, address_type: AddressType) -> Result<u32, WalletError> {
        self.import_limiter.check()?;
        let account = self.derive_single_sig(address_type)?;
        Ok(self.push_account(account))
    }

    /// Add an m-of-n account.
    ///
    /// A co-signer flagged `is_self` must be derivable from this wallet's
    /// seed. With no such co-signer the account is watch-only.
    pub fn add_multisig_account(
        &mut self,
        cosigners: Vec<CosignerRecord>,
        m: usize,
        n: usize,
        address_type: MultisigAddressType,
    ) -> Result<u32, WalletError> {
        self.import_limiter.check()?;
        self.vault()?;
        let network = self.config.network;
        let config = assemble_account(cosigners, m, n, address_type, network)?;
        if let Some(own) = config.self_cosigner() {
            let node = derive_node(&self.seed()?, &own.derivation_path, network)?;
            if node.xpub() != &own.xpub || node.origin().fingerprint != own.fingerprint {
                return Err(MultisigError::InvalidKey(format!(
                    "{} is marked as self but is not derived from this wallet",
                    own.xpub
                ))
                .into());
            }
        }
        let mut account = Account::multisig(self.next_account_index()?, config);
        account.ensure_gap(self.config.gap_limit, network)?;
        Ok(self.push_account(account))
    }

    /// Import a WIF private key as its own account.
    ///
    /// The key is stored in the vault; the account keeps only the public key.
    pub fn import_raw_key(&mut self, wif: &str, address_type: AddressType) -> Result<u32, WalletError> {
        self.import_limiter.check()?;
        let network = self.config.network;
        let key = decode_raw_key(wif)?;
        key.address(address_type, network)?;
        let public_key = key.public_key();
        let duplicate = self.accounts.iter().any(|a| {
            matches!(&a.kind, AccountKind::ImportedKey { public_key: k, .. } if *k == public_key)
        });
        if duplicate {
            return Err(ValidationError::InvalidKey("key is already imported".into()).into());
        }

        let index = self.next_account_index()?;
        let mut account = Account::imported(index, address_type, public_key);
        account.ensure_gap(self.config.gap_limit, network)?;
        let encoded = key.to_wif();
        self.vault()?.update_material(|m| {
            m.imported_keys.push(ImportedKey {
                account: index,
                wif: (*encoded).clone(),
            });
            Ok(())
        })?;
        Ok(self.push_account(account))
    }

    /// Append a fresh receive or change address to `account`.
    pub fn next_address(&mut self, account: u32, is_change: bool) -> Result<AddressRecord, WalletError> {
        let network = self.config.network;
        self.account_mut(account)?.next_address(is_change, network)
    }

    /// First unused receive address of `account`.
    pub fn receive_address(&mut self, account: u32) -> Result<AddressRecord, WalletError> {
        let network = self.config.network;
        self.account_mut(account)?.current_receive(network)
    }

    /// This wallet's co-signer record for setting up a multisig account.
    pub fn export_cosigner(
        &self,
        address_type: MultisigAddressType,
        account: u32,
    ) -> Result<CosignerRecord, WalletError> {
        export_cosigner(&self.seed()?, address_type, account, self.config.network)
    }

    /// Account-level extended public key in key-origin form.
    pub fn account_xpub(&self, account: u32) -> Result<String, WalletError> {
        match &self.account(account)?.kind {
            AccountKind::SingleSig {
                xpub,
                fingerprint,
                path,
                ..
            } => Ok(CosignerRecord {
                fingerprint: *fingerprint,
                xpub: *xpub,
                derivation_path: path.clone(),
                is_self: true,
            }
            .to_string()),
            AccountKind::Multisig(config) => config
                .self_cosigner()
                .map(ToString::to_string)
                .ok_or_else(|| WalletError::UnsupportedAccount("watch-only multisig".into())),
            AccountKind::ImportedKey { .. } => Err(WalletError::UnsupportedAccount(
                "imported keys have no extended key".into(),
            )),
        }
    }

    fn mark_used(&mut self, account: u32, addresses: &[String]) -> Result<(), WalletError> {
        if addresses.is_empty() {
            return Ok(());
        }
        let network = self.config.network;
        let gap_limit = self.config.gap_limit;
        let acct = self.account_mut(account)?;
        for address in addresses {
            acct.mark_used(address);
        }
        acct.ensure_gap(gap_limit, network)?;
        debug!(account, used = addresses.len(), "addresses marked used");
        Ok(())
    }

    // --- Blockchain queries ---

    async fn scan_utxos(
        &mut self,
        client: &dyn BlockchainClient,
        account: u32,
    ) -> Result<Vec<OwnedUtxo>, WalletError> {
        let network = self.config.network;
        let records: Vec<AddressRecord> = self.account(account)?.addresses().cloned().collect();

        let mut slots: HashMap<ScriptBuf, (u32, bool)> = HashMap::new();
        let mut found = Vec::new();
        let mut used = Vec::new();
        for record in records {
            let address = parse_address(&record.address, network)?;
            let utxos = client.fetch_utxos(&address).await?;
            if !utxos.is_empty() {
                used.push(record.address.clone());
            }
            slots.insert(address.script_pubkey(), (record.index, record.change));
            found.extend(utxos);
        }

        let owned = dedup_utxos(found)
            .into_iter()
            .map(|utxo| {
                let (index, change) = slots.get(&utxo.script_pubkey).copied().ok_or_else(|| {
                    ClientError::InvalidResponse(format!(
                        "{} pays to a script outside account {account}",
                        utxo.outpoint
                    ))
                })?;
                Ok(OwnedUtxo {
                    utxo,
                    index,
                    change,
                })
            })
            .collect::<Result<Vec<_>, WalletError>>()?;
        self.mark_used(account, &used)?;
        Ok(owned)
    }

    /// Sum the UTXOs of every address of `account`.
    pub async fn balance(
        &mut self,
        client: &dyn BlockchainClient,
        account: u32,
    ) -> Result<WalletBalance, WalletError> {
        let owned = self.scan_utxos(client, account).await?;
        let mut balance = WalletBalance {
            utxo_count: owned.len(),
            ..WalletBalance::default()
        };
        for OwnedUtxo { utxo, .. } in &owned {
            if utxo.is_confirmed() {
                balance.confirmed = balance.confirmed.saturating_add(utxo.value);
            } else {
                balance.unconfirmed = balance.unconfirmed.saturating_add(utxo.value);
            }
        }
        Ok(balance)
    }

    /// History of every address of `account`, newest first.
    pub async fn transactions(
        &mut self,
        client: &dyn BlockchainClient,
        account: u32,
        limit: Option<usize>,
    ) -> Result<Vec<TxSummary>, WalletError> {
        let network = self.config.network;
        let addresses: Vec<String> = self
            .account(account)?
            .addresses()
            .map(|r| r.address.clone())
            .collect();

        let mut histories = Vec::with_capacity(addresses.len());
        let mut used = Vec::new();
        for encoded in addresses {
            let address = parse_address(&encoded, network)?;
            let history = client.fetch_history(&address, limit).await?;
            if !history.is_empty() {
                used.push(encoded);
            }
            histories.push(history);
        }
        self.mark_used(account, &used)?;

        let mut merged = merge_histories(histories);
        if let Some(limit) = limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    // --- Spending ---

    /// Select coins from `account` and wrap the spend in a PSBT carrying
    /// full signing metadata.
    ///
    /// The change address, when used, is marked so the next spend rotates to
    /// a fresh one.
    pub async fn build_transaction(
        &mut self,
        client: &dyn BlockchainClient,
        account: u32,
        recipients: &[Recipient],
        fee_rate: Option<u64>,
    ) -> Result<Psbt, WalletError> {
        let network = self.config.network;
        let fees = self.config.fees;
        let rate = fees.resolve_rate(fee_rate)?;
        let owned = self.scan_utxos(client, account).await?;

        let (change, profile) = {
            let acct = self.account_mut(account)?;
            (acct.next_unused_change(network)?, input_profile(acct))
        };
        let change_address = parse_address(&change.address, network)?;

        let mut builder = TransactionBuilder::new();
        for recipient in recipients {
            builder.add_recipient(recipient.address.clone(), recipient.amount);
        }
        builder
            .set_fee_rate(rate)
            .set_dust_threshold(fees.dust_threshold);

        let utxos: Vec<Utxo> = owned.iter().map(|o| o.utxo.clone()).collect();
        let unsigned = builder.build(&utxos, &change_address, profile, &mut self.selector)?;

        let slots: HashMap<OutPoint, (u32, bool)> = owned
            .iter()
            .map(|o| (o.utxo.outpoint, (o.index, o.change)))
            .collect();
        let acct = self.account(account)?;
        let infos = unsigned
            .inputs
            .iter()
            .map(|utxo| {
                let (index, is_change) = slots.get(&utxo.outpoint).copied().ok_or_else(|| {
                    WalletError::BuildError(format!("selected unknown outpoint {}", utxo.outpoint))
                })?;
                acct.address_info(index, is_change, network)
            })
            .collect::<Result<Vec<AddressInfo>, WalletError>>()?;
        let psbt = psbt::create_psbt(&unsigned, &infos)?;

        if unsigned.change_index.is_some() {
            self.mark_used(account, &[change.address])?;
        }
        info!(
            account,
            inputs = unsigned.inputs.len(),
            fee = unsigned.fee,
            fee_rate = rate,
            "transaction built"
        );
        Ok(psbt)
    }

    fn signing_node(&self, path: &DerivationPath, fingerprint: Fingerprint) -> Result<KeyNode, WalletError> {
        let node = derive_node(&self.seed()?, path, self.config.network)?;
        if node.origin().fingerprint != fingerprint {
            return Err(WalletError::KeyDerivation(
                "account was not derived from this wallet's seed".into(),
            ));
        }
        Ok(node)
    }

    /// Add this wallet's signatures for `account` to `psbt`.
    ///
    /// Returns the new PSBT and the number of signatures added.
    pub fn sign_psbt(&self, psbt: &Psbt, account: u32) -> Result<(Psbt, usize), WalletError> {
        let acct = self.account(account)?;
        let (signed, added) = match &acct.kind {
            AccountKind::SingleSig {
                fingerprint, path, ..
            } => psbt::sign(psbt, &self.signing_node(path, *fingerprint)?)?,
            AccountKind::Multisig(config) => {
                let own = config.self_cosigner().ok_or_else(|| {
                    WalletError::UnsupportedAccount("watch-only multisig".into())
                })?;
                psbt::sign(psbt, &self.signing_node(&own.derivation_path, own.fingerprint)?)?
            }
            AccountKind::ImportedKey { .. } => {
                let key = self.vault()?.with_material(|m| {
                    let wif = m.imported_key(account).ok_or_else(|| {
                        WalletError::KeyDerivation(format!("no imported key for account {account}"))
                    })?;
                    Ok(decode_raw_key(wif)?)
                })?;
                psbt::sign_with_raw_key(psbt, &key)?
            }
        };
        debug!(account, signatures = added, "psbt signed by wallet");
        Ok((signed, added))
    }

    /// Finalize every input and extract the network-ready transaction,
    /// verified against the outputs it spends.
    pub fn finalize_and_extract(psbt: &Psbt) -> Result<Transaction, WalletError> {
        let finalized = psbt::finalize(psbt)?;
        let prevouts = finalized
            .inputs
            .iter()
            .enumerate()
            .map(|(input, i)| i.witness_utxo.clone().ok_or(PsbtError::MissingUtxo { input }))
            .collect::<Result<Vec<_>, _>>()?;
        let tx = psbt::extract(&finalized)?;
        psbt::verify_extracted(&tx, &prevouts)?;
        Ok(tx)
    }

    pub async fn broadcast(
        &self,
        client: &dyn BlockchainClient,
        tx: &Transaction,
    ) -> Result<Txid, WalletError> {
        let txid = client.broadcast(&serialize_hex(tx)).await?;
        info!(%txid, "transaction broadcast");
        Ok(txid)
    }

    // --- Pending signing sessions ---

    /// Persist an in-progress signing round. Returns the session id (the
    /// unsigned transaction's txid).
    ///
    /// Saving a PSBT for an existing session merges signatures, so an older
    /// copy never discards progress.
    pub fn save_pending(&mut self, psbt: &Psbt, description: &str) -> Result<String, WalletError> {
        let id = psbt.unsigned_tx.compute_txid().to_string();
        match self.pending.iter_mut().find(|s| s.id == id) {
            Some(session) => {
                let merged = psbt::combine(&psbt::from_base64(&session.psbt)?, psbt)?;
                session.psbt = psbt::to_base64(&merged);
                if !description.is_empty() {
                    session.description = description.to_string();
                }
            }
            None => self.pending.push(PendingSession {
                id: id.clone(),
                psbt: psbt::to_base64(psbt),
                created_at: Utc::now(),
                description: description.to_string(),
            }),
        }
        debug!(session = %id, "pending session saved");
        Ok(id)
    }

    pub fn pending(&self) -> &[PendingSession] {
        &self.pending
    }

    pub fn pending_psbt(&self, id: &str) -> Result<Psbt, WalletError> {
        let session = self
            .pending
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| WalletError::PendingNotFound(id.to_string()))?;
        Ok(psbt::from_base64(&session.psbt)?)
    }

    /// Remove a session, returning its PSBT.
    pub fn take_pending(&mut self, id: &str) -> Result<Psbt, WalletError> {
        let psbt = self.pending_psbt(id)?;
        self.pending.retain(|s| s.id != id);
        Ok(psbt)
    }

    // --- Contacts and notes ---

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    /// Add or replace the contact called `name`.
    pub fn add_contact(
        &mut self,
        name: &str,
        address: &str,
        note: Option<String>,
    ) -> Result<(), WalletError> {
        let parsed = parse_address(address, self.config.network)?;
        let contact = Contact {
            name: name.to_string(),
            address: parsed.to_string(),
            note,
        };
        match self.contacts.iter_mut().find(|c| c.name == name) {
            Some(existing) => *existing = contact,
            None => self.contacts.push(contact),
        }
        Ok(())
    }

    pub fn remove_contact(&mut self, name: &str) -> bool {
        let before = self.contacts.len();
        self.contacts.retain(|c| c.name != name);
        self.contacts.len() != before
    }

    /// Attach a note to a transaction. An empty note removes it.
    pub fn set_note(&mut self, txid: &str, note: &str) -> Result<(), WalletError> {
        let txid = Txid::from_str(txid)
            .map_err(|e| ValidationError::InvalidFormat(format!("txid: {e}")))?
            .to_string();
        if note.is_empty() {
            if let Some(notes) = self.tx_notes.as_mut() {
                notes.remove(&txid);
            }
        } else {
            self.tx_notes
                .get_or_insert_with(BTreeMap::new)
                .insert(txid, note.to_string());
        }
        Ok(())
    }

    pub fn note(&self, txid: &str) -> Option<&str> {
        self.tx_notes.as_ref()?.get(txid).map(String::as_str)
    }

    // --- Persistence ---

    /// Encode the whole wallet as a backup container. The vault stays sealed,
    /// so this works while locked.
    pub fn export_backup(&self) -> Result<Vec<u8>, WalletError> {
        let container = BackupContainer {
            version: CURRENT_BACKUP_VERSION,
            network: self.config.network,
            vault: self.vault()?.blob(),
            accounts: self.accounts.clone(),
            contacts: self.contacts.clone(),
            pending_psbts: self.pending.clone(),
            tx_notes: self.tx_notes.clone(),
        };
        Ok(container.to_json()?)
    }

    /// Rebuild a wallet from backup bytes of any supported version. The
    /// result is locked.
    pub fn import_backup(config: WalletConfig, bytes: &[u8]) -> Result<Self, WalletError> {
        let container = BackupContainer::from_json(bytes)?;
        Self::from_container(config, container)
    }

    fn from_container(config: WalletConfig, container: BackupContainer) -> Result<Self, WalletError> {
        if container.network != config.network {
            return Err(ValidationError::WrongNetwork {
                expected: config.network.to_string(),
                found: container.network.to_string(),
            }
            .into());
        }
        if !encryption::verify_integrity(&container.vault) {
            return Err(CryptoError::Corrupted("backup vault checksum mismatch".into()).into());
        }
        let mut wallet = Self::new(config)?;
        wallet.vault = Some(Vault::from_blob(container.vault));
        wallet.accounts = container.accounts;
        wallet.contacts = container.contacts;
        wallet.pending = container.pending_psbts;
        wallet.tx_notes = container.tx_notes;
        info!(accounts = wallet.accounts.len(), "wallet loaded from backup");
        Ok(wallet)
    }

    /// Write the backup container to `path`, replacing it atomically.
    pub fn save_to_file(&self, path: &Path) -> Result<(), WalletError> {
        let bytes = self.export_backup()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| WalletError::IoError(e.to_string()))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).map_err(|e| WalletError::IoError(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| WalletError::IoError(e.to_string()))?;
        debug!(path = %path.display(), "wallet saved");
        Ok(())
    }

    /// Load a wallet written by [`Wallet::save_to_file`]. The result is locked.
    pub fn load_from_file(config: WalletConfig, path: &Path) -> Result<Self, WalletError> {
        let bytes = fs::read(path).map_err(|e| WalletError::IoError(e.to_string()))?;
        let container = BackupContainer::from_json(&bytes).map_err(|e| match e {
            BackupError::Malformed(reason) => WalletError::CorruptedFile(reason),
            other => other.into(),
        })?;
        Self::from_container(config, container)
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("network", &self.config.network)
            .field("initialized", &self.is_initialized())
            .field("unlocked", &self.is_unlocked())
            .field("accounts", &self.accounts.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::encryption::KdfParams;
    use crate::keys::Purpose;
    use crate::psbt::PsbtState;
    use async_trait::async_trait;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::{Address, NetworkKind, PrivateKey};
    use parking_lot::Mutex;
    use satchel_core::address::single_sig_address;
    use satchel_core::types::Confirmation;

    const OZONE: &str = "ozone drill grab fiber curtain grace pudding thank cruise elder eight picnic";
    const SCHEME: &str = "scheme spot photo card baby mountain device kick cradle pact join borrow";
    const RECIPIENT: &str = "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl";
    const PASSWORD: &[u8] = b"correct horse";

    fn config() -> WalletConfig {
        WalletConfig {
            kdf: KdfParams::fast_insecure(),
            gap_limit: 3,
            ..WalletConfig::for_network(Network::Testnet)
        }
    }

    fn restored(phrase: &str) -> Wallet {
        let mut wallet = Wallet::new(config()).unwrap();
        wallet.restore(phrase, "", PASSWORD).unwrap();
        wallet
    }

    fn recipient(amount: u64) -> Recipient {
        Recipient::new(parse_address(RECIPIENT, Network::Testnet).unwrap(), amount)
    }

    #[derive(Default)]
    struct MockClient {
        utxos: Mutex<HashMap<String, Vec<Utxo>>>,
        history: Mutex<HashMap<String, Vec<TxSummary>>>,
        broadcasts: Mutex<Vec<String>>,
        offline: bool,
    }

    impl MockClient {
        fn offline() -> Self {
            Self {
                offline: true,
                ..Self::default()
            }
        }

        fn fund(&self, address: &str, value: u64, seq: u8, confirmed: bool) {
            let utxo = Utxo {
                outpoint: OutPoint::new(Txid::from_byte_array([seq; 32]), 0),
                value,
                script_pubkey: parse_address(address, Network::Testnet)
                    .unwrap()
                    .script_pubkey(),
                confirmation: if confirmed {
                    Confirmation::Confirmed { height: 100 }
                } else {
                    Confirmation::Unconfirmed
                },
            };
            self.utxos
                .lock()
                .entry(address.to_string())
                .or_default()
                .push(utxo);
        }
    }

    #[async_trait]
    impl BlockchainClient for MockClient {
        async fn fetch_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ClientError> {
            if self.offline {
                return Err(ClientError::Unavailable("offline".into()));
            }
            Ok(self
                .utxos
                .lock()
                .get(&address.to_string())
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_history(
            &self,
            address: &Address,
            _limit: Option<usize>,
        ) -> Result<Vec<TxSummary>, ClientError> {
            if self.offline {
                return Err(ClientError::Unavailable("offline".into()));
            }
            Ok(self
                .history
                .lock()
                .get(&address.to_string())
                .cloned()
                .unwrap_or_default())
        }

        async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, ClientError> {
            self.broadcasts.lock().push(raw_tx_hex.to_string());
            Ok(Txid::from_byte_array([0xEE; 32]))
        }
    }

    #[test]
    fn create_returns_phrase_and_first_account() {
        let mut wallet = Wallet::new(config()).unwrap();
        let phrase = wallet.create(PASSWORD, 12).unwrap();
        assert_eq!(phrase.split(' ').count(), 12);
        assert!(wallet.is_unlocked());
        assert_eq!(wallet.accounts().len(), 1);
        assert_eq!(wallet.account(0).unwrap().receive.len(), 3);
        assert_eq!(
            wallet.create(PASSWORD, 12).unwrap_err(),
            WalletError::AlreadyInitialized
        );
    }

    #[test]
    fn uninitialized_wallet_refuses_operations() {
        let wallet = Wallet::new(config()).unwrap();
        assert_eq!(wallet.unlock(PASSWORD).unwrap_err(), WalletError::Uninitialized);
        assert_eq!(wallet.export_backup().unwrap_err(), WalletError::Uninitialized);
    }

    #[test]
    fn restore_derives_bip84_account() {
        let mut wallet = restored(OZONE);
        let seed = mnemonic_to_seed(OZONE, "").unwrap();
        let path = account_path(Purpose::from(AddressType::NativeSegwit), Network::Testnet, 0).unwrap();
        let node = derive_node(&seed, &path, Network::Testnet).unwrap();
        let first = node
            .derive_path(&"m/0/0".parse::<DerivationPath>().unwrap())
            .unwrap()
            .public_key();
        let expected = single_sig_address(&first, AddressType::NativeSegwit, Network::Testnet)
            .unwrap()
            .encoded();
        assert_eq!(wallet.receive_address(0).unwrap().address, expected);
        assert!(wallet.account_xpub(0).unwrap().contains("/84'/1'/0']tpub"));
    }

    #[test]
    fn restore_rejects_public_phrases() {
        let mut wallet = Wallet::new(config()).unwrap();
        let err = wallet
            .restore(
                "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
                "",
                PASSWORD,
            )
            .unwrap_err();
        assert!(matches!(err, WalletError::Validation(ValidationError::WeakMnemonic(_))));
        assert!(!wallet.is_initialized());
    }

    #[test]
    fn wallet_creation_is_rate_limited() {
        let mut cfg = config();
        cfg.wallet_creation_limit = RateLimitConfig::new(2, 3600);
        let mut wallet = Wallet::new(cfg).unwrap();
        for _ in 0..2 {
            assert!(matches!(
                wallet.restore("not a phrase", "", PASSWORD),
                Err(WalletError::Validation(_))
            ));
        }
        assert!(matches!(
            wallet.restore(OZONE, "", PASSWORD),
            Err(WalletError::RateLimited { .. })
        ));
    }

    #[test]
    fn lock_unlock_and_password_change() {
        let wallet = restored(OZONE);
        wallet.lock();
        assert_eq!(
            wallet.export_cosigner(MultisigAddressType::P2wsh, 0).unwrap_err(),
            WalletError::Locked
        );
        assert_eq!(
            wallet.unlock(b"wrong").unwrap_err(),
            WalletError::Crypto(CryptoError::WrongPassword)
        );
        wallet.unlock(PASSWORD).unwrap();
        wallet.change_password(PASSWORD, b"new").unwrap();
        wallet.lock();
        wallet.unlock(b"new").unwrap();
        assert!(wallet.export_cosigner(MultisigAddressType::P2wsh, 0).is_ok());
    }

    #[test]
    fn hd_accounts_number_per_type() {
        let mut wallet = restored(OZONE);
        let second = wallet.add_single_sig_account(AddressType::NativeSegwit).unwrap();
        let legacy = wallet.add_single_sig_account(AddressType::Legacy).unwrap();
        assert_eq!((second, legacy), (1, 2));
        assert!(wallet.account_xpub(second).unwrap().contains("/84'/1'/1']"));
        assert!(wallet.account_xpub(legacy).unwrap().contains("/44'/1'/0']"));
    }

    #[test]
    fn uncompressed_key_only_for_legacy() {
        let mut cfg = config();
        cfg.network = Network::Mainnet;
        let mut wallet = Wallet::new(cfg).unwrap();
        wallet.restore(OZONE, "", PASSWORD).unwrap();
        let wif = "5HpHagT65TZzG1PH3CSu63k8DbpvD8s5ip4nEB3kEsreAnchuDf";
        assert!(matches!(
            wallet.import_raw_key(wif, AddressType::NativeSegwit),
            Err(WalletError::Validation(ValidationError::UncompressedKey { .. }))
        ));
        let index = wallet.import_raw_key(wif, AddressType::Legacy).unwrap();
        assert_eq!(
            wallet.receive_address(index).unwrap().address,
            "1EHNa6Q4Jz2uvNExL497mE43ikXhwF6kZm"
        );
        assert!(matches!(
            wallet.import_raw_key(wif, AddressType::Legacy),
            Err(WalletError::Validation(ValidationError::InvalidKey(_)))
        ));
    }

    #[tokio::test]
    async fn balance_propagates_client_failure() {
        let mut wallet = restored(OZONE);
        let err = wallet.balance(&MockClient::offline(), 0).await.unwrap_err();
        assert_eq!(err, WalletError::Client(ClientError::Unavailable("offline".into())));
    }

    #[tokio::test]
    async fn balance_marks_used_and_extends_gap() {
        let mut wallet = restored(OZONE);
        let client = MockClient::default();
        let first = wallet.receive_address(0).unwrap().address;
        client.fund(&first, 70_000, 1, true);
        client.fund(&first, 5_000, 2, false);

        let balance = wallet.balance(&client, 0).await.unwrap();
        assert_eq!(balance.confirmed, 70_000);
        assert_eq!(balance.unconfirmed, 5_000);
        assert_eq!(balance.total(), 75_000);
        assert_eq!(balance.utxo_count, 2);

        let account = wallet.account(0).unwrap();
        assert!(account.find(&first).unwrap().used);
        assert_eq!(account.receive.len(), 4);
        assert_ne!(wallet.receive_address(0).unwrap().address, first);
    }

    #[tokio::test]
    async fn single_sig_send_flow() {
        let mut wallet = restored(OZONE);
        let client = MockClient::default();
        let first = wallet.receive_address(0).unwrap().address;
        client.fund(&first, 100_000, 1, true);
        client.fund(&first, 50_000, 2, true);

        let psbt = wallet
            .build_transaction(&client, 0, &[recipient(30_000)], Some(2))
            .await
            .unwrap();
        assert_eq!(psbt::state(&psbt).unwrap(), PsbtState::Unsigned);
        let change_output = psbt.unsigned_tx.output.last().unwrap().script_pubkey.clone();
        let change = wallet
            .account(0)
            .unwrap()
            .change
            .iter()
            .find(|r| parse_address(&r.address, Network::Testnet).unwrap().script_pubkey() == change_output)
            .unwrap();
        assert!(change.used);

        let (signed, added) = wallet.sign_psbt(&psbt, 0).unwrap();
        assert_eq!(added, signed.inputs.len());
        let tx = Wallet::finalize_and_extract(&signed).unwrap();
        assert_eq!(tx.output[0].value.to_sat(), 30_000);

        let txid = wallet.broadcast(&client, &tx).await.unwrap();
        assert_eq!(txid, Txid::from_byte_array([0xEE; 32]));
        assert_eq!(client.broadcasts.lock()[0], serialize_hex(&tx));

        let again = wallet
            .build_transaction(&client, 0, &[recipient(30_000)], Some(2))
            .await
            .unwrap();
        assert_ne!(again.unsigned_tx.output.last().unwrap().script_pubkey, change_output);
    }

    #[tokio::test]
    async fn build_reports_insufficient_funds() {
        let mut wallet = restored(OZONE);
        let client = MockClient::default();
        let first = wallet.receive_address(0).unwrap().address;
        client.fund(&first, 10_000, 1, true);
        let err = wallet
            .build_transaction(&client, 0, &[recipient(50_000)], None)
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn imported_key_send_flow() {
        let mut wallet = restored(OZONE);
        let secret = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let wif = PrivateKey::new(secret, NetworkKind::Test).to_wif();
        let index = wallet.import_raw_key(&wif, AddressType::NestedSegwit).unwrap();

        let client = MockClient::default();
        let address = wallet.receive_address(index).unwrap().address;
        assert!(address.starts_with('2'));
        client.fund(&address, 80_000, 7, true);

        let psbt = wallet
            .build_transaction(&client, index, &[recipient(20_000)], Some(1))
            .await
            .unwrap();
        let (signed, added) = wallet.sign_psbt(&psbt, index).unwrap();
        assert_eq!(added, 1);
        let tx = Wallet::finalize_and_extract(&signed).unwrap();
        assert_eq!(tx.input.len(), 1);
        assert!(!tx.input[0].witness.is_empty());
        assert!(!tx.input[0].script_sig.is_empty());
    }

    fn multisig_pair() -> (Wallet, Wallet) {
        let mut a = restored(OZONE);
        let mut b = restored(SCHEME);
        let rec_a = a.export_cosigner(MultisigAddressType::P2wsh, 0).unwrap();
        let rec_b = b.export_cosigner(MultisigAddressType::P2wsh, 0).unwrap();
        let foreign = |r: &CosignerRecord| CosignerRecord {
            is_self: false,
            ..r.clone()
        };
        a.add_multisig_account(vec![rec_a.clone(), foreign(&rec_b)], 2, 2, MultisigAddressType::P2wsh)
            .unwrap();
        b.add_multisig_account(vec![foreign(&rec_a), rec_b], 2, 2, MultisigAddressType::P2wsh)
            .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn two_party_multisig_round() {
        let (mut a, mut b) = multisig_pair();
        let shared = a.receive_address(1).unwrap().address;
        assert_eq!(b.receive_address(1).unwrap().address, shared);

        let client = MockClient::default();
        client.fund(&shared, 200_000, 3, true);
        let psbt = a
            .build_transaction(&client, 1, &[recipient(60_000)], Some(3))
            .await
            .unwrap();

        let (from_a, added_a) = a.sign_psbt(&psbt, 1).unwrap();
        assert_eq!(added_a, 1);
        assert_eq!(
            psbt::state(&from_a).unwrap(),
            PsbtState::PartiallySigned {
                signatures: 1,
                required: 2
            }
        );
        assert!(matches!(
            Wallet::finalize_and_extract(&from_a),
            Err(WalletError::Psbt(crate::error::PsbtError::InsufficientSignatures { .. }))
        ));

        let id = a.save_pending(&from_a, "rent").unwrap();
        let (from_b, added_b) = b.sign_psbt(&psbt, 1).unwrap();
        assert_eq!(added_b, 1);
        assert_eq!(a.save_pending(&from_b, "").unwrap(), id);
        let merged = a.take_pending(&id).unwrap();
        assert!(a.pending().is_empty());

        let tx = Wallet::finalize_and_extract(&merged).unwrap();
        assert_eq!(tx.input[0].witness.len(), 4);
    }

    #[test]
    fn foreign_self_record_rejected() {
        let mut a = restored(OZONE);
        let b = restored(SCHEME);
        let rec_a = CosignerRecord {
            is_self: false,
            ..a.export_cosigner(MultisigAddressType::P2wsh, 0).unwrap()
        };
        let rec_b = b.export_cosigner(MultisigAddressType::P2wsh, 0).unwrap();
        assert!(matches!(
            a.add_multisig_account(vec![rec_a, rec_b], 1, 2, MultisigAddressType::P2wsh),
            Err(WalletError::Multisig(MultisigError::InvalidKey(_)))
        ));
    }

    #[test]
    fn watch_only_multisig_cannot_sign() {
        let mut a = restored(OZONE);
        let b = restored(SCHEME);
        let foreign = |w: &Wallet| CosignerRecord {
            is_self: false,
            ..w.export_cosigner(MultisigAddressType::P2shP2wsh, 0).unwrap()
        };
        let cosigners = vec![foreign(&a), foreign(&b)];
        let index = a
            .add_multisig_account(cosigners, 1, 2, MultisigAddressType::P2shP2wsh)
            .unwrap();
        let psbt = Psbt::from_unsigned_tx(Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: Vec::new(),
            output: Vec::new(),
        })
        .unwrap();
        assert!(matches!(
            a.sign_psbt(&psbt, index),
            Err(WalletError::UnsupportedAccount(_))
        ));
    }

    #[test]
    fn contacts_and_notes() {
        let mut wallet = restored(OZONE);
        wallet.add_contact("alice", RECIPIENT, None).unwrap();
        wallet
            .add_contact("alice", "2Mww8dCYPUpKHofjgcXcBCEGmniw9CoaiD2", Some("new".into()))
            .unwrap();
        assert_eq!(wallet.contacts().len(), 1);
        assert_eq!(wallet.contacts()[0].note.as_deref(), Some("new"));
        assert!(wallet
            .add_contact("bob", "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu", None)
            .is_err());
        assert!(wallet.remove_contact("alice"));
        assert!(!wallet.remove_contact("alice"));

        let txid = "ab".repeat(32);
        assert!(wallet.set_note("zz", "x").is_err());
        wallet.set_note(&txid, "groceries").unwrap();
        assert_eq!(wallet.note(&txid), Some("groceries"));
        wallet.set_note(&txid, "").unwrap();
        assert_eq!(wallet.note(&txid), None);
    }

    #[test]
    fn backup_roundtrip_preserves_state() {
        let mut wallet = restored(OZONE);
        wallet.add_single_sig_account(AddressType::Legacy).unwrap();
        wallet.add_contact("alice", RECIPIENT, None).unwrap();
        wallet.set_note(&"cd".repeat(32), "salary").unwrap();
        let bytes = wallet.export_backup().unwrap();

        let mut copy = Wallet::import_backup(config(), &bytes).unwrap();
        assert!(!copy.is_unlocked());
        assert_eq!(copy.accounts(), wallet.accounts());
        assert_eq!(copy.contacts(), wallet.contacts());
        assert_eq!(copy.note(&"cd".repeat(32)), Some("salary"));
        copy.unlock(PASSWORD).unwrap();
        assert_eq!(
            copy.next_address(0, false).unwrap(),
            wallet.next_address(0, false).unwrap()
        );
    }

    #[test]
    fn backup_for_other_network_rejected() {
        let wallet = restored(OZONE);
        let bytes = wallet.export_backup().unwrap();
        let err = Wallet::import_backup(WalletConfig::for_network(Network::Mainnet), &bytes).unwrap_err();
        assert!(matches!(err, WalletError::Validation(ValidationError::WrongNetwork { .. })));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("wallet.json");
        let wallet = restored(SCHEME);
        wallet.save_to_file(&path).unwrap();

        let loaded = Wallet::load_from_file(config(), &path).unwrap();
        assert_eq!(loaded.accounts(), wallet.accounts());
        assert_eq!(loaded.unlock(b"wrong").unwrap_err(), WalletError::Crypto(CryptoError::WrongPassword));
        loaded.unlock(PASSWORD).unwrap();
    }

    #[test]
    fn load_corrupted_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        fs::write(&path, b"garbage").unwrap();
        let err = Wallet::load_from_file(config(), &path).unwrap_err();
        assert!(matches!(err, WalletError::CorruptedFile(_)));
    }

    #[test]
    fn load_nonexistent_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Wallet::load_from_file(config(), &dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, WalletError::IoError(_)));
    }

    #[test]
    fn debug_hides_secrets() {
        let wallet = restored(OZONE);
        let debug = format!("{wallet:?}");
        assert!(debug.contains("Testnet"));
        assert!(!debug.contains("ozone"));
    }
}
