// Shared fixtures: an in-memory chain, wallets over it and block helpers

#![allow(dead_code)]

use std::sync::{Arc, RwLock};

use rand::thread_rng;
use ringct_wallet::crypto::pedersen::commit;
use ringct_wallet::crypto::{BlindingFactor, SecretKey};
use ringct_wallet::transaction::{TxIn, TxOut};
use ringct_wallet::types::{BlockHash, Hash256, Script};
use ringct_wallet::{
    Amount, ChainState, CoinControl, Destination, InputKind, MemoryChain, MemoryKeyProvider, OutPoint,
    OutputKind, Recipient, SharedChain, StealthAddress, Transaction, Wallet, WalletConfig,
};

pub const PASSPHRASE: &str = "correct horse battery";

pub type Chain = Arc<RwLock<MemoryChain>>;

pub fn new_chain() -> Chain {
    Arc::new(RwLock::new(MemoryChain::new()))
}

/// Config that keeps a lone blinded output whole, so funding yields one coin
pub fn unsplit_config() -> WalletConfig {
    let mut config = WalletConfig::default();
    config.privacy.split_single_blind_output = false;
    config
}

pub fn new_wallet(chain: &Chain, config: WalletConfig) -> (Wallet, Arc<MemoryKeyProvider>) {
    ringct_wallet::logging::init(&config.logging);
    let keys = Arc::new(MemoryKeyProvider::new(PASSPHRASE));
    let shared: SharedChain = chain.clone();
    let wallet = Wallet::load(shared, keys.clone(), config).unwrap();
    (wallet, keys)
}

/// Connect a block holding `txs` and let every wallet see it
pub fn mine(chain: &Chain, wallets: &[&Wallet], txs: &[Transaction]) -> BlockHash {
    let hash = {
        let mut chain = chain.write().unwrap();
        let hash = Hash256::hash(format!("block {}", chain.best_height() + 1).as_bytes());
        let height = chain.add_block(hash);
        for tx in txs {
            let txid = tx.txid().unwrap();
            chain.remove_from_mempool(&txid);
            for (n, output) in tx.outputs.iter().enumerate() {
                if let TxOut::Anon {
                    pubkey, commitment, ..
                } = output
                {
                    chain.push_anon_output(*pubkey, *commitment, height, OutPoint::new(txid, n as u32));
                }
            }
        }
        hash
    };
    for wallet in wallets {
        wallet.block_connected(&hash, txs).unwrap();
    }
    hash
}

pub fn mine_empty(chain: &Chain, count: i32) {
    chain.write().unwrap().mine_empty(count);
}

/// A transaction from outside any wallet paying `value` to `script`
pub fn external_payment(script: Script, value: Amount) -> Transaction {
    let mut rng = thread_rng();
    let mut tx = Transaction::new(0);
    tx.inputs.push(TxIn::Standard {
        prevout: OutPoint::new(Hash256::hash(&rand::random::<[u8; 32]>()), 0),
        pubkey: SecretKey::random(&mut rng).public_key(),
        signature: vec![0u8; 64],
    });
    tx.outputs.push(TxOut::Standard { value, script });
    tx
}

/// Pay `value` to a fresh address of `wallet` and confirm it
pub fn fund_standard(chain: &Chain, wallet: &Wallet, value: Amount) -> OutPoint {
    let id = wallet.new_address().unwrap();
    let tx = external_payment(Script::for_key_id(&id), value);
    mine(chain, &[wallet], &[tx.clone()]);
    OutPoint::new(tx.txid().unwrap(), 0)
}

/// Have `faucet` pay `value` of `kind` to a new stealth address of
/// `wallet`, confirmed in a block both wallets see
pub fn fund_private(
    chain: &Chain,
    faucet: &Wallet,
    wallet: &Wallet,
    kind: OutputKind,
    value: Amount,
) -> (Transaction, StealthAddress) {
    let address = wallet.new_stealth_address(Some("funding")).unwrap();
    let recipient = Recipient::new(Destination::Stealth(address), kind, value);
    let (tx, _) = faucet
        .build_transaction(&[recipient], InputKind::Standard, &CoinControl::new(), true)
        .unwrap();
    mine(chain, &[faucet, wallet], &[tx.clone()]);
    (tx, address)
}

/// Unrelated anonymous outputs for decoy selection, old enough to qualify
pub fn seed_decoys(chain: &Chain, count: usize) {
    let mut rng = thread_rng();
    let mut chain = chain.write().unwrap();
    for i in 0..count {
        let pubkey = SecretKey::random(&mut rng).public_key();
        let commitment = commit(&BlindingFactor::random(&mut rng), 1_000 + i as u64);
        let outpoint = OutPoint::new(Hash256::hash(pubkey.as_bytes()), 0);
        chain.push_anon_output(pubkey, commitment, 0, outpoint);
    }
}

pub fn foreign_key_id() -> ringct_wallet::types::KeyId {
    SecretKey::random(&mut thread_rng()).public_key().key_id()
}
