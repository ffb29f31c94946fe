//! The SPV transaction-matching engine.
//!
//! Merkle blocks prove which transactions a peer matched against our Bloom
//! filter; the transactions themselves follow separately. This engine
//! verifies the proofs, remembers which block each matched transaction
//! belongs to, and turns transactions into wallet rows: receive rows for
//! outputs paying our keys, spent flags and a send row when our outputs are
//! consumed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{Duration, Utc};
use tracing::{debug, info};

use kestrel_chain::{
    amount::Amount,
    block::{self, Header},
    transaction::{self, Transaction},
    BitcoinSerialize,
};

use crate::error::{InvalidReason, VerificationError, WalletError};
use crate::keys::KeyStore;
use crate::records::{ReceiveRow, SendRow};
use crate::store::WalletStore;

/// A send is backdated this much so it sorts ahead of its own change or a
/// self-payment received in the same transaction.
const SEND_TIME_SHIFT_SECONDS: i64 = 15;

/// What processing one transaction produced.
#[derive(Debug, Default)]
pub struct TxReport {
    pub received: Vec<ReceiveRow>,
    pub send: Option<SendRow>,
}

impl TxReport {
    pub fn is_relevant(&self) -> bool {
        !self.received.is_empty() || self.send.is_some()
    }
}

/// The matching engine over a wallet store and the key set.
pub struct Matcher<S> {
    store: Arc<S>,
    keys: Arc<RwLock<KeyStore>>,
    /// Which block each filter-matched transaction belongs to, recorded from
    /// merkle blocks so the following `tx` messages can associate. A
    /// transaction that arrives before its merkle block is recorded
    /// unconfirmed and is not retroactively associated.
    block_of_tx: Mutex<HashMap<transaction::Hash, block::Hash>>,
}

impl<S: WalletStore> Matcher<S> {
    pub fn new(store: Arc<S>, keys: Arc<RwLock<KeyStore>>) -> Matcher<S> {
        Matcher {
            store,
            keys,
            block_of_tx: Mutex::new(HashMap::new()),
        }
    }

    /// Verify a merkle block against its header and record the tx-to-block
    /// associations. Returns the matched transaction ids, in block order,
    /// for the header-chain engine to store.
    pub fn process_merkle_block(
        &self,
        header: &Header,
        transaction_count: u32,
        hashes: Vec<transaction::Hash>,
        flags: Vec<u8>,
    ) -> Result<Vec<transaction::Hash>, WalletError> {
        let block_hash = header.hash();
        let tree = block::merkle::PartialTree::new(transaction_count, hashes, flags);
        let (root, matched) = tree.extract_matches().map_err(|_| VerificationError {
            reason: InvalidReason::BadMerkleTree,
            hash: Some(block_hash.0),
        })?;

        if root != header.merkle_root {
            return Err(VerificationError {
                reason: InvalidReason::BadMerkleRoot,
                hash: Some(block_hash.0),
            }
            .into());
        }

        debug!(%block_hash, matched = matched.len(), "verified merkle block");
        let mut assoc = self.block_of_tx.lock().expect("association lock poisoned");
        for tx_hash in &matched {
            assoc.insert(*tx_hash, block_hash);
        }
        Ok(matched)
    }

    /// Scan one transaction against the wallet, writing any resulting rows.
    pub fn process_transaction(&self, tx: &Transaction) -> Result<TxReport, WalletError> {
        let tx_hash = tx.hash();

        // Rebroadcasts and malleated duplicates of stored transactions are
        // collapsed on read via the norm id; a transaction we hold rows for
        // is simply skipped.
        if !self.store.is_new_tx(tx_hash)? {
            return Ok(TxReport::default());
        }

        let block_hash = self
            .block_of_tx
            .lock()
            .expect("association lock poisoned")
            .remove(&tx_hash)
            .unwrap_or_else(block::Hash::zero);

        let norm_id = tx.normalized_id();
        let now = Utc::now();
        let mut report = TxReport::default();

        {
            let keys = self.keys.read().expect("key store lock poisoned");

            // Outputs paying one of our keys become receive rows.
            for (index, output) in tx.outputs.iter().enumerate() {
                let pub_key_hash = match output.lock_script.pay_to_pubkey_hash() {
                    Some(hash) => hash,
                    None => continue,
                };
                if let Some(key) = keys.find_by_hash160(&pub_key_hash) {
                    report.received.push(ReceiveRow {
                        norm_id,
                        tx_hash,
                        output_index: index as u32,
                        time: now,
                        block_hash,
                        address: pub_key_hash,
                        value: output.value,
                        script_bytes: output.lock_script.clone(),
                        spent: false,
                        change: key.change,
                        coinbase: tx.is_coinbase(),
                        in_safe: false,
                        deleted: false,
                    });
                }
            }
        }

        // Inputs spending our outputs mark those rows spent.
        let mut spent_value = Amount::zero();
        let mut spent_any = false;
        for input in &tx.inputs {
            let outpoint = match input.outpoint() {
                Some(outpoint) => outpoint,
                None => continue,
            };
            if let Some(row) = self.store.get_receive(outpoint.hash, outpoint.index)? {
                self.store
                    .set_receive_spent(outpoint.hash, outpoint.index, true)?;
                spent_value = spent_value + row.value;
                spent_any = true;
            }
        }

        // Any spend of ours also materializes a send row.
        if spent_any {
            let keys = self.keys.read().expect("key store lock poisoned");
            let destination = tx
                .outputs
                .iter()
                .filter_map(|output| output.lock_script.pay_to_pubkey_hash())
                .find(|hash| keys.find_by_hash160(hash).is_none());

            let total_out: Amount = tx.outputs.iter().map(|output| output.value).sum();
            let change_total: Amount = tx
                .outputs
                .iter()
                .filter_map(|output| {
                    let hash = output.lock_script.pay_to_pubkey_hash()?;
                    let key = keys.find_by_hash160(&hash)?;
                    if key.change {
                        Some(output.value)
                    } else {
                        None
                    }
                })
                .sum();

            report.send = Some(SendRow {
                norm_id,
                tx_hash,
                time: now - Duration::seconds(SEND_TIME_SHIFT_SECONDS),
                block_hash,
                address: destination.unwrap_or([0u8; 20]),
                value: total_out - change_total,
                fee: spent_value - total_out,
                deleted: false,
                tx_bytes: tx.bitcoin_serialize_to_vec().map_err(|error| {
                    WalletError::Serialization(error.into())
                })?,
            });
        }

        for row in &report.received {
            self.store.store_receive(row)?;
        }
        if let Some(row) = &report.send {
            self.store.store_send(row)?;
        }
        if report.is_relevant() {
            info!(
                %tx_hash,
                outputs = report.received.len(),
                spent = spent_any,
                confirmed = !block_hash.is_zero(),
                "recorded wallet transaction"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyCrypter, KeyStore};
    use crate::sled_store::SledStore;
    use chrono::TimeZone;
    use kestrel_chain::block::merkle;
    use kestrel_chain::parameters::Network;
    use kestrel_chain::transaction::LockTime;
    use kestrel_chain::transparent::{self, OutPoint, Script};
    use kestrel_chain::work::CompactDifficulty;
    use tempdir::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<SledStore>,
        keys: Arc<RwLock<KeyStore>>,
        matcher: Matcher<SledStore>,
        crypter: KeyCrypter,
    }

    fn fixture() -> Fixture {
        kestrel_test::init();
        let dir = TempDir::new("kestrel-matcher-test").unwrap();
        let store = Arc::new(SledStore::open(dir.path(), Network::Mainnet).unwrap());
        let keys = Arc::new(RwLock::new(KeyStore::load(store.as_ref()).unwrap()));
        let matcher = Matcher::new(store.clone(), keys.clone());
        Fixture {
            _dir: dir,
            store,
            keys,
            matcher,
            crypter: KeyCrypter::from_passphrase("test"),
        }
    }

    fn import(fixture: &Fixture, secret: u8, change: bool) -> [u8; 20] {
        let mut keys = fixture.keys.write().unwrap();
        let entry = keys
            .import_secret(
                fixture.store.as_ref(),
                &[secret; 32],
                Utc.timestamp_opt(1_300_000_000, 0).single().unwrap(),
                "",
                change,
                &fixture.crypter,
            )
            .unwrap();
        entry.hash160()
    }

    fn pay_to(hash: [u8; 20], value: i64) -> transparent::Output {
        transparent::Output {
            value: Amount(value),
            lock_script: Script::new_pay_to_pubkey_hash(&hash),
        }
    }

    fn spend(outpoint: OutPoint) -> transparent::Input {
        transparent::Input::PrevOut {
            outpoint,
            unlock_script: Script(vec![0xAA; 40]),
            sequence: u32::MAX,
        }
    }

    fn incoming_payment(to: [u8; 20], value: i64) -> Transaction {
        Transaction::new(
            1,
            vec![spend(OutPoint {
                hash: transaction::Hash([0xEE; 32]),
                index: 0,
            })],
            vec![pay_to(to, value)],
            LockTime::unlocked(),
        )
    }

    #[test]
    fn outputs_paying_our_keys_become_receive_rows() {
        let fixture = fixture();
        let ours = import(&fixture, 1, false);

        let tx = incoming_payment(ours, 70_000);
        let report = fixture.matcher.process_transaction(&tx).unwrap();
        assert_eq!(report.received.len(), 1);
        assert!(report.send.is_none());

        let row = fixture.store.get_receive(tx.hash(), 0).unwrap().unwrap();
        assert_eq!(row.value, Amount(70_000));
        assert_eq!(row.address, ours);
        assert!(row.block_hash.is_zero());
        assert!(!row.change && !row.coinbase && !row.spent);

        // A second delivery of the same transaction is a no-op.
        let replay = fixture.matcher.process_transaction(&tx).unwrap();
        assert!(!replay.is_relevant());
    }

    #[test]
    fn unrelated_transactions_are_ignored() {
        let fixture = fixture();
        import(&fixture, 1, false);

        let tx = incoming_payment([0x55; 20], 70_000);
        let report = fixture.matcher.process_transaction(&tx).unwrap();
        assert!(!report.is_relevant());
        assert!(fixture.store.get_receive(tx.hash(), 0).unwrap().is_none());
    }

    #[test]
    fn spends_mark_rows_and_build_a_send_row() {
        let fixture = fixture();
        let ours = import(&fixture, 1, false);
        let change = import(&fixture, 2, true);

        let funding = incoming_payment(ours, 100_000);
        fixture.matcher.process_transaction(&funding).unwrap();

        // Spend our 100k: 60k to a stranger, 30k change back, 10k fee.
        let stranger = [0x77; 20];
        let payment = Transaction::new(
            1,
            vec![spend(OutPoint {
                hash: funding.hash(),
                index: 0,
            })],
            vec![pay_to(stranger, 60_000), pay_to(change, 30_000)],
            LockTime::unlocked(),
        );
        let report = fixture.matcher.process_transaction(&payment).unwrap();

        let send = report.send.expect("a send row is materialized");
        assert_eq!(send.address, stranger);
        assert_eq!(send.value, Amount(60_000));
        assert_eq!(send.fee, Amount(10_000));

        // The spent row is flagged, and the change output came back as a
        // change-marked receive row.
        let spent_row = fixture.store.get_receive(funding.hash(), 0).unwrap().unwrap();
        assert!(spent_row.spent);
        let change_row = fixture.store.get_receive(payment.hash(), 1).unwrap().unwrap();
        assert!(change_row.change);
    }

    #[test]
    fn self_send_is_backdated_fifteen_seconds() {
        let fixture = fixture();
        let ours = import(&fixture, 1, false);

        let funding = incoming_payment(ours, 100_000);
        fixture.matcher.process_transaction(&funding).unwrap();

        // Pay ourselves, fee 10000.
        let self_send = Transaction::new(
            1,
            vec![spend(OutPoint {
                hash: funding.hash(),
                index: 0,
            })],
            vec![pay_to(ours, 90_000)],
            LockTime::unlocked(),
        );
        fixture.matcher.process_transaction(&self_send).unwrap();

        let sends = fixture.store.get_send_list().unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].fee, Amount(10_000));
        // No foreign destination exists.
        assert_eq!(sends[0].address, [0u8; 20]);

        let receive = fixture
            .store
            .get_receive(self_send.hash(), 0)
            .unwrap()
            .unwrap();
        assert_eq!(
            receive.time - sends[0].time,
            Duration::seconds(SEND_TIME_SHIFT_SECONDS)
        );
    }

    #[test]
    fn merkle_blocks_verify_and_associate() {
        let fixture = fixture();
        let ours = import(&fixture, 1, false);

        let tx = incoming_payment(ours, 50_000);
        let tx_hash = tx.hash();

        // A single-transaction block: the root is the txid itself.
        let header = Header::new(
            1,
            block::Hash([0x11; 32]),
            merkle::Root(tx_hash.0),
            Utc.timestamp_opt(1_300_000_600, 0).single().unwrap(),
            CompactDifficulty(0x1d00ffff),
            7,
        );
        let matched = fixture
            .matcher
            .process_merkle_block(&header, 1, vec![tx_hash], vec![0x01])
            .unwrap();
        assert_eq!(matched, vec![tx_hash]);

        // The transaction that follows lands confirmed in that block.
        fixture.matcher.process_transaction(&tx).unwrap();
        let row = fixture.store.get_receive(tx_hash, 0).unwrap().unwrap();
        assert_eq!(row.block_hash, header.hash());
    }

    #[test]
    fn bad_merkle_roots_are_rejected() {
        let fixture = fixture();

        let header = Header::new(
            1,
            block::Hash([0x11; 32]),
            merkle::Root([0xFF; 32]),
            Utc.timestamp_opt(1_300_000_600, 0).single().unwrap(),
            CompactDifficulty(0x1d00ffff),
            7,
        );
        let error = fixture
            .matcher
            .process_merkle_block(&header, 1, vec![transaction::Hash([0x22; 32])], vec![0x01])
            .unwrap_err();
        assert!(matches!(
            error,
            WalletError::Verification(VerificationError {
                reason: InvalidReason::BadMerkleRoot,
                ..
            })
        ));
    }

    #[test]
    fn coinbase_outputs_are_flagged() {
        let fixture = fixture();
        let ours = import(&fixture, 1, false);

        let coinbase = Transaction::new(
            1,
            vec![transparent::Input::Coinbase {
                data: transparent::CoinbaseData(vec![0x03, 0x01, 0x02, 0x03]),
                sequence: u32::MAX,
            }],
            vec![pay_to(ours, 50 * 100_000_000)],
            LockTime::unlocked(),
        );
        let report = fixture.matcher.process_transaction(&coinbase).unwrap();
        assert!(report.received[0].coinbase);
    }
}
