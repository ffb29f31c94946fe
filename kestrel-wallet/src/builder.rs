//! Assembling and signing outgoing payments.
//!
//! Coin selection is deliberately simple: confirmed, spendable outputs,
//! oldest first, until the payment plus its explicit fee is covered. Change
//! goes to the wallet's single change key; sub-dust change is surrendered to
//! the fee.

use secp256k1::Message;
use tracing::info;

use kestrel_chain::{
    amount::{Amount, DUST_THRESHOLD},
    serialization::sha256d,
    transaction::{LockTime, Transaction},
    transparent::{Input, OutPoint, Output, Script},
    BitcoinSerialize,
};

use crate::error::{BuildError, KeyError, WalletError};
use crate::keys::{KeyCrypter, KeyStore};
use crate::records::ReceiveRow;
use crate::store::WalletStore;

/// Block rewards cannot be spent until this deep.
const COINBASE_MATURITY: u32 = 100;

/// The only signature hash type this wallet produces.
const SIGHASH_ALL: u32 = 1;

/// Build and sign a payment of `amount` to `to`, spending `fee` on top.
///
/// The caller broadcasts the result and records it through the matcher,
/// which marks the consumed rows spent and stores the send row.
pub fn build_payment<S: WalletStore>(
    store: &S,
    keys: &KeyStore,
    crypter: &KeyCrypter,
    to: [u8; 20],
    amount: Amount,
    fee: Amount,
) -> Result<Transaction, WalletError> {
    if amount <= DUST_THRESHOLD {
        return Err(BuildError::Dust.into());
    }
    let needed = amount + fee;
    let selected = select_outputs(store, needed)?;
    let total: Amount = selected.iter().map(|row| row.value).sum();

    let mut outputs = vec![Output {
        value: amount,
        lock_script: Script::new_pay_to_pubkey_hash(&to),
    }];
    let change_value = total - needed;
    if change_value > DUST_THRESHOLD {
        let change_key = keys.change_key().ok_or(BuildError::NoChangeKey)?;
        outputs.push(Output {
            value: change_value,
            lock_script: Script::new_pay_to_pubkey_hash(&change_key.hash160()),
        });
    }
    // Sub-dust change is left to the miners.

    let inputs: Vec<Input> = selected
        .iter()
        .map(|row| Input::PrevOut {
            outpoint: OutPoint {
                hash: row.tx_hash,
                index: row.output_index,
            },
            unlock_script: Script::default(),
            sequence: u32::MAX,
        })
        .collect();
    let mut tx = Transaction::new(1, inputs, outputs, LockTime::unlocked());

    for (index, row) in selected.iter().enumerate() {
        let key_entry = keys
            .find_by_hash160(&row.address)
            .ok_or(BuildError::MissingKey)?;
        let secret = keys.decrypt_secret(key_entry, crypter)?;

        let digest = signature_hash(&tx, index, &row.script_bytes)?;
        let message = Message::from_slice(&digest).map_err(KeyError::Secp)?;
        let signature = keys.secp().sign_ecdsa(&message, &secret);

        let mut signature_bytes = signature.serialize_der().to_vec();
        signature_bytes.push(SIGHASH_ALL as u8);
        if let Input::PrevOut { unlock_script, .. } = &mut tx.inputs[index] {
            *unlock_script = Script::new_pubkey_hash_unlock(&signature_bytes, &key_entry.pub_key);
        }
    }

    info!(
        tx_hash = %tx.hash(),
        inputs = selected.len(),
        %amount,
        %fee,
        "built payment"
    );
    Ok(tx)
}

/// Confirmed, mature, spendable rows, oldest first, until `needed` is
/// covered.
fn select_outputs<S: WalletStore>(
    store: &S,
    needed: Amount,
) -> Result<Vec<ReceiveRow>, WalletError> {
    let mut spendable = Vec::new();
    for row in store.get_receive_list()? {
        if row.spent || row.in_safe || row.deleted {
            continue;
        }
        let depth = store.tx_depth(row.tx_hash)?;
        if depth == 0 {
            continue;
        }
        if row.coinbase && depth < COINBASE_MATURITY {
            continue;
        }
        spendable.push(row);
    }
    spendable.sort_by_key(|row| row.time);

    let mut selected = Vec::new();
    let mut total = Amount::zero();
    for row in spendable {
        if total >= needed {
            break;
        }
        total = total + row.value;
        selected.push(row);
    }
    if total < needed {
        return Err(BuildError::InsufficientFunds {
            available: total,
            needed,
        }
        .into());
    }
    Ok(selected)
}

/// The SIGHASH_ALL digest for one input: the transaction with every
/// signature script blanked except the signed input, which carries the
/// previous output's lock script, followed by the hash type.
fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    prev_lock_script: &Script,
) -> Result<[u8; 32], WalletError> {
    let inputs = tx
        .inputs
        .iter()
        .enumerate()
        .map(|(index, input)| match input {
            Input::PrevOut {
                outpoint, sequence, ..
            } => Input::PrevOut {
                outpoint: *outpoint,
                unlock_script: if index == input_index {
                    prev_lock_script.clone()
                } else {
                    Script::default()
                },
                sequence: *sequence,
            },
            other => other.clone(),
        })
        .collect();
    let copy = Transaction::new(tx.version, inputs, tx.outputs.clone(), tx.lock_time);

    let mut writer = sha256d::Writer::default();
    copy.bitcoin_serialize(&mut writer)
        .map_err(|error| WalletError::Serialization(error.into()))?;
    SIGHASH_ALL
        .bitcoin_serialize(&mut writer)
        .map_err(|error| WalletError::Serialization(error.into()))?;
    Ok(writer.finish())
}

/// Confirmed and pending balances, from the deduplicated row lists.
pub fn balances<S: WalletStore>(store: &S) -> Result<(Amount, Amount), WalletError> {
    let mut confirmed = Amount::zero();
    let mut pending = Amount::zero();
    for row in store.get_receive_list()? {
        if row.spent || row.deleted {
            continue;
        }
        if store.tx_depth(row.tx_hash)? > 0 {
            confirmed = confirmed + row.value;
        } else {
            pending = pending + row.value;
        }
    }
    Ok((confirmed, pending))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::HeaderChain;
    use crate::keys::KeyStore;
    use crate::matcher::Matcher;
    use crate::sled_store::SledStore;
    use chrono::{TimeZone, Utc};
    use kestrel_chain::block::{merkle, Header};
    use kestrel_chain::parameters::Network;
    use kestrel_chain::transaction;
    use kestrel_chain::work::CompactDifficulty;
    use std::sync::{Arc, RwLock};
    use tempdir::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<SledStore>,
        keys: Arc<RwLock<KeyStore>>,
        matcher: Matcher<SledStore>,
        chain: HeaderChain<SledStore>,
        crypter: KeyCrypter,
    }

    fn fixture() -> Fixture {
        kestrel_test::init();
        let dir = TempDir::new("kestrel-builder-test").unwrap();
        let store = Arc::new(SledStore::open(dir.path(), Network::Mainnet).unwrap());
        let keys = Arc::new(RwLock::new(KeyStore::load(store.as_ref()).unwrap()));
        let matcher = Matcher::new(store.clone(), keys.clone());
        let chain = HeaderChain::with_checkpoints(store.clone(), Vec::new());
        Fixture {
            _dir: dir,
            store,
            keys,
            matcher,
            chain,
            crypter: KeyCrypter::from_passphrase("test"),
        }
    }

    /// Fund the wallet with a confirmed 100k-satoshi output and return its
    /// paying address.
    fn fund(fixture: &Fixture) -> [u8; 20] {
        let ours = {
            let mut keys = fixture.keys.write().unwrap();
            keys.import_secret(
                fixture.store.as_ref(),
                &[1u8; 32],
                Utc.timestamp_opt(1_300_000_000, 0).single().unwrap(),
                "",
                false,
                &fixture.crypter,
            )
            .unwrap()
            .hash160()
        };
        {
            let mut keys = fixture.keys.write().unwrap();
            keys.import_secret(
                fixture.store.as_ref(),
                &[2u8; 32],
                Utc.timestamp_opt(1_300_000_000, 0).single().unwrap(),
                "",
                true,
                &fixture.crypter,
            )
            .unwrap();
        }

        let funding = Transaction::new(
            1,
            vec![Input::PrevOut {
                outpoint: OutPoint {
                    hash: transaction::Hash([0xEE; 32]),
                    index: 0,
                },
                unlock_script: Script(vec![0xAA; 40]),
                sequence: u32::MAX,
            }],
            vec![Output {
                value: Amount(100_000),
                lock_script: Script::new_pay_to_pubkey_hash(&ours),
            }],
            LockTime::unlocked(),
        );
        let tx_hash = funding.hash();

        // Confirm it in block 1.
        let genesis = fixture.store.chain_head().unwrap().hash;
        let header = Header::new(
            1,
            genesis,
            merkle::Root(tx_hash.0),
            Utc.timestamp_opt(1_300_000_600, 0).single().unwrap(),
            CompactDifficulty(0x1d00ffff),
            1,
        );
        fixture
            .matcher
            .process_merkle_block(&header, 1, vec![tx_hash], vec![0x01])
            .unwrap();
        fixture.matcher.process_transaction(&funding).unwrap();
        fixture.chain.accept_header(&header, &[tx_hash]).unwrap();
        assert_eq!(fixture.store.tx_depth(tx_hash).unwrap(), 1);

        ours
    }

    #[test]
    fn builds_a_signed_payment_with_change() {
        let fixture = fixture();
        fund(&fixture);

        let keys = fixture.keys.read().unwrap();
        let tx = build_payment(
            fixture.store.as_ref(),
            &keys,
            &fixture.crypter,
            [0x77; 20],
            Amount(60_000),
            Amount(10_000),
        )
        .unwrap();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].value, Amount(60_000));
        assert_eq!(
            tx.outputs[0].lock_script.pay_to_pubkey_hash(),
            Some([0x77; 20])
        );
        // 100k - 60k - 10k fee.
        assert_eq!(tx.outputs[1].value, Amount(30_000));
        let change_key = keys.change_key().unwrap();
        assert_eq!(
            tx.outputs[1].lock_script.pay_to_pubkey_hash(),
            Some(change_key.hash160())
        );

        // The unlock script carries a DER signature plus hash type, then the
        // compressed public key.
        if let Input::PrevOut { unlock_script, .. } = &tx.inputs[0] {
            let bytes = &unlock_script.0;
            let signature_len = bytes[0] as usize;
            assert_eq!(bytes[signature_len], SIGHASH_ALL as u8);
            assert_eq!(bytes[1 + signature_len] as usize, 33);
            assert_eq!(bytes.len(), 2 + signature_len + 33);
        } else {
            panic!("expected a signed previous-output input");
        }
    }

    #[test]
    fn unconfirmed_and_safe_outputs_are_not_spent() {
        let fixture = fixture();
        let ours = fund(&fixture);

        // Park the only confirmed output in the safe.
        let rows = fixture.store.get_receive_list().unwrap();
        let ours_row = rows.iter().find(|row| row.address == ours).unwrap();
        fixture
            .store
            .set_receive_safe(ours_row.tx_hash, ours_row.output_index, true)
            .unwrap();

        let keys = fixture.keys.read().unwrap();
        let result = build_payment(
            fixture.store.as_ref(),
            &keys,
            &fixture.crypter,
            [0x77; 20],
            Amount(60_000),
            Amount(10_000),
        );
        assert!(matches!(
            result,
            Err(WalletError::Build(BuildError::InsufficientFunds { .. }))
        ));
    }

    #[test]
    fn balances_split_confirmed_and_pending() {
        let fixture = fixture();
        let ours = fund(&fixture);

        // An unconfirmed second payment.
        let pending_tx = Transaction::new(
            1,
            vec![Input::PrevOut {
                outpoint: OutPoint {
                    hash: transaction::Hash([0xDD; 32]),
                    index: 0,
                },
                unlock_script: Script(vec![0xBB; 40]),
                sequence: u32::MAX,
            }],
            vec![Output {
                value: Amount(25_000),
                lock_script: Script::new_pay_to_pubkey_hash(&ours),
            }],
            LockTime::unlocked(),
        );
        fixture.matcher.process_transaction(&pending_tx).unwrap();

        let (confirmed, pending) = balances(fixture.store.as_ref()).unwrap();
        assert_eq!(confirmed, Amount(100_000));
        assert_eq!(pending, Amount(25_000));
    }
}
