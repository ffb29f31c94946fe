use proptest::prelude::*;

use crate::amount::Amount;
use crate::serialization::{BitcoinDeserializeInto, BitcoinSerialize};
use crate::transparent::{self, CoinbaseData, OutPoint, Script};

use super::*;

fn input_strategy() -> impl Strategy<Value = transparent::Input> {
    (
        any::<[u8; 32]>(),
        0u32..1000,
        proptest::collection::vec(any::<u8>(), 0..64),
        any::<u32>(),
    )
        .prop_map(|(hash, index, script, sequence)| transparent::Input::PrevOut {
            outpoint: OutPoint {
                hash: Hash(hash),
                index,
            },
            unlock_script: Script(script),
            sequence,
        })
}

fn output_strategy() -> impl Strategy<Value = transparent::Output> {
    (0i64..21_000_000 * 100_000_000, any::<[u8; 20]>()).prop_map(|(value, hash)| {
        transparent::Output {
            value: Amount(value),
            lock_script: Script::new_pay_to_pubkey_hash(&hash),
        }
    })
}

fn transaction_strategy() -> impl Strategy<Value = Transaction> {
    (
        proptest::collection::vec(input_strategy(), 1..4),
        proptest::collection::vec(output_strategy(), 1..4),
    )
        .prop_map(|(inputs, outputs)| Transaction::new(1, inputs, outputs, LockTime::unlocked()))
}

proptest! {
    #[test]
    fn transaction_roundtrip(tx in transaction_strategy()) {
        kestrel_test::init();

        let bytes = tx.bitcoin_serialize_to_vec()?;
        prop_assert_eq!(bytes.len(), tx.len());
        let other_tx: Transaction = bytes.as_slice().bitcoin_deserialize_into()?;

        prop_assert_eq![tx, other_tx];
    }

    #[test]
    fn deserialization_caches_the_txid(tx in transaction_strategy()) {
        kestrel_test::init();

        let bytes = tx.bitcoin_serialize_to_vec()?;
        let parsed: Transaction = bytes.as_slice().bitcoin_deserialize_into()?;
        prop_assert_eq!(parsed.hash(), tx.hash());
    }

    #[test]
    fn normalized_id_ignores_signature_scripts(tx in transaction_strategy()) {
        kestrel_test::init();

        // Rewrite every signature script, as a malleating relay would.
        let mut malleated = tx.clone();
        for input in malleated.inputs.iter_mut() {
            if let transparent::Input::PrevOut { unlock_script, .. } = input {
                *unlock_script = Script(vec![0xde, 0xad, 0xbe, 0xef]);
            }
        }

        prop_assert_eq!(tx.normalized_id(), malleated.normalized_id());
        // The txid does move when a script changes.
        let scripts_changed = tx.inputs.iter().any(|input| match input {
            transparent::Input::PrevOut { unlock_script, .. } => {
                unlock_script.0 != vec![0xde, 0xad, 0xbe, 0xef]
            }
            transparent::Input::Coinbase { .. } => false,
        });
        if scripts_changed {
            prop_assert_ne!(tx.hash(), malleated.hash());
        }
    }
}

#[test]
fn coinbase_input_roundtrip() {
    kestrel_test::init();

    let tx = Transaction::new(
        1,
        vec![transparent::Input::Coinbase {
            data: CoinbaseData(b"kestrel was here".to_vec()),
            sequence: u32::MAX,
        }],
        vec![transparent::Output {
            value: Amount(50 * 100_000_000),
            lock_script: Script::new_pay_to_pubkey_hash(&[9u8; 20]),
        }],
        LockTime::unlocked(),
    );
    assert!(tx.is_coinbase());

    let bytes = tx.bitcoin_serialize_to_vec().unwrap();
    let parsed: Transaction = bytes.as_slice().bitcoin_deserialize_into().unwrap();
    assert!(parsed.is_coinbase());
    assert_eq!(tx, parsed);
}
