//! The header-chain engine: chain extension, reorgs at a junction block,
//! checkpoint enforcement, and the chain-work tie-break.
//!
//! Headers may arrive in any order, from any peer. Correctness never depends
//! on arrival order: each accepted header is connected to its junction with
//! the active chain, its cumulative work recomputed from there, and the
//! active chain swaps only on a strict work improvement.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use kestrel_chain::{
    block::{self, Height},
    parameters::{self, Network},
    transaction,
};

use crate::error::{InvalidReason, StoreError, VerificationError, WalletError};
use crate::records::{ChainHead, HeaderEntry};
use crate::store::WalletStore;

/// What accepting one header did to the active chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// The chain head moved. `connected` lists the newly on-chain block
    /// hashes, oldest first; each deserves a chain-extended event.
    Extended {
        head: ChainHead,
        connected: Vec<block::Hash>,
    },
    /// The header was stored on a side chain; the active chain is unchanged.
    SideChain,
    /// The header was already stored. Its matched list was refreshed if one
    /// was supplied.
    AlreadyKnown,
    /// The header's ancestry is incomplete. Fetch the named block and retry;
    /// the header itself is stored and will be picked up through the child
    /// index.
    MissingPredecessor(block::Hash),
}

/// The header-chain engine over a wallet store.
pub struct HeaderChain<S> {
    store: Arc<S>,
    checkpoints: HashMap<Height, block::Hash>,
}

impl<S: WalletStore> HeaderChain<S> {
    pub fn new(store: Arc<S>, network: Network) -> HeaderChain<S> {
        Self::with_checkpoints(store, parameters::checkpoints(network))
    }

    /// An engine with an explicit checkpoint table, for networks (and tests)
    /// that need their own.
    pub fn with_checkpoints(
        store: Arc<S>,
        checkpoints: Vec<(Height, block::Hash)>,
    ) -> HeaderChain<S> {
        HeaderChain {
            store,
            checkpoints: checkpoints.into_iter().collect(),
        }
    }

    /// Accept one header, with the transactions SPV filtering matched in its
    /// block (empty when the header came bare).
    pub fn accept_header(
        &self,
        header: &block::Header,
        matched: &[transaction::Hash],
    ) -> Result<AcceptOutcome, WalletError> {
        let hash = header.hash();

        // A header we already hold on the active chain is a no-op apart from
        // refreshing its matched list. One stored off-chain falls through:
        // the ancestry that blocked it may have arrived since.
        let stored = self.store.get_header(hash)?;
        let tip_matched = match &stored {
            Some(entry) => {
                if !matched.is_empty() {
                    self.store.update_matched(hash, matched)?;
                }
                if entry.on_chain {
                    return Ok(AcceptOutcome::AlreadyKnown);
                }
                if matched.is_empty() {
                    entry.matched.clone()
                } else {
                    matched.to_vec()
                }
            }
            None => {
                if header.time_is_valid_at(Utc::now()).is_err() {
                    return Err(VerificationError {
                        reason: InvalidReason::TimeDrift,
                        hash: Some(hash.0),
                    }
                    .into());
                }
                matched.to_vec()
            }
        };

        // Find the junction by walking the stored ancestry of the parent.
        let parent_path = match self.store.get_junction(header.previous_block_hash) {
            Ok(path) => path,
            Err(StoreError::BlockNotFound(missing)) => {
                // Store the header so the child index can resume from it once
                // the gap is filled, and ask the caller to fetch the gap.
                if stored.is_none() {
                    self.store
                        .put_header(&HeaderEntry::detached(*header, tip_matched))?;
                }
                debug!(%hash, %missing, "header has no stored ancestry yet");
                return Ok(AcceptOutcome::MissingPredecessor(missing));
            }
            Err(error) => return Err(error.into()),
        };

        // Recompute height and cumulative work upward from the junction.
        let mut path = parent_path;
        path.push(HeaderEntry::detached(*header, tip_matched.clone()));
        let mut height = path[0].height;
        let mut chain_work = path[0].chain_work;
        for entry in path[1..].iter_mut() {
            height = Height(height.0 + 1);
            let block_work = entry.header.block_work().ok_or(VerificationError {
                reason: InvalidReason::BadDifficulty,
                hash: Some(entry.hash().0),
            })?;
            chain_work += block_work;
            entry.height = height;
            entry.chain_work = chain_work;
            entry.on_chain = true;
        }

        // Checkpoint enforcement, before anything is written.
        for entry in &path[1..] {
            if let Some(expected) = self.checkpoints.get(&entry.height) {
                if *expected != entry.hash() {
                    info!(height = entry.height.0, hash = %entry.hash(),
                          "header chain contradicts a checkpoint");
                    return Err(VerificationError {
                        reason: InvalidReason::Checkpoint,
                        hash: Some(entry.hash().0),
                    }
                    .into());
                }
            }
        }

        if stored.is_none() {
            self.store
                .put_header(&HeaderEntry::detached(*header, tip_matched))?;
        }

        let head = self.store.chain_head()?;
        // A tie keeps the current chain.
        if chain_work > head.chain_work {
            self.store.set_chain_head(&path)?;
            let connected = path[1..].iter().map(|entry| entry.hash()).collect();
            let head = self.store.chain_head()?;
            info!(height = head.height.0, hash = %head.hash, "chain head advanced");
            Ok(AcceptOutcome::Extended { head, connected })
        } else {
            debug!(%hash, "header extends a side chain");
            Ok(AcceptOutcome::SideChain)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ReceiveRow;
    use crate::sled_store::SledStore;
    use chrono::{TimeZone, Utc};
    use kestrel_chain::amount::Amount;
    use kestrel_chain::block::merkle;
    use kestrel_chain::transaction::NormalizedId;
    use kestrel_chain::transparent::Script;
    use kestrel_chain::work::{CompactDifficulty, Work};
    use tempdir::TempDir;

    fn engine() -> (TempDir, Arc<SledStore>, HeaderChain<SledStore>) {
        kestrel_test::init();
        let dir = TempDir::new("kestrel-chain-test").unwrap();
        let store = Arc::new(SledStore::open(dir.path(), Network::Mainnet).unwrap());
        let chain = HeaderChain::with_checkpoints(store.clone(), Vec::new());
        (dir, store, chain)
    }

    fn child_header(parent: block::Hash, nonce: u32) -> block::Header {
        block::Header::new(
            1,
            parent,
            merkle::Root([nonce as u8; 32]),
            Utc.timestamp_opt(1_300_000_000 + nonce as i64 * 600, 0)
                .single()
                .unwrap(),
            CompactDifficulty(0x1d00ffff),
            nonce,
        )
    }

    fn receive_row_in(block_hash: block::Hash, tx_hash: transaction::Hash) -> ReceiveRow {
        ReceiveRow {
            norm_id: NormalizedId(tx_hash.0),
            tx_hash,
            output_index: 0,
            time: Utc.timestamp_opt(1_300_000_000, 0).single().unwrap(),
            block_hash,
            address: [9u8; 20],
            value: Amount(5_000),
            script_bytes: Script::new_pay_to_pubkey_hash(&[9u8; 20]),
            spent: false,
            change: false,
            coinbase: false,
            in_safe: false,
            deleted: false,
        }
    }

    #[test]
    fn cold_start_extends_from_genesis() {
        let (_dir, store, chain) = engine();
        let block_work = CompactDifficulty(0x1d00ffff).block_work().unwrap();

        let mut parent = store.chain_head().unwrap().hash;
        for nonce in 1..=5u32 {
            let header = child_header(parent, nonce);
            match chain.accept_header(&header, &[]).unwrap() {
                AcceptOutcome::Extended { head, connected } => {
                    assert_eq!(head.height, Height(nonce));
                    assert_eq!(connected, vec![header.hash()]);
                }
                other => panic!("expected extension, got {:?}", other),
            }
            parent = header.hash();
        }

        let head = store.chain_head().unwrap();
        assert_eq!(head.height, Height(5));
        // Chain work is the sum of block works plus the genesis quirk of 1.
        let mut expected = Work::genesis();
        for _ in 0..5 {
            expected += block_work;
        }
        assert_eq!(head.chain_work, expected);
    }

    #[test]
    fn out_of_order_headers_converge_to_the_same_chain() {
        let (_dir, store, chain) = engine();

        let genesis = store.chain_head().unwrap().hash;
        let a = child_header(genesis, 1);
        let b = child_header(a.hash(), 2);
        let c = child_header(b.hash(), 3);

        // The child arrives before its parent: stored, reported missing.
        assert_eq!(
            chain.accept_header(&b, &[]).unwrap(),
            AcceptOutcome::MissingPredecessor(a.hash())
        );
        assert_eq!(
            chain.accept_header(&c, &[]).unwrap(),
            AcceptOutcome::MissingPredecessor(a.hash())
        );

        // Filling the gap connects A; B and C are resumed via the child
        // index, exactly as the worker drives it.
        match chain.accept_header(&a, &[]).unwrap() {
            AcceptOutcome::Extended { head, .. } => assert_eq!(head.height, Height(1)),
            other => panic!("expected extension, got {:?}", other),
        }
        let mut cursor = a.hash();
        while let Some(child) = store.get_child_of(cursor).unwrap() {
            let entry = store.get_header(child).unwrap().unwrap();
            chain.accept_header(&entry.header, &[]).unwrap();
            cursor = child;
        }

        let head = store.chain_head().unwrap();
        assert_eq!(head.height, Height(3));
        assert_eq!(head.hash, c.hash());
    }

    #[test]
    fn one_block_reorg_moves_rows_between_chains() {
        let (_dir, store, chain) = engine();

        let genesis = store.chain_head().unwrap().hash;
        let a = child_header(genesis, 1);
        let b = child_header(a.hash(), 2);
        let b_prime = child_header(a.hash(), 102);
        let c_prime = child_header(b_prime.hash(), 103);

        let tx_in_b = transaction::Hash([0xB0; 32]);
        let tx_in_b_prime = transaction::Hash([0xB1; 32]);

        chain.accept_header(&a, &[]).unwrap();
        chain.accept_header(&b, &[tx_in_b]).unwrap();
        store
            .store_receive(&receive_row_in(b.hash(), tx_in_b))
            .unwrap();

        // The competing branch: same work at B', decisive at C'.
        assert_eq!(
            chain.accept_header(&b_prime, &[tx_in_b_prime]).unwrap(),
            AcceptOutcome::SideChain
        );
        store
            .store_receive(&receive_row_in(block::Hash::zero(), tx_in_b_prime))
            .unwrap();

        match chain.accept_header(&c_prime, &[]).unwrap() {
            AcceptOutcome::Extended { head, connected } => {
                assert_eq!(head.height, Height(3));
                assert_eq!(head.hash, c_prime.hash());
                assert_eq!(connected, vec![b_prime.hash(), c_prime.hash()]);
            }
            other => panic!("expected a reorg, got {:?}", other),
        }

        // On-chain set is now {G, A, B', C'}; B survives off-chain with a
        // cleared height.
        let b_entry = store.get_header(b.hash()).unwrap().unwrap();
        assert!(!b_entry.on_chain);
        assert_eq!(b_entry.height, Height(0));
        let b_prime_entry = store.get_header(b_prime.hash()).unwrap().unwrap();
        assert!(b_prime_entry.on_chain);
        assert_eq!(b_prime_entry.height, Height(2));
        assert_eq!(
            store.get_block_at_height(Height(2)).unwrap().unwrap().hash(),
            b_prime.hash()
        );

        // Rows moved with their blocks.
        let unconfirmed = store.get_receive(tx_in_b, 0).unwrap().unwrap();
        assert!(unconfirmed.block_hash.is_zero());
        let confirmed = store.get_receive(tx_in_b_prime, 0).unwrap().unwrap();
        assert_eq!(confirmed.block_hash, b_prime.hash());
    }

    #[test]
    fn equal_work_keeps_the_current_chain() {
        let (_dir, store, chain) = engine();

        let genesis = store.chain_head().unwrap().hash;
        let a = child_header(genesis, 1);
        let a_prime = child_header(genesis, 201);

        chain.accept_header(&a, &[]).unwrap();
        assert_eq!(
            chain.accept_header(&a_prime, &[]).unwrap(),
            AcceptOutcome::SideChain
        );
        assert_eq!(store.chain_head().unwrap().hash, a.hash());
    }

    #[test]
    fn checkpoint_mismatch_rejects_the_swap_without_writes() {
        kestrel_test::init();
        let dir = TempDir::new("kestrel-chain-test").unwrap();
        let store = Arc::new(SledStore::open(dir.path(), Network::Mainnet).unwrap());

        let genesis = store.chain_head().unwrap().hash;
        let a = child_header(genesis, 1);
        let b = child_header(a.hash(), 2);

        // Checkpoint height 2 at a hash the chain will not produce.
        let chain = HeaderChain::with_checkpoints(
            store.clone(),
            vec![(Height(2), block::Hash([0xAA; 32]))],
        );

        chain.accept_header(&a, &[]).unwrap();
        let head_before = store.chain_head().unwrap();

        let error = chain.accept_header(&b, &[]).unwrap_err();
        assert!(matches!(
            error,
            WalletError::Verification(VerificationError {
                reason: InvalidReason::Checkpoint,
                ..
            })
        ));

        // Nothing was written: the offending header is absent and the head
        // is unchanged.
        assert!(store.is_new_block(b.hash()).unwrap());
        assert_eq!(store.chain_head().unwrap(), head_before);
    }

    #[test]
    fn matching_checkpoints_pass() {
        kestrel_test::init();
        let dir = TempDir::new("kestrel-chain-test").unwrap();
        let store = Arc::new(SledStore::open(dir.path(), Network::Mainnet).unwrap());

        let genesis = store.chain_head().unwrap().hash;
        let a = child_header(genesis, 1);
        let chain =
            HeaderChain::with_checkpoints(store.clone(), vec![(Height(1), a.hash())]);

        assert!(matches!(
            chain.accept_header(&a, &[]).unwrap(),
            AcceptOutcome::Extended { .. }
        ));
    }
}
