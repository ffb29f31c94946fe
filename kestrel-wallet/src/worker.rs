//! The wallet worker: the single task allowed to drive the store.
//!
//! The network layer queues headers, merkle blocks, and transactions here;
//! the worker runs them through the chain and matching engines and emits
//! events the node reacts to (chain growth, filter reloads, blocks to
//! fetch). Errors are logged and surfaced as events where actionable; they
//! never cross the loop boundary.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kestrel_chain::{
    block::{self, Height},
    parameters::Network,
    transaction::{self, Transaction},
};

use crate::bloom::FilterLoad;
use crate::chain::{AcceptOutcome, HeaderChain};
use crate::error::WalletError;
use crate::keys::{KeyCrypter, KeyStore};
use crate::matcher::Matcher;
use crate::store::WalletStore;

/// Work queued for the wallet worker.
#[derive(Debug)]
pub enum WalletTask {
    /// A bare header from a `headers` message.
    Header(block::Header),
    /// A `merkleblock`, already framed into chain types.
    MerkleBlock {
        header: block::Header,
        transaction_count: u32,
        hashes: Vec<transaction::Hash>,
        flags: Vec<u8>,
    },
    /// A transaction from the network.
    Transaction(Arc<Transaction>),
    /// A transaction this wallet built and is broadcasting; recorded the
    /// same way an incoming one would be.
    Broadcast(Arc<Transaction>),
    /// Import a private key.
    ImportKey {
        secret: [u8; 32],
        creation_time: DateTime<Utc>,
        label: String,
        change: bool,
    },
    /// Begin a rescan from the earliest key creation time.
    StartRescan,
}

/// Events the worker emits for the node to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    /// A block joined the active chain.
    ChainExtended { hash: block::Hash, height: Height },
    /// The key set changed; load this filter into every ready peer.
    FilterChanged(FilterLoad),
    /// A header arrived whose ancestry is missing this block; fetch it as a
    /// filtered block.
    MissingBlock(block::Hash),
    /// The rescan wants this block fetched as a filtered block.
    RescanBlock(block::Hash),
    /// Receive or send rows changed.
    RowsChanged,
}

/// The wallet worker and the engines it drives.
pub struct WalletWorker<S> {
    store: Arc<S>,
    chain: HeaderChain<S>,
    matcher: Matcher<S>,
    keys: Arc<RwLock<KeyStore>>,
    crypter: KeyCrypter,
    events: mpsc::UnboundedSender<WalletEvent>,
    /// Mirrors the chain head height for `version` messages.
    local_height: Arc<AtomicU32>,
    rescan_height: Option<Height>,
    /// The filter tweak, fixed per run so reloads stay comparable.
    filter_tweak: u32,
}

impl<S: WalletStore> WalletWorker<S> {
    pub fn new(
        store: Arc<S>,
        network: Network,
        keys: Arc<RwLock<KeyStore>>,
        crypter: KeyCrypter,
        events: mpsc::UnboundedSender<WalletEvent>,
        local_height: Arc<AtomicU32>,
    ) -> WalletWorker<S> {
        if let Ok(head) = store.chain_head() {
            local_height.store(head.height.0, Ordering::Relaxed);
        }
        WalletWorker {
            chain: HeaderChain::new(store.clone(), network),
            matcher: Matcher::new(store.clone(), keys.clone()),
            store,
            keys,
            crypter,
            events,
            local_height,
            rescan_height: None,
            filter_tweak: rand::random(),
        }
    }

    /// The `filterload` for the current key set.
    pub fn current_filter(&self) -> FilterLoad {
        self.keys
            .read()
            .expect("key store lock poisoned")
            .build_filter(self.filter_tweak)
            .to_filterload()
    }

    /// Consume tasks until the channel closes, then flush the store.
    pub async fn run(mut self, mut tasks: mpsc::UnboundedReceiver<WalletTask>) {
        while let Some(task) = tasks.recv().await {
            if let Err(error) = self.handle(task) {
                warn!(%error, "wallet task failed");
            }
        }
        debug!("wallet task channel closed, worker exiting");
    }

    fn handle(&mut self, task: WalletTask) -> Result<(), WalletError> {
        match task {
            WalletTask::Header(header) => self.accept_and_resume(header, Vec::new()),
            WalletTask::MerkleBlock {
                header,
                transaction_count,
                hashes,
                flags,
            } => {
                let matched =
                    self.matcher
                        .process_merkle_block(&header, transaction_count, hashes, flags)?;
                self.accept_and_resume(header, matched)
            }
            WalletTask::Transaction(tx) | WalletTask::Broadcast(tx) => {
                let report = self.matcher.process_transaction(&tx)?;
                if report.is_relevant() {
                    let _ = self.events.send(WalletEvent::RowsChanged);
                }
                Ok(())
            }
            WalletTask::ImportKey {
                secret,
                creation_time,
                label,
                change,
            } => {
                {
                    let mut keys = self.keys.write().expect("key store lock poisoned");
                    keys.import_secret(
                        self.store.as_ref(),
                        &secret,
                        creation_time,
                        &label,
                        change,
                        &self.crypter,
                    )?;
                }
                let _ = self
                    .events
                    .send(WalletEvent::FilterChanged(self.current_filter()));
                self.start_rescan()
            }
            WalletTask::StartRescan => self.start_rescan(),
        }
    }

    /// Run a header through the chain engine, then keep connecting stored
    /// children while the chain advances (resuming after out-of-order
    /// arrivals).
    fn accept_and_resume(
        &mut self,
        header: block::Header,
        matched: Vec<transaction::Hash>,
    ) -> Result<(), WalletError> {
        let mut next = Some((header, matched));
        while let Some((header, matched)) = next.take() {
            match self.chain.accept_header(&header, &matched)? {
                AcceptOutcome::Extended { head, connected } => {
                    self.local_height.store(head.height.0, Ordering::Relaxed);
                    for hash in connected {
                        let height = self
                            .store
                            .get_header(hash)?
                            .map(|entry| entry.height)
                            .unwrap_or(Height(0));
                        let _ = self
                            .events
                            .send(WalletEvent::ChainExtended { hash, height });
                    }
                    // Resume a chain that stalled on this gap.
                    if let Some(child) = self.store.get_child_of(head.hash)? {
                        if let Some(entry) = self.store.get_header(child)? {
                            if !entry.on_chain {
                                next = Some((entry.header, entry.matched));
                            }
                        }
                    }
                }
                AcceptOutcome::MissingPredecessor(missing) => {
                    let _ = self.events.send(WalletEvent::MissingBlock(missing));
                }
                AcceptOutcome::AlreadyKnown => self.advance_rescan()?,
                AcceptOutcome::SideChain => {}
            }
        }
        Ok(())
    }

    /// Kick off a rescan from the earliest key creation time.
    fn start_rescan(&mut self) -> Result<(), WalletError> {
        let floor_time = match self
            .keys
            .read()
            .expect("key store lock poisoned")
            .earliest_creation_time()
        {
            Some(time) => time,
            None => return Ok(()),
        };
        let floor = self.store.rescan_height(floor_time)?;
        info!(height = floor.0, "starting rescan");
        self.rescan_height = Some(floor);
        if let Some(entry) = self.store.get_block_at_height(floor)? {
            let _ = self.events.send(WalletEvent::RescanBlock(entry.hash()));
        }
        Ok(())
    }

    /// The already-present branch of the header handler: during a rescan,
    /// each re-delivered block advances the scan height by one until it
    /// passes the chain head.
    fn advance_rescan(&mut self) -> Result<(), WalletError> {
        let current = match self.rescan_height {
            Some(height) => height,
            None => return Ok(()),
        };
        let head = self.store.chain_head()?;
        let next = Height(current.0 + 1);
        if next > head.height {
            info!("rescan complete");
            self.rescan_height = None;
            return Ok(());
        }
        self.rescan_height = Some(next);
        if let Some(entry) = self.store.get_block_at_height(next)? {
            let _ = self.events.send(WalletEvent::RescanBlock(entry.hash()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sled_store::SledStore;
    use chrono::TimeZone;
    use kestrel_chain::block::{merkle, Header};
    use kestrel_chain::work::CompactDifficulty;
    use tempdir::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<SledStore>,
        worker: WalletWorker<SledStore>,
        events: mpsc::UnboundedReceiver<WalletEvent>,
        height: Arc<AtomicU32>,
    }

    fn fixture() -> Fixture {
        kestrel_test::init();
        let dir = TempDir::new("kestrel-worker-test").unwrap();
        let store = Arc::new(SledStore::open(dir.path(), Network::Mainnet).unwrap());
        let keys = Arc::new(RwLock::new(KeyStore::load(store.as_ref()).unwrap()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let height = Arc::new(AtomicU32::new(0));
        let worker = WalletWorker::new(
            store.clone(),
            Network::Mainnet,
            keys,
            KeyCrypter::from_passphrase("test"),
            events_tx,
            height.clone(),
        );
        Fixture {
            _dir: dir,
            store,
            worker,
            events: events_rx,
            height,
        }
    }

    fn child_header(parent: block::Hash, nonce: u32) -> Header {
        Header::new(
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

    #[test]
    fn headers_extend_the_chain_and_report_height() {
        let mut fixture = fixture();
        let genesis = fixture.store.chain_head().unwrap().hash;
        let a = child_header(genesis, 1);

        fixture.worker.handle(WalletTask::Header(a)).unwrap();
        assert_eq!(fixture.height.load(Ordering::Relaxed), 1);
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            WalletEvent::ChainExtended {
                hash: a.hash(),
                height: Height(1)
            }
        );
    }

    #[test]
    fn a_gap_is_reported_then_closed_by_the_child_index() {
        let mut fixture = fixture();
        let genesis = fixture.store.chain_head().unwrap().hash;
        let a = child_header(genesis, 1);
        let b = child_header(a.hash(), 2);

        // The child arrives first: the worker asks for the gap.
        fixture.worker.handle(WalletTask::Header(b)).unwrap();
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            WalletEvent::MissingBlock(a.hash())
        );

        // The gap closes; both blocks connect in one pass.
        fixture.worker.handle(WalletTask::Header(a)).unwrap();
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            WalletEvent::ChainExtended {
                hash: a.hash(),
                height: Height(1)
            }
        );
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            WalletEvent::ChainExtended {
                hash: b.hash(),
                height: Height(2)
            }
        );
        assert_eq!(fixture.height.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn importing_a_key_reloads_the_filter() {
        let mut fixture = fixture();
        fixture
            .worker
            .handle(WalletTask::ImportKey {
                secret: [9u8; 32],
                creation_time: Utc.timestamp_opt(1_300_000_000, 0).single().unwrap(),
                label: "imported".to_owned(),
                change: false,
            })
            .unwrap();

        match fixture.events.try_recv().unwrap() {
            WalletEvent::FilterChanged(load) => {
                assert!(!load.filter.is_empty());
                assert!(load.hash_functions_count >= 1);
            }
            other => panic!("expected a filter reload, got {:?}", other),
        }
    }

    #[test]
    fn rescan_walks_forward_over_known_blocks() {
        let mut fixture = fixture();
        let genesis = fixture.store.chain_head().unwrap().hash;
        let a = child_header(genesis, 1);
        let b = child_header(a.hash(), 2);
        fixture.worker.handle(WalletTask::Header(a)).unwrap();
        fixture.worker.handle(WalletTask::Header(b)).unwrap();
        let _ = fixture.events.try_recv();
        let _ = fixture.events.try_recv();

        // A key created before block A forces the rescan to start at 0.
        fixture
            .worker
            .handle(WalletTask::ImportKey {
                secret: [9u8; 32],
                creation_time: Utc.timestamp_opt(1_000, 0).single().unwrap(),
                label: String::new(),
                change: false,
            })
            .unwrap();
        let _ = fixture.events.try_recv(); // filter reload
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            WalletEvent::RescanBlock(genesis)
        );

        // Re-delivering a known block advances the scan height.
        fixture
            .worker
            .handle(WalletTask::Header(
                fixture.store.get_header(genesis).unwrap().unwrap().header,
            ))
            .unwrap();
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            WalletEvent::RescanBlock(a.hash())
        );
        fixture.worker.handle(WalletTask::Header(a)).unwrap();
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            WalletEvent::RescanBlock(b.hash())
        );
        // Past the head: the rescan completes silently.
        fixture.worker.handle(WalletTask::Header(b)).unwrap();
        assert!(fixture.events.try_recv().is_err());
    }
}
