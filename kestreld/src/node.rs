//! Node assembly: open the wallet, wire the worker tasks together, and run
//! until shutdown.
//!
//! Task layout (the channel arrows are `tokio::sync::mpsc`):
//!
//! ```text
//! connection tasks → peer events → dispatcher → inbound updates ┐
//!        ▲                                                      ▼
//!        └── maintenance tick            update pump → wallet worker
//!                                                         │
//!                         wallet events pump ◀────────────┘
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use kestrel_chain::{
    amount::Amount,
    block::{self, Height},
    parameters::Network,
    transparent::Address,
};
use kestrel_network::address_book::AddressBook;
use kestrel_network::connection;
use kestrel_network::constants;
use kestrel_network::dispatcher::{Dispatcher, HandshakeParams, InboundUpdate};
use kestrel_network::peer_set::PeerSet;
use kestrel_network::protocol::external::types::{Filter, PeerServices, Tweak};
use kestrel_network::protocol::external::{GetBlocks, Message};
use kestrel_network::sync::{RequestKind, RequestTracker};
use kestrel_wallet::bloom::FilterLoad;
use kestrel_wallet::builder;
use kestrel_wallet::keys::{KeyCrypter, KeyStore};
use kestrel_wallet::worker::{WalletEvent, WalletTask, WalletWorker};
use kestrel_wallet::{SledStore, WalletStore};

use crate::config::Config;

/// A payment requested on the command line, sent once the chain is caught
/// up with the network.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub to: Address,
    pub amount: Amount,
    pub fee: Amount,
}

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("the configured passphrase does not match the wallet")]
    WrongPassphrase,

    #[error("no passphrase configured; set `passphrase` in the config file")]
    NoPassphrase,

    #[error("initialization failed: {0}")]
    Fatal(String),
}

/// Run the node until ctrl-c.
pub async fn run(config: Config, payment: Option<PaymentRequest>) -> Result<(), StartupError> {
    let network = config
        .network()
        .map_err(StartupError::Fatal)?;

    let passphrase = config
        .passphrase
        .clone()
        .ok_or(StartupError::NoPassphrase)?;
    let crypter = KeyCrypter::from_passphrase(&passphrase);

    let store = Arc::new(
        SledStore::open(&config.store_path(), network)
            .map_err(|error| StartupError::Fatal(format!("cannot open wallet store: {}", error)))?,
    );
    let keys = KeyStore::load(store.as_ref())
        .map_err(|error| StartupError::Fatal(format!("cannot load keys: {}", error)))?;
    keys.verify_passphrase(&crypter)
        .map_err(|_| StartupError::WrongPassphrase)?;
    let keys = Arc::new(RwLock::new(keys));

    // A brand-new wallet mints its first receive key and its single change
    // key, so it has an address to hand out.
    {
        let mut keys = keys.write().expect("key store lock poisoned");
        if keys.is_empty() {
            let receive = keys
                .generate(store.as_ref(), "receive", false, &crypter)
                .map_err(|error| StartupError::Fatal(format!("cannot create keys: {}", error)))?
                .hash160();
            keys.generate(store.as_ref(), "change", true, &crypter)
                .map_err(|error| StartupError::Fatal(format!("cannot create keys: {}", error)))?;
            info!(address = %Address::new(network, receive), "generated initial wallet keys");
        }
    }

    let head = store
        .chain_head()
        .map_err(|error| StartupError::Fatal(format!("cannot read chain head: {}", error)))?;
    info!(network = ?network, height = head.height.0, hash = %head.hash, "wallet opened");

    // Shared state.
    let peer_set = Arc::new(PeerSet::new());
    let address_book = Arc::new(Mutex::new(AddressBook::new(config.connect.clone())));
    let requests = Arc::new(Mutex::new(RequestTracker::new()));
    let shared_filter = Arc::new(Mutex::new(None));
    let local_height = Arc::new(AtomicU32::new(head.height.0));

    // Channels.
    let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let (wallet_tasks_tx, wallet_tasks_rx) = mpsc::unbounded_channel();
    let (wallet_events_tx, mut wallet_events_rx) = mpsc::unbounded_channel();

    // The wallet worker owns the store-side engines.
    let worker = WalletWorker::new(
        store.clone(),
        network,
        keys.clone(),
        crypter.clone(),
        wallet_events_tx,
        local_height.clone(),
    );
    *shared_filter.lock().expect("filter lock poisoned") =
        Some(filter_message(worker.current_filter()));

    let dispatcher = Dispatcher::new(
        peer_set.clone(),
        address_book.clone(),
        requests.clone(),
        HandshakeParams {
            services: PeerServices::empty(),
            user_agent: constants::USER_AGENT.to_owned(),
            local_height: local_height.clone(),
        },
        shared_filter.clone(),
        updates_tx,
    );

    tokio::spawn(worker.run(wallet_tasks_rx));
    tokio::spawn(dispatcher.clone().run(peer_events_rx));

    // Updates from the dispatcher to the wallet worker, plus the sync kicks
    // that need store access.
    {
        let wallet_tasks = wallet_tasks_tx.clone();
        let peer_set = peer_set.clone();
        let store = store.clone();
        tokio::spawn(async move {
            while let Some(update) = updates_rx.recv().await {
                match update {
                    InboundUpdate::Header(header) => {
                        let _ = wallet_tasks.send(WalletTask::Header(header));
                    }
                    InboundUpdate::MerkleBlock {
                        header,
                        transaction_count,
                        hashes,
                        flags,
                    } => {
                        let _ = wallet_tasks.send(WalletTask::MerkleBlock {
                            header,
                            transaction_count,
                            hashes,
                            flags,
                        });
                    }
                    InboundUpdate::Transaction(tx) => {
                        let _ = wallet_tasks.send(WalletTask::Transaction(tx));
                    }
                    InboundUpdate::PeerReady(id) => {
                        // Ask the fresh peer for everything past our chain.
                        match block_locator(store.as_ref()) {
                            Ok(locator) => peer_set.send_to(
                                id,
                                Message::GetBlocks(GetBlocks {
                                    block_header_hashes: locator,
                                    stop_hash: None,
                                }),
                            ),
                            Err(error) => warn!(%error, "cannot build block locator"),
                        }
                        // And for filter matches sitting in its mempool.
                        peer_set.send_to(id, Message::Mempool);
                    }
                }
            }
        });
    }

    // Wallet events back to the network layer.
    {
        let peer_set = peer_set.clone();
        let requests = requests.clone();
        let dispatcher = dispatcher.clone();
        let shared_filter = shared_filter.clone();
        tokio::spawn(async move {
            while let Some(event) = wallet_events_rx.recv().await {
                match event {
                    WalletEvent::ChainExtended { hash, height } => {
                        debug!(%hash, height = height.0, "chain extended");
                    }
                    WalletEvent::FilterChanged(load) => {
                        let message = filter_message(load);
                        *shared_filter.lock().expect("filter lock poisoned") =
                            Some(message.clone());
                        let reloaded = peer_set.broadcast_ready(message);
                        info!(peers = reloaded, "reloaded bloom filter");
                    }
                    WalletEvent::MissingBlock(hash) | WalletEvent::RescanBlock(hash) => {
                        requests
                            .lock()
                            .expect("request lock poisoned")
                            .enqueue(RequestKind::FilteredBlock, hash.0, None);
                        dispatcher.dispatch_all();
                    }
                    WalletEvent::RowsChanged => {
                        debug!("wallet rows changed");
                    }
                }
            }
        });
    }

    // Outbound connection upkeep and protocol timers.
    {
        let peer_set = peer_set.clone();
        let address_book = address_book.clone();
        let dispatcher = dispatcher.clone();
        let events = peer_events_tx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                dispatcher.tick();
                while peer_set.outbound_count() < constants::TARGET_OUTBOUND_PEERS {
                    let candidate = address_book
                        .lock()
                        .expect("address book lock poisoned")
                        .next_candidate(Instant::now());
                    match candidate {
                        Some(addr) => connection::spawn_outbound(
                            addr,
                            network,
                            peer_set.clone(),
                            events.clone(),
                        ),
                        None => break,
                    }
                }
            }
        });
    }

    // Cold start: fill the address book from DNS seeds unless the operator
    // forced a peer list.
    if config.connect.is_empty() {
        let address_book = address_book.clone();
        let port = config.peer_port();
        tokio::spawn(async move {
            for seed in network.dns_seeds() {
                match tokio::net::lookup_host((*seed, port)).await {
                    Ok(addrs) => {
                        let mut book = address_book.lock().expect("address book lock poisoned");
                        for addr in addrs {
                            book.add_seeded(addr);
                        }
                    }
                    Err(error) => debug!(seed, %error, "dns seed lookup failed"),
                }
            }
            let known = address_book.lock().expect("address book lock poisoned").len();
            info!(known, "dns seeding finished");
        });
    }

    // Optional inbound listener.
    if config.listen {
        let bind = format!("0.0.0.0:{}", config.peer_port());
        match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => {
                info!(%bind, "listening for inbound peers");
                connection::spawn_listener(listener, network, peer_set.clone(), peer_events_tx.clone());
            }
            Err(error) => warn!(%bind, %error, "cannot listen for inbound peers"),
        }
    }

    // A command-line payment goes out once we have caught up with the
    // network's advertised height.
    if let Some(payment) = payment {
        let store = store.clone();
        let keys = keys.clone();
        let peer_set = peer_set.clone();
        let wallet_tasks = wallet_tasks_tx.clone();
        let crypter = crypter.clone();
        let local_height = local_height.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                let network_height = peer_set.network_height();
                let our_height = Height(local_height.load(Ordering::Relaxed));
                if network_height == Height(0) || our_height < network_height {
                    debug!(
                        ours = our_height.0,
                        network = network_height.0,
                        "payment waiting for sync"
                    );
                    continue;
                }
                let built = {
                    let keys = keys.read().expect("key store lock poisoned");
                    builder::build_payment(
                        store.as_ref(),
                        &keys,
                        &crypter,
                        payment.to.pub_key_hash,
                        payment.amount,
                        payment.fee,
                    )
                };
                match built {
                    Ok(tx) => {
                        let tx = Arc::new(tx);
                        info!(tx_hash = %tx.hash(), "broadcasting payment");
                        let _ = wallet_tasks.send(WalletTask::Broadcast(tx.clone()));
                        peer_set.broadcast_ready(Message::Tx(tx));
                    }
                    Err(error) => error!(%error, "cannot build requested payment"),
                }
                return;
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|error| StartupError::Fatal(format!("cannot wait for ctrl-c: {}", error)))?;
    info!("shutting down");
    if let Err(error) = store.flush() {
        warn!(%error, "store flush failed during shutdown");
    }
    Ok(())
}

fn filter_message(load: FilterLoad) -> Message {
    Message::FilterLoad {
        filter: Filter(load.filter),
        hash_functions_count: load.hash_functions_count,
        tweak: Tweak(load.tweak),
        flags: load.flags,
    }
}

/// The block locator for a `getblocks`: the chain head, then single steps
/// for ten entries, then doubling strides, capped 500 headers back, with
/// the genesis hash always last.
fn block_locator<S: WalletStore>(store: &S) -> Result<Vec<block::Hash>, kestrel_wallet::StoreError> {
    let head = store.chain_head()?;
    let mut hashes = Vec::new();

    let mut step = 1u32;
    let mut back = 0u32;
    while back <= head.height.0 && back <= constants::LOCATOR_MAX_SPAN {
        let height = Height(head.height.0 - back);
        if let Some(entry) = store.get_block_at_height(height)? {
            hashes.push(entry.hash());
        }
        if hashes.len() >= constants::LOCATOR_DENSE_PREFIX as usize {
            step = step.saturating_mul(2);
        }
        match back.checked_add(step) {
            Some(next) => back = next,
            None => break,
        }
    }

    let genesis = kestrel_chain::parameters::genesis_hash(network_of(store)?);
    if hashes.last() != Some(&genesis) {
        hashes.push(genesis);
    }
    Ok(hashes)
}

/// Recover the network from the stored genesis entry.
fn network_of<S: WalletStore>(store: &S) -> Result<Network, kestrel_wallet::StoreError> {
    let genesis = store
        .get_block_at_height(Height(0))?
        .expect("every store holds its genesis block");
    if genesis.hash() == kestrel_chain::parameters::genesis_hash(Network::Testnet) {
        Ok(Network::Testnet)
    } else {
        Ok(Network::Mainnet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kestrel_chain::block::merkle;
    use kestrel_chain::work::CompactDifficulty;
    use kestrel_wallet::HeaderEntry;
    use tempdir::TempDir;

    fn store_with_chain(length: u32) -> (TempDir, Arc<SledStore>) {
        kestrel_test::init();
        let dir = TempDir::new("kestreld-node-test").unwrap();
        let store = Arc::new(SledStore::open(dir.path(), Network::Mainnet).unwrap());

        let mut parent = store.chain_head().unwrap().hash;
        let mut parent_entry = store.get_header(parent).unwrap().unwrap();
        for nonce in 1..=length {
            let header = block::Header::new(
                1,
                parent,
                merkle::Root([nonce as u8; 32]),
                Utc.timestamp_opt(1_300_000_000 + nonce as i64 * 600, 0)
                    .single()
                    .unwrap(),
                CompactDifficulty(0x1d00ffff),
                nonce,
            );
            let entry = HeaderEntry {
                header,
                on_chain: true,
                height: Height(nonce),
                chain_work: parent_entry.chain_work + header.block_work().unwrap(),
                matched: Vec::new(),
            };
            store.put_header(&entry).unwrap();
            store
                .set_chain_head(&[parent_entry.clone(), entry.clone()])
                .unwrap();
            parent = header.hash();
            parent_entry = entry;
        }
        (dir, store)
    }

    #[test]
    fn locator_is_dense_then_doubles() {
        let (_dir, store) = store_with_chain(40);
        let locator = block_locator(store.as_ref()).unwrap();

        // Heights hit: 40..31 densely, then 29, 25, 17, 1, genesis.
        let head = store.chain_head().unwrap();
        assert_eq!(head.height, Height(40));
        assert_eq!(locator[0], head.hash);
        assert_eq!(
            locator.len(),
            10 + 4 + 1,
            "ten dense entries, four strided, genesis"
        );
        assert_eq!(
            *locator.last().unwrap(),
            kestrel_chain::parameters::genesis_hash(Network::Mainnet)
        );
    }

    #[test]
    fn short_chains_produce_short_locators() {
        let (_dir, store) = store_with_chain(3);
        let locator = block_locator(store.as_ref()).unwrap();
        // Heights 3, 2, 1, 0 — and 0 is the genesis, not repeated.
        assert_eq!(locator.len(), 4);
        assert_eq!(
            *locator.last().unwrap(),
            kestrel_chain::parameters::genesis_hash(Network::Mainnet)
        );
    }
}
