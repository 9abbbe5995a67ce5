//! Synchronization of the voting contract activity into the local store.
//!
//! Live logs and live block headers are followed by two tasks while the logs
//! emitted since the last checkpoint are backfilled. Only the header task
//! moves the checkpoint. Backfill and live logs may apply the same event
//! twice: every event is either idempotent or rejected by the store without
//! side effects.
//!
//! Chain reorganizations are not handled.

use std::sync::Arc;

use futures::StreamExt;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    chain::{Address, BlockHeader, ChainClient, LogEvent, LogFilter, Subscription},
    db::{self, SqliteStore},
    errors::VoteError,
    events::{decode_event, ContractEvent, EventNewProcess},
    types::{ProcessId, ProcessStatus},
};

/// Storage used by the synchronizer. Calls block on I/O.
pub trait SyncStore: Send + Sync + 'static {
    fn get_last_sync_block_num(&self) -> Result<u64, VoteError>;
    fn update_last_sync_block_num(&self, block_num: u64) -> Result<(), VoteError>;
    fn store_process(&self, e: &EventNewProcess, eth_block_num: u64) -> Result<(), VoteError>;
    fn update_process_status(
        &self,
        process_id: ProcessId,
        status: ProcessStatus,
    ) -> Result<(), VoteError>;
    fn froze_processes_by_current_block_num(&self, block_num: u64) -> Result<usize, VoteError>;
}

impl SyncStore for SqliteStore {
    fn get_last_sync_block_num(&self) -> Result<u64, VoteError> {
        db::get_last_sync_block_num(&*self.connection()?)
    }

    fn update_last_sync_block_num(&self, block_num: u64) -> Result<(), VoteError> {
        db::update_last_sync_block_num(&*self.connection()?, block_num)
    }

    fn store_process(&self, e: &EventNewProcess, eth_block_num: u64) -> Result<(), VoteError> {
        db::store_process(&*self.connection()?, e, eth_block_num)
    }

    fn update_process_status(
        &self,
        process_id: ProcessId,
        status: ProcessStatus,
    ) -> Result<(), VoteError> {
        db::update_process_status(&*self.connection()?, process_id, status)
    }

    fn froze_processes_by_current_block_num(&self, block_num: u64) -> Result<usize, VoteError> {
        db::froze_processes_by_current_block_num(&*self.connection()?, block_num)
    }
}

/// Runs `f` on the blocking thread pool so that store I/O does not stall
/// the runtime
async fn on_store<S, T, F>(store: &Arc<S>, f: F) -> Result<T, VoteError>
where
    S: SyncStore,
    T: Send + 'static,
    F: FnOnce(&S) -> T + Send + 'static,
{
    let store = store.clone();
    let r = tokio::task::spawn_blocking(move || f(&*store)).await?;
    Ok(r)
}

pub struct Synchronizer<C: ChainClient, S: SyncStore> {
    client: Arc<C>,
    store: Arc<S>,
    contract: Address,
    chain_id: u64,
}

/// Running live synchronization. Dropping the handle stops the workers.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    /// Height reached by the historical backfill
    pub history_block_num: u64,
}

impl SyncHandle {
    /// Waits until both subscriptions end
    pub async fn wait(self) {
        let SyncHandle {
            shutdown: _shutdown,
            tasks,
            ..
        } = self;
        join_all(tasks).await;
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        join_all(self.tasks).await;
    }
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(err) = task.await {
            log::error!("sync task panicked: {:?}", err);
        }
    }
}

impl<C: ChainClient, S: SyncStore> Synchronizer<C, S> {
    pub async fn new(client: C, store: S, contract: Address) -> Result<Self, VoteError> {
        let chain_id = client.chain_id().await?;
        log::info!("connected to chain {} (contract {})", chain_id, contract);
        Ok(Synchronizer {
            client: Arc::new(client),
            store: Arc::new(store),
            contract,
            chain_id,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Synchronizes from the last checkpoint and keeps following the chain
    /// until the subscriptions end
    pub async fn sync(&self) -> Result<(), VoteError> {
        let handle = self.start().await?;
        handle.wait().await;
        Ok(())
    }

    pub async fn start(&self) -> Result<SyncHandle, VoteError> {
        let last_sync_block_num =
            on_store(&self.store, |s| s.get_last_sync_block_num()).await??;
        self.start_from(last_sync_block_num).await
    }

    /// Starts the live subscriptions, then backfills the logs from
    /// `from_block` to the current height. Only failures to reach the chain
    /// or the store are returned; event level failures are logged.
    pub async fn start_from(&self, from_block: u64) -> Result<SyncHandle, VoteError> {
        // TODO: delay the application of logs by a few confirmations once
        // reorgs have to be supported
        let logs = self.client.subscribe_logs(&LogFilter::new(self.contract)).await?;
        let headers = self.client.subscribe_new_heads().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(sync_events_live(self.store.clone(), logs, shutdown_rx.clone())),
            tokio::spawn(sync_blocks_live(self.store.clone(), headers, shutdown_rx)),
        ];
        let mut handle = SyncHandle {
            shutdown,
            tasks,
            history_block_num: from_block,
        };

        match self.sync_history(from_block).await {
            Ok(block_num) => {
                handle.history_block_num = block_num;
                Ok(handle)
            }
            Err(err) => {
                log::error!("history sync failed: {}", err);
                handle.shutdown().await;
                Err(err)
            }
        }
    }

    /// Applies the logs from `start_block` to the current block and freezes
    /// the processes whose results publishing phase has started. Returns the
    /// current block number.
    pub async fn sync_history(&self, start_block: u64) -> Result<u64, VoteError> {
        let curr_block_num = self.client.block_number().await?;
        log::debug!("[SyncHistory] blocks from: {}, to: {}", start_block, curr_block_num);
        let logs = if start_block <= curr_block_num {
            let filter = LogFilter::range(self.contract, start_block, curr_block_num);
            self.client.filter_logs(&filter).await?
        } else {
            vec![]
        };
        let frozen = on_store(&self.store, move |store| {
            for event_log in logs.iter() {
                if let Err(err) = process_event_log(store, event_log) {
                    log::error!("{}", err);
                }
            }
            store.froze_processes_by_current_block_num(curr_block_num)
        })
        .await??;
        if frozen > 0 {
            log::info!("{} processes frozen at block {}", frozen, curr_block_num);
        }
        Ok(curr_block_num)
    }
}

/// Decodes a contract log and applies it to the store
pub fn process_event_log<S: SyncStore + ?Sized>(
    store: &S,
    event_log: &LogEvent,
) -> Result<ContractEvent, VoteError> {
    let block_number = event_log.block_number;
    let event = decode_event(&event_log.data).map_err(|err| {
        if let VoteError::UnrecognizedEvent { .. } = err {
            log::warn!(
                "LOG in block {}: {}",
                block_number,
                hex::encode(&event_log.data)
            );
        }
        err.in_event_log(block_number, &event_log.data)
    })?;
    log::debug!("Event: (blocknum: {}) {}", block_number, event);

    let r = match &event {
        ContractEvent::NewProcess(e) => store.store_process(e, block_number),
        // results are not tracked by the node
        ContractEvent::ResultPublished(_) => Ok(()),
        ContractEvent::ProcessClosed(e) => {
            store.update_process_status(e.process_id, ProcessStatus::ContractClosed)
        }
    };
    r.map_err(|err| err.in_event_log(block_number, &event_log.data))?;
    Ok(event)
}

async fn sync_events_live<S: SyncStore>(
    store: Arc<S>,
    mut logs: Subscription<LogEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event_log = logs.next() => match event_log {
                Some(Ok(event_log)) => {
                    let r = on_store(&store, move |s| process_event_log(s, &event_log)).await;
                    if let Err(err) = r.and_then(|r| r) {
                        log::error!("{}", err);
                    }
                }
                Some(Err(err)) => log::error!("log subscription: {}", err),
                None => {
                    log::warn!("log subscription closed");
                    break;
                }
            }
        }
    }
}

async fn sync_blocks_live<S: SyncStore>(
    store: Arc<S>,
    mut headers: Subscription<BlockHeader>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            header = headers.next() => match header {
                Some(Ok(header)) => {
                    let block_num = header.number;
                    if let Err(err) = on_store(&store, move |s| on_new_block(s, block_num)).await {
                        log::error!("block {}: {}", block_num, err);
                    }
                }
                Some(Err(err)) => log::error!("block subscription: {}", err),
                None => {
                    log::warn!("block subscription closed");
                    break;
                }
            }
        }
    }
}

fn on_new_block<S: SyncStore + ?Sized>(store: &S, block_num: u64) {
    log::debug!("new eth block received: {}", block_num);
    if let Err(err) = store.update_last_sync_block_num(block_num) {
        log::error!("cannot update last sync block {}: {}", block_num, err);
    }
    match store.froze_processes_by_current_block_num(block_num) {
        Ok(0) => {}
        Ok(n) => log::info!("{} processes frozen at block {}", n, block_num),
        Err(err) => log::error!("cannot freeze processes at block {}: {}", block_num, err),
    }
}
