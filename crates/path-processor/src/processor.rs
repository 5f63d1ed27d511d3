//! The per-path coordination engine.
//!
//! A [`PathProcessor`] handles incoming IBC messages from a pair of chains.
//! It determines what messages need to be relayed, and sends them. Chain
//! processors talk to a running processor through its cloneable
//! [`PathProcessorHandle`].

use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, error_span, info, warn};

use crate::cache::{ChannelKey, PacketSequenceCache};
use crate::ident::{ChainId, ClientId, ConnectionId};
use crate::lifecycle::MessageLifecycle;
use crate::path::PathEnd;
use crate::provider::{ChainProvider, ChannelInfo, ConnectionInfo, PacketInfo};
use crate::runtime::{ChainProcessorCacheData, PathEndRuntime};
use crate::util::cancel::CancellationToken;
use crate::util::shared::SharedCache;

/// How long to wait before retrying in the case of failure to send
/// transactions with IBC messages.
pub(crate) const DURATION_ERROR_RETRY: Duration = Duration::from_secs(5);
pub(crate) const BLOCKS_TO_RETRY_ASSEMBLY_AFTER: u64 = 1;
pub(crate) const BLOCKS_TO_RETRY_SEND_AFTER: u64 = 2;
pub(crate) const MAX_MESSAGE_SEND_RETRIES: u64 = 10;

pub(crate) const IBC_HEADERS_TO_CACHE: usize = 10;

/// A matching pair of channel keys, one from each path end's perspective.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelPair {
    pub path_end_1_channel_key: ChannelKey,
    pub path_end_2_channel_key: ChannelKey,
}

/// A process that handles incoming IBC messages from a pair of chains.
/// It determines what messages need to be relayed, and sends them.
pub struct PathProcessor {
    pub(crate) path_end_1: PathEndRuntime,
    pub(crate) path_end_2: PathEndRuntime,

    // Signals to retry.
    retry_tx: Sender<()>,
    retry_rx: Receiver<()>,
    retry_generation: Arc<AtomicU64>,

    pub(crate) sent_initial_msg: bool,
}

enum Round {
    Continue,
    Shutdown,
}

impl PathProcessor {
    pub fn new(path_end_1: PathEnd, path_end_2: PathEnd) -> Self {
        let (retry_tx, retry_rx) = bounded(8);
        Self {
            path_end_1: PathEndRuntime::new(path_end_1),
            path_end_2: PathEndRuntime::new(path_end_2),
            retry_tx,
            retry_rx,
            retry_generation: Arc::new(AtomicU64::new(0)),
            sent_initial_msg: false,
        }
    }

    /// A cloneable handle for chain processors to feed and query this
    /// path processor, valid across the processor's whole run.
    pub fn handle(&self) -> PathProcessorHandle {
        PathProcessorHandle {
            end_1: PathEndHandle {
                info: self.path_end_1.info.clone(),
                incoming_tx: self.path_end_1.incoming_tx.clone(),
                connection_state_cache: self.path_end_1.connection_state_cache.clone(),
            },
            end_2: PathEndHandle {
                info: self.path_end_2.info.clone(),
                incoming_tx: self.path_end_2.incoming_tx.clone(),
                connection_state_cache: self.path_end_2.connection_state_cache.clone(),
            },
            retry_tx: self.retry_tx.clone(),
        }
    }

    /// Attach a chain provider to whichever path end matches its chain ID.
    /// Returns whether a side matched.
    ///
    /// Path processors are constructed before chain processors, so the
    /// provider reference is added afterwards, before the processor runs.
    pub fn set_chain_provider(&mut self, chain_provider: Arc<dyn ChainProvider>) -> bool {
        if self.path_end_1.info.chain_id == *chain_provider.chain_id() {
            self.path_end_1.chain_provider = Some(chain_provider);
            true
        } else if self.path_end_2.info.chain_id == *chain_provider.chain_id() {
            self.path_end_2.chain_provider = Some(chain_provider);
            true
        } else {
            false
        }
    }

    /// Register a callback for packet flow messages finalized on the given
    /// chain. Registration must happen before the processor runs.
    pub fn on_packet_message(
        &mut self,
        chain_id: &ChainId,
        action: impl Into<String>,
        on_msg: impl Fn(&PacketInfo) + Send + Sync + 'static,
    ) {
        let action = action.into();
        if self.path_end_1.info.chain_id == *chain_id {
            self.path_end_1
                .packet_subscribers
                .entry(action)
                .or_default()
                .push(Box::new(on_msg));
        } else if self.path_end_2.info.chain_id == *chain_id {
            self.path_end_2
                .packet_subscribers
                .entry(action)
                .or_default()
                .push(Box::new(on_msg));
        }
    }

    /// Register a callback for channel handshake messages finalized on the
    /// given chain. Registration must happen before the processor runs.
    pub fn on_channel_message(
        &mut self,
        chain_id: &ChainId,
        action: impl Into<String>,
        on_msg: impl Fn(&ChannelInfo) + Send + Sync + 'static,
    ) {
        let action = action.into();
        if self.path_end_1.info.chain_id == *chain_id {
            self.path_end_1
                .channel_subscribers
                .entry(action)
                .or_default()
                .push(Box::new(on_msg));
        } else if self.path_end_2.info.chain_id == *chain_id {
            self.path_end_2
                .channel_subscribers
                .entry(action)
                .or_default()
                .push(Box::new(on_msg));
        }
    }

    /// Register a callback for connection handshake messages finalized on
    /// the given chain. Registration must happen before the processor runs.
    pub fn on_connection_message(
        &mut self,
        chain_id: &ChainId,
        action: impl Into<String>,
        on_msg: impl Fn(&ConnectionInfo) + Send + Sync + 'static,
    ) {
        let action = action.into();
        if self.path_end_1.info.chain_id == *chain_id {
            self.path_end_1
                .connection_subscribers
                .entry(action)
                .or_default()
                .push(Box::new(on_msg));
        } else if self.path_end_2.info.chain_id == *chain_id {
            self.path_end_2
                .connection_subscribers
                .entry(action)
                .or_default()
                .push(Box::new(on_msg));
        }
    }

    /// Route a chain processor update into the matching path end's queue.
    pub fn handle_new_data(&self, chain_id: &ChainId, data: ChainProcessorCacheData) {
        let incoming_tx = if self.path_end_1.info.chain_id == *chain_id {
            &self.path_end_1.incoming_tx
        } else if self.path_end_2.info.chain_id == *chain_id {
            &self.path_end_2.incoming_tx
        } else {
            return;
        };
        if incoming_tx.send(data).is_err() {
            warn!(chain_id = %chain_id, "dropping data for stopped path processor");
        }
    }

    /// Trigger a processing round even without new messages, e.g. as soon
    /// as a chain processor is in sync for the first time.
    pub fn process_backlog_if_ready(&self) {
        if self.retry_tx.try_send(()).is_err() {
            // The channel is saturated; something is wrong if we are
            // retrying this quickly.
            info!("failed to enqueue path processor retry");
        }
    }

    pub fn is_relayed_channel(&self, chain_id: &ChainId, channel_key: &ChannelKey) -> bool {
        if self.path_end_1.info.chain_id == *chain_id {
            self.path_end_1.info.should_relay_channel(channel_key)
        } else if self.path_end_2.info.chain_id == *chain_id {
            self.path_end_2.info.should_relay_channel(channel_key)
        } else {
            false
        }
    }

    pub fn is_relevant_client(&self, chain_id: &ChainId, client_id: &ClientId) -> bool {
        if self.path_end_1.info.chain_id == *chain_id {
            self.path_end_1.info.client_id == *client_id
        } else if self.path_end_2.info.chain_id == *chain_id {
            self.path_end_2.info.client_id == *client_id
        } else {
            false
        }
    }

    pub fn is_relevant_connection(&self, chain_id: &ChainId, connection_id: &ConnectionId) -> bool {
        if self.path_end_1.info.chain_id == *chain_id {
            self.path_end_1.is_relevant_connection(connection_id)
        } else if self.path_end_2.info.chain_id == *chain_id {
            self.path_end_2.is_relevant_connection(connection_id)
        } else {
            false
        }
    }

    /// The client ID on the side matching `chain_id`.
    ///
    /// Panics if neither side matches; calling this with an unknown chain
    /// ID is a programmer error.
    pub fn relevant_client_id(&self, chain_id: &ChainId) -> ClientId {
        if self.path_end_1.info.chain_id == *chain_id {
            self.path_end_1.info.client_id.clone()
        } else if self.path_end_2.info.chain_id == *chain_id {
            self.path_end_2.info.client_id.clone()
        } else {
            panic!("no relevant client ID for chain ID: {chain_id}")
        }
    }

    /// All channels considered open by either side, paired as keys from
    /// each path end's perspective.
    pub fn channel_pairs(&self) -> Vec<ChannelPair> {
        // Channel keys are from path end 1's perspective.
        let mut channels: BTreeMap<ChannelKey, bool> = BTreeMap::new();
        for (k, open) in self.path_end_1.channel_state_cache.read().iter() {
            let state = channels.entry(k.clone()).or_insert(false);
            *state = *state || *open;
        }
        for (k, open) in self.path_end_2.channel_state_cache.read().iter() {
            let state = channels.entry(k.counterparty()).or_insert(false);
            *state = *state || *open;
        }
        channels
            .into_iter()
            .filter(|(_, open)| *open)
            .map(|(k, _)| ChannelPair {
                path_end_2_channel_key: k.counterparty(),
                path_end_1_channel_key: k,
            })
            .collect()
    }

    /// Intended for tests: snapshot of path end 1's cached packet messages
    /// for one channel and message type.
    pub fn path_end_1_messages(
        &self,
        channel_key: &ChannelKey,
        action: &str,
    ) -> PacketSequenceCache {
        self.path_end_1
            .message_cache
            .packet_flow
            .get(channel_key)
            .and_then(|mc| mc.get(action))
            .cloned()
            .unwrap_or_default()
    }

    /// Intended for tests: snapshot of path end 2's cached packet messages
    /// for one channel and message type.
    pub fn path_end_2_messages(
        &self,
        channel_key: &ChannelKey,
        action: &str,
    ) -> PacketSequenceCache {
        self.path_end_2
            .message_cache
            .packet_flow
            .get(channel_key)
            .and_then(|mc| mc.get(action))
            .cloned()
            .unwrap_or_default()
    }

    /// Execute the main path process until cancelled or terminated by the
    /// lifecycle.
    pub fn run(mut self, cancel: CancellationToken, lifecycle: Option<MessageLifecycle>) {
        let span = error_span!(
            "path_processor",
            chain_id_1 = %self.path_end_1.info.chain_id,
            chain_id_2 = %self.path_end_2.info.chain_id,
        );
        let _entered = span.enter();

        loop {
            if let Round::Shutdown = self.one_round(&cancel, lifecycle.as_ref()) {
                return;
            }
        }
    }

    /// Run the main path process on a background thread. Stopping goes
    /// through the cancellation token, which wakes the worker out of its
    /// blocking select; the returned handle does so itself when dropped.
    pub fn spawn(
        self,
        cancel: CancellationToken,
        lifecycle: Option<MessageLifecycle>,
    ) -> WorkerHandle {
        let stopped = Arc::new(AtomicBool::new(false));
        let worker_stopped = stopped.clone();
        let worker_cancel = cancel.clone();

        let thread = thread::spawn(move || {
            self.run(worker_cancel, lifecycle);
            worker_stopped.store(true, Ordering::Release);
        });

        WorkerHandle {
            cancel,
            stopped,
            thread: Some(thread),
        }
    }

    /// One iteration of the main loop: block until any signal, coalesce
    /// everything pending into a single merged view, then process it.
    fn one_round(
        &mut self,
        cancel: &CancellationToken,
        lifecycle: Option<&MessageLifecycle>,
    ) -> Round {
        let incoming_rx_1 = self.path_end_1.incoming_rx.clone();
        let incoming_rx_2 = self.path_end_2.incoming_rx.clone();
        let retry_rx = self.retry_rx.clone();

        // Block until we have any signals to process.
        select! {
            recv(cancel.wakeup()) -> _ => {
                debug!("context done, quitting path processor");
                return Round::Shutdown;
            }
            recv(incoming_rx_1) -> data => {
                // New data from the chain processor for path end 1.
                if let Ok(data) = data {
                    self.path_end_1.merge_cache_data(cancel, data, lifecycle);
                }
            }
            recv(incoming_rx_2) -> data => {
                // New data from the chain processor for path end 2.
                if let Ok(data) = data {
                    self.path_end_2.merge_cache_data(cancel, data, lifecycle);
                }
            }
            recv(retry_rx) -> _ => {
                // No new data to merge in, just retry handling.
            }
        }

        // Fully flush path end incoming data before processing. Merges are
        // cheap and newer observations can make pending submissions
        // redundant, so a burst coalesces into one round.
        while let Ok(data) = self.path_end_1.incoming_rx.try_recv() {
            self.path_end_1.merge_cache_data(cancel, data, lifecycle);
        }
        while let Ok(data) = self.path_end_2.incoming_rx.try_recv() {
            self.path_end_2.merge_cache_data(cancel, data, lifecycle);
        }

        // Flush the retry signal in case retries were scheduled.
        while self.retry_rx.try_recv().is_ok() {}

        // Check the cancellation here in case merging found the
        // termination condition; no need to process messages if so.
        if cancel.is_cancelled() {
            debug!("context cancelled, quitting path processor");
            return Round::Shutdown;
        }

        if !self.path_end_1.in_sync || !self.path_end_2.in_sync {
            return Round::Continue;
        }

        // Process the latest message cache state from both path ends.
        if let Err(e) = self.process_latest_messages(lifecycle) {
            warn!("error processing latest messages, will retry: {}", e);
            if !cancel.is_cancelled() {
                self.schedule_error_retry(cancel);
            }
        }

        Round::Continue
    }

    /// Schedule a one-shot retry signal after [`DURATION_ERROR_RETRY`],
    /// replacing any prior pending one.
    fn schedule_error_retry(&self, cancel: &CancellationToken) {
        let generation = self.retry_generation.fetch_add(1, Ordering::AcqRel) + 1;

        let retry_generation = self.retry_generation.clone();
        let retry_tx = self.retry_tx.clone();
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(DURATION_ERROR_RETRY);
            // A newer failure moved the generation on; its timer owns the
            // retry now.
            if retry_generation.load(Ordering::Acquire) == generation && !cancel.is_cancelled() {
                let _ = retry_tx.try_send(());
            }
        });
    }
}

/// Handle to a path processor worker running on its own thread.
///
/// Dropping the handle cancels the worker and waits for it to exit.
pub struct WorkerHandle {
    cancel: CancellationToken,
    stopped: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// True once the worker loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Cancel the worker without waiting for it to exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Cancel the worker and wait for it to exit.
    pub fn join(mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[derive(Clone)]
struct PathEndHandle {
    info: PathEnd,
    incoming_tx: Sender<ChainProcessorCacheData>,
    connection_state_cache: SharedCache<crate::cache::ConnectionStateCache>,
}

/// Cloneable handle to a [`PathProcessor`], for chain processors to feed
/// data and evaluate relevance predicates while the processor runs.
#[derive(Clone)]
pub struct PathProcessorHandle {
    end_1: PathEndHandle,
    end_2: PathEndHandle,
    retry_tx: Sender<()>,
}

impl PathProcessorHandle {
    fn end_for_chain(&self, chain_id: &ChainId) -> Option<&PathEndHandle> {
        if self.end_1.info.chain_id == *chain_id {
            Some(&self.end_1)
        } else if self.end_2.info.chain_id == *chain_id {
            Some(&self.end_2)
        } else {
            None
        }
    }

    /// Route a chain processor update into the matching path end's queue.
    /// A non-matching chain ID is a no-op.
    pub fn handle_new_data(&self, chain_id: &ChainId, data: ChainProcessorCacheData) {
        if let Some(end) = self.end_for_chain(chain_id) {
            if end.incoming_tx.send(data).is_err() {
                warn!(chain_id = %chain_id, "dropping data for stopped path processor");
            }
        }
    }

    /// Trigger a processing round even without new messages. The signal is
    /// level-triggered: if one is already pending, this request is
    /// subsumed by it and dropped.
    pub fn process_backlog_if_ready(&self) {
        if self.retry_tx.try_send(()).is_err() {
            info!("failed to enqueue path processor retry");
        }
    }

    pub fn is_relayed_channel(&self, chain_id: &ChainId, channel_key: &ChannelKey) -> bool {
        self.end_for_chain(chain_id)
            .map_or(false, |end| end.info.should_relay_channel(channel_key))
    }

    pub fn is_relevant_client(&self, chain_id: &ChainId, client_id: &ClientId) -> bool {
        self.end_for_chain(chain_id)
            .map_or(false, |end| end.info.client_id == *client_id)
    }

    pub fn is_relevant_connection(&self, chain_id: &ChainId, connection_id: &ConnectionId) -> bool {
        self.end_for_chain(chain_id).map_or(false, |end| {
            end.connection_state_cache
                .read()
                .keys()
                .any(|k| &k.connection_id == connection_id && k.client_id == end.info.client_id)
        })
    }

    /// The client ID on the side matching `chain_id`.
    ///
    /// Panics if neither side matches; calling this with an unknown chain
    /// ID is a programmer error.
    pub fn relevant_client_id(&self, chain_id: &ChainId) -> ClientId {
        match self.end_for_chain(chain_id) {
            Some(end) => end.info.client_id.clone(),
            None => panic!("no relevant client ID for chain ID: {chain_id}"),
        }
    }

    pub fn chain_id_1(&self) -> &ChainId {
        &self.end_1.info.chain_id
    }

    pub fn chain_id_2(&self) -> &ChainId {
        &self.end_2.info.chain_id
    }
}

/// The path processor handles subscribed to a set of chain processors.
#[derive(Clone, Default)]
pub struct PathProcessors(pub Vec<PathProcessorHandle>);

impl PathProcessors {
    /// Whether any subscribed path processor relays this channel on this
    /// chain.
    pub fn is_relayed_channel(&self, channel_key: &ChannelKey, chain_id: &ChainId) -> bool {
        self.0
            .iter()
            .any(|pp| pp.is_relayed_channel(chain_id, channel_key))
    }
}
