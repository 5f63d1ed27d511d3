//! End-to-end scenarios driving a spawned path processor with a mock
//! chain provider on each side.

use core::any::Any;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ibc_path_processor::cache::ChannelKey;
use ibc_path_processor::ident::{ChainId, ChannelId, ClientId, ConnectionId, PortId};
use ibc_path_processor::lifecycle::{MessageLifecycle, PacketMessage, PacketMessageLifecycle};
use ibc_path_processor::msgs::{
    MSG_ACKNOWLEDGEMENT, MSG_RECV_PACKET, MSG_TIMEOUT, MSG_TRANSFER, MSG_UPDATE_CLIENT,
};
use ibc_path_processor::path::PathEnd;
use ibc_path_processor::processor::{PathProcessor, PathProcessorHandle, WorkerHandle};
use ibc_path_processor::provider::{
    AnyIbcHeader, AnyMsg, ChainProvider, ChannelInfo, ClientState, ConnectionInfo, IbcHeader,
    LatestBlock, PacketInfo, Proof, ProviderError,
};
use ibc_path_processor::runtime::ChainProcessorCacheData;
use ibc_path_processor::util::cancel::CancellationToken;

type Sent = Arc<Mutex<Vec<Vec<AnyMsg>>>>;

#[derive(Debug)]
struct MockHeader {
    height: u64,
}

impl IbcHeader for MockHeader {
    fn height(&self) -> u64 {
        self.height
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct MockProvider {
    chain_id: ChainId,
    sent: Sent,
}

impl MockProvider {
    fn new(chain_id: &str) -> (Arc<Self>, Sent) {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let provider = Arc::new(Self {
            chain_id: ChainId::new(chain_id),
            sent: sent.clone(),
        });
        (provider, sent)
    }
}

impl ChainProvider for MockProvider {
    fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    fn packet_proof(
        &self,
        _action: &str,
        _info: &PacketInfo,
        height: u64,
    ) -> Result<Proof, ProviderError> {
        Ok(Proof {
            bytes: b"proof".to_vec(),
            height,
        })
    }

    fn packet_message(
        &self,
        action: &str,
        info: &PacketInfo,
        _proof: Proof,
    ) -> Result<AnyMsg, ProviderError> {
        Ok(AnyMsg {
            type_url: action.to_string(),
            value: info.sequence.to_be_bytes().to_vec(),
        })
    }

    fn connection_proof(
        &self,
        _action: &str,
        _info: &ConnectionInfo,
        height: u64,
    ) -> Result<Proof, ProviderError> {
        Ok(Proof {
            bytes: b"proof".to_vec(),
            height,
        })
    }

    fn connection_message(
        &self,
        action: &str,
        _info: &ConnectionInfo,
        _proof: Proof,
    ) -> Result<AnyMsg, ProviderError> {
        Ok(AnyMsg {
            type_url: action.to_string(),
            value: Vec::new(),
        })
    }

    fn channel_proof(
        &self,
        _action: &str,
        _info: &ChannelInfo,
        height: u64,
    ) -> Result<Proof, ProviderError> {
        Ok(Proof {
            bytes: b"proof".to_vec(),
            height,
        })
    }

    fn channel_message(
        &self,
        action: &str,
        _info: &ChannelInfo,
        _proof: Proof,
    ) -> Result<AnyMsg, ProviderError> {
        Ok(AnyMsg {
            type_url: action.to_string(),
            value: Vec::new(),
        })
    }

    fn update_client_message(
        &self,
        _client_id: &ClientId,
        _trusted_height: u64,
        header: &dyn IbcHeader,
    ) -> Result<AnyMsg, ProviderError> {
        Ok(AnyMsg {
            type_url: MSG_UPDATE_CLIENT.to_string(),
            value: header.height().to_be_bytes().to_vec(),
        })
    }

    fn send_messages(&self, msgs: Vec<AnyMsg>) -> Result<(), ProviderError> {
        self.sent.lock().unwrap().push(msgs);
        Ok(())
    }
}

struct Rig {
    // Dropping the worker handle cancels the loop and joins the thread.
    worker: WorkerHandle,
    handle: PathProcessorHandle,
    sent_a: Sent,
    sent_b: Sent,
    chain_a: ChainId,
    chain_b: ChainId,
}

fn setup(
    lifecycle: Option<MessageLifecycle>,
    configure: impl FnOnce(&mut PathProcessor),
) -> Rig {
    let chain_a = ChainId::new("chain-a");
    let chain_b = ChainId::new("chain-b");

    let mut pp = PathProcessor::new(
        PathEnd::new(
            chain_a.clone(),
            ClientId::new("07-tendermint-0"),
            ConnectionId::new("connection-0"),
        ),
        PathEnd::new(
            chain_b.clone(),
            ClientId::new("07-tendermint-1"),
            ConnectionId::new("connection-1"),
        ),
    );

    let (provider_a, sent_a) = MockProvider::new("chain-a");
    let (provider_b, sent_b) = MockProvider::new("chain-b");
    assert!(pp.set_chain_provider(provider_a));
    assert!(pp.set_chain_provider(provider_b));

    configure(&mut pp);

    let handle = pp.handle();
    let worker = pp.spawn(CancellationToken::new(), lifecycle);

    Rig {
        worker,
        handle,
        sent_a,
        sent_b,
        chain_a,
        chain_b,
    }
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

fn key_a() -> ChannelKey {
    ChannelKey {
        channel_id: ChannelId::new("channel-0"),
        port_id: PortId::new("transfer"),
        counterparty_channel_id: ChannelId::new("channel-1"),
        counterparty_port_id: PortId::new("transfer"),
    }
}

fn header(height: u64) -> AnyIbcHeader {
    Arc::new(MockHeader { height })
}

fn snapshot(latest_height: u64, client_consensus: u64, client_id: &str) -> ChainProcessorCacheData {
    let mut data = ChainProcessorCacheData {
        in_sync: true,
        client_state: Some(ClientState {
            client_id: ClientId::new(client_id),
            consensus_height: client_consensus,
        }),
        latest_block: Some(LatestBlock {
            height: latest_height,
            time: 0,
        }),
        latest_header: Some(header(latest_height)),
        ..Default::default()
    };
    data.ibc_header_cache.insert(latest_height, header(latest_height));
    data
}

fn transfer(sequence: u64, observed_height: u64, timeout_height: u64) -> PacketInfo {
    PacketInfo {
        sequence,
        source_port: PortId::new("transfer"),
        source_channel: ChannelId::new("channel-0"),
        dest_port: PortId::new("transfer"),
        dest_channel: ChannelId::new("channel-1"),
        data: b"payload".to_vec(),
        timeout_height,
        height: observed_height,
        ..Default::default()
    }
}

fn type_urls(batch: &[AnyMsg]) -> Vec<&str> {
    batch.iter().map(|m| m.type_url.as_str()).collect()
}

fn batches_with(sent: &Sent, action: &str) -> usize {
    sent.lock()
        .unwrap()
        .iter()
        .filter(|batch| batch.iter().any(|m| m.type_url == action))
        .count()
}

#[test_log::test]
fn packet_happy_path_relays_recv_then_ack() {
    let recv_seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let recv_seen_sub = recv_seen.clone();

    let rig = setup(None, |pp| {
        pp.on_packet_message(&ChainId::new("chain-b"), MSG_RECV_PACKET, move |info| {
            recv_seen_sub.lock().unwrap().push(info.sequence);
        });
    });

    // Side A observed an outbound packet at height 100; side B is in sync
    // at height 50 with nothing relevant.
    let mut data_a = snapshot(100, 40, "07-tendermint-0");
    data_a.channel_state_cache.insert(key_a(), true);
    data_a
        .ibc_messages_cache
        .packet_flow
        .retain(&key_a(), MSG_TRANSFER, transfer(7, 100, 0));
    rig.handle.handle_new_data(&rig.chain_a, data_a);

    let mut data_b = snapshot(50, 95, "07-tendermint-1");
    data_b.channel_state_cache.insert(key_a().counterparty(), true);
    rig.handle.handle_new_data(&rig.chain_b, data_b);

    wait_for("recv packet toward chain B", || {
        batches_with(&rig.sent_b, MSG_RECV_PACKET) == 1
    });

    {
        let sent = rig.sent_b.lock().unwrap();
        let batch = sent.last().expect("one batch");
        // The client update for A@100 rides in front of the recv.
        assert_eq!(type_urls(batch), vec![MSG_UPDATE_CLIENT, MSG_RECV_PACKET]);
        assert_eq!(batch[0].value, 100u64.to_be_bytes().to_vec());
        assert_eq!(batch[1].value, 7u64.to_be_bytes().to_vec());
    }

    wait_for("recv subscriber callback", || {
        *recv_seen.lock().unwrap() == vec![7]
    });

    // Side B now observes the receive (carrying the acknowledgement) at
    // height 51; side A has no matching ack yet.
    let mut data_b = snapshot(51, 95, "07-tendermint-1");
    let mut recv = transfer(7, 51, 0);
    recv.ack = b"result".to_vec();
    data_b
        .ibc_messages_cache
        .packet_flow
        .retain(&key_a().counterparty(), MSG_RECV_PACKET, recv);
    rig.handle.handle_new_data(&rig.chain_b, data_b);

    wait_for("ack toward chain A", || {
        batches_with(&rig.sent_a, MSG_ACKNOWLEDGEMENT) == 1
    });

    let sent = rig.sent_a.lock().unwrap();
    let batch = sent.last().expect("one batch");
    assert_eq!(type_urls(batch), vec![MSG_UPDATE_CLIENT, MSG_ACKNOWLEDGEMENT]);
    // The ack is proven on B at its latest height.
    assert_eq!(batch[0].value, 51u64.to_be_bytes().to_vec());
    assert_eq!(batch[1].value, 7u64.to_be_bytes().to_vec());
}

#[test_log::test]
fn duplicate_recv_observations_produce_one_ack() {
    let rig = setup(None, |_| {});

    let mut data_a = snapshot(100, 40, "07-tendermint-0");
    data_a.channel_state_cache.insert(key_a(), true);
    data_a
        .ibc_messages_cache
        .packet_flow
        .retain(&key_a(), MSG_TRANSFER, transfer(7, 100, 0));
    rig.handle.handle_new_data(&rig.chain_a, data_a);

    // Two independent snapshots both carrying the same receive.
    for _ in 0..2 {
        let mut data_b = snapshot(51, 95, "07-tendermint-1");
        data_b.channel_state_cache.insert(key_a().counterparty(), true);
        let mut recv = transfer(7, 51, 0);
        recv.ack = b"result".to_vec();
        data_b
            .ibc_messages_cache
            .packet_flow
            .retain(&key_a().counterparty(), MSG_RECV_PACKET, recv);
        rig.handle.handle_new_data(&rig.chain_b, data_b);
    }

    wait_for("ack toward chain A", || {
        batches_with(&rig.sent_a, MSG_ACKNOWLEDGEMENT) >= 1
    });

    // No duplicate submission: the cache stored one entry and the retry
    // bookkeeping blocks a resend until new blocks arrive.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(batches_with(&rig.sent_a, MSG_ACKNOWLEDGEMENT), 1);
}

#[test_log::test]
fn expired_packet_times_out_toward_source() {
    let rig = setup(None, |_| {});

    // Packet with timeout height 50; destination is already at height 60.
    let mut data_a = snapshot(100, 40, "07-tendermint-0");
    data_a.channel_state_cache.insert(key_a(), true);
    data_a
        .ibc_messages_cache
        .packet_flow
        .retain(&key_a(), MSG_TRANSFER, transfer(9, 100, 50));
    rig.handle.handle_new_data(&rig.chain_a, data_a);

    let mut data_b = snapshot(60, 95, "07-tendermint-1");
    data_b.channel_state_cache.insert(key_a().counterparty(), true);
    rig.handle.handle_new_data(&rig.chain_b, data_b);

    wait_for("timeout toward chain A", || {
        batches_with(&rig.sent_a, MSG_TIMEOUT) == 1
    });

    let sent = rig.sent_a.lock().unwrap();
    let batch = sent.last().expect("one batch");
    assert_eq!(type_urls(batch), vec![MSG_UPDATE_CLIENT, MSG_TIMEOUT]);
    assert_eq!(batch[1].value, 9u64.to_be_bytes().to_vec());
    // Nothing was submitted toward the closed-out destination.
    assert!(rig.sent_b.lock().unwrap().is_empty());
}

#[test_log::test]
fn no_messages_until_both_sides_in_sync() {
    let rig = setup(None, |_| {});

    let mut data_a = snapshot(100, 40, "07-tendermint-0");
    data_a.in_sync = false;
    data_a.channel_state_cache.insert(key_a(), true);
    data_a
        .ibc_messages_cache
        .packet_flow
        .retain(&key_a(), MSG_TRANSFER, transfer(7, 100, 0));
    rig.handle.handle_new_data(&rig.chain_a, data_a);

    let mut data_b = snapshot(50, 95, "07-tendermint-1");
    data_b.channel_state_cache.insert(key_a().counterparty(), true);
    rig.handle.handle_new_data(&rig.chain_b, data_b);

    thread::sleep(Duration::from_millis(400));
    assert!(rig.sent_b.lock().unwrap().is_empty());

    // Side A catches up; the pending transfer is relayed.
    rig.handle
        .handle_new_data(&rig.chain_a, snapshot(100, 40, "07-tendermint-0"));

    wait_for("recv packet toward chain B", || {
        batches_with(&rig.sent_b, MSG_RECV_PACKET) == 1
    });
}

#[test_log::test]
fn lifecycle_sends_initial_and_stops_on_termination() {
    let lifecycle = MessageLifecycle::Packet(PacketMessageLifecycle {
        initial: Some(PacketMessage {
            chain_id: ChainId::new("chain-a"),
            action: MSG_TRANSFER.to_string(),
            info: transfer(7, 0, 0),
        }),
        termination: Some(PacketMessage {
            chain_id: ChainId::new("chain-a"),
            action: MSG_ACKNOWLEDGEMENT.to_string(),
            info: transfer(7, 0, 0),
        }),
    });

    let rig = setup(Some(lifecycle), |_| {});

    // First round after both sides are in sync submits the initial message.
    rig.handle
        .handle_new_data(&rig.chain_a, snapshot(100, 40, "07-tendermint-0"));
    rig.handle
        .handle_new_data(&rig.chain_b, snapshot(50, 95, "07-tendermint-1"));

    wait_for("initial transfer on chain A", || {
        batches_with(&rig.sent_a, MSG_TRANSFER) == 1
    });
    assert!(!rig.worker.is_stopped());

    // Re-notifying does not re-send the initial message.
    rig.handle
        .handle_new_data(&rig.chain_a, snapshot(101, 40, "07-tendermint-0"));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(batches_with(&rig.sent_a, MSG_TRANSFER), 1);

    // Once side A observes the acknowledgement, the processor stops.
    let mut data_a = snapshot(102, 40, "07-tendermint-0");
    data_a
        .ibc_messages_cache
        .packet_flow
        .retain(&key_a(), MSG_ACKNOWLEDGEMENT, transfer(7, 102, 0));
    rig.handle.handle_new_data(&rig.chain_a, data_a);

    wait_for("worker shutdown", || rig.worker.is_stopped());
}
