// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

use std::sync::atomic::AtomicUsize;

use super::*;
use crate::{
    connection::{ConnectionCache, Hub},
    listener::NoListener,
    ump::MessageType,
    worker::WorkerHandle,
};

struct FakeDevice {
    id: EndpointId,
    hub: Hub,
    sent: Mutex<Vec<u32>>,
}

impl SharedDevice for FakeDevice {
    fn endpoint_id(&self) -> &EndpointId {
        &self.id
    }

    fn hub(&self) -> &Hub {
        &self.hub
    }

    fn send(&self, words: &[u32]) -> bool {
        self.sent.lock().extend_from_slice(words);
        true
    }
}

#[derive(Default)]
struct FakeVirtualDevice {
    reject: bool,
}

impl VirtualDevice for FakeVirtualDevice {
    fn update_name(&self, _name: &str) -> bool {
        !self.reject
    }

    fn update_block(&self, _index: usize, _block: &Block) -> bool {
        !self.reject
    }
}

struct FakeSessionBackend {
    worker: WorkerHandle,
    cache: ConnectionCache<FakeDevice>,
    opened: Mutex<Vec<Arc<FakeDevice>>>,
}

impl FakeSessionBackend {
    fn new(worker: WorkerHandle) -> Self {
        Self {
            worker,
            cache: Default::default(),
            opened: Default::default(),
        }
    }

    fn device(&self, index: usize) -> Arc<FakeDevice> {
        Arc::clone(&self.opened.lock()[index])
    }
}

impl SessionBackend for Arc<FakeSessionBackend> {
    fn open_device(&self, kind: IoKind, id: &EndpointId) -> Option<Arc<dyn SharedDevice>> {
        let native_id = id.get(kind);
        if native_id == "missing" {
            return None;
        }
        let device = self.cache.open(&EndpointId::bidirectional(native_id), |id| {
            let device = Arc::new(FakeDevice {
                id: id.clone(),
                hub: Hub::new(self.worker.clone()),
                sent: Default::default(),
            });
            self.opened.lock().push(Arc::clone(&device));
            Some(device)
        })?;
        Some(device)
    }

    fn create_virtual_device(
        &self,
        config: &VirtualEndpointConfig,
    ) -> Option<(EndpointAndStaticInfo, Box<dyn VirtualDevice>)> {
        let id = EndpointId::bidirectional(format!("virtual-{}", config.name));
        let info = StaticDeviceInfo::default()
            .with_name(config.name.clone())
            .with_has_source(true)
            .with_has_destination(true);
        let entry = EndpointAndStaticInfo {
            id,
            endpoint: config.to_endpoint(),
            info,
        };
        Some((entry, Box::new(FakeVirtualDevice::default())))
    }
}

struct Fixture {
    backend: Arc<FakeSessionBackend>,
    registry: Arc<Registry>,
    session: Session,
}

impl Fixture {
    fn new() -> Self {
        let worker = WorkerHandle::spawn("test-session").unwrap();
        let registry = Arc::new(Registry::new(worker.clone(), Arc::new(NoListener)));
        let backend = Arc::new(FakeSessionBackend::new(worker));
        let session = Session::new(
            "test",
            Arc::clone(&registry),
            Box::new(Arc::clone(&backend)),
        );
        Self {
            backend,
            registry,
            session,
        }
    }

    fn flush(&self) {
        assert!(self.registry.worker().flush());
    }
}

#[derive(Default)]
struct Received {
    packets: Mutex<Vec<Vec<u32>>>,
}

impl Consumer for Received {
    fn consume(&self, packet: View<'_>, _timestamp: f64) {
        self.packets.lock().push(packet.words().to_vec());
    }
}

#[derive(Default)]
struct CountingListener {
    count: AtomicUsize,
}

impl DisconnectionListener for CountingListener {
    fn disconnected(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

const NOTE_ON: u32 = 0x2090_3c64;

#[test]
fn inputs_forward_packets_in_the_requested_protocol() {
    let fixture = Fixture::new();
    let id = EndpointId::bidirectional("usb-1");
    let midi1 = Arc::new(Received::default());
    let midi2 = Arc::new(Received::default());
    let _input1 = fixture
        .session
        .connect_input(
            Arc::new(NoListener),
            &id,
            PacketProtocol::Midi1,
            Arc::clone(&midi1) as _,
        )
        .unwrap();
    let input2 = fixture
        .session
        .connect_input(
            Arc::new(NoListener),
            &id,
            PacketProtocol::Midi2,
            Arc::clone(&midi2) as _,
        )
        .unwrap();
    assert_eq!(PacketProtocol::Midi2, input2.protocol());
    assert_eq!(&id, input2.endpoint_id());

    // Both inputs share a single device
    assert_eq!(1, fixture.backend.opened.lock().len());
    fixture.backend.device(0).hub().deliver_words(&[NOTE_ON], 0.5);

    assert_eq!(vec![vec![NOTE_ON]], *midi1.packets.lock());
    let midi2 = midi2.packets.lock();
    assert_eq!(1, midi2.len());
    assert_eq!(
        MessageType::Midi2ChannelVoice,
        MessageType::from_word(midi2[0][0])
    );
    assert_eq!(0x4090_3c00, midi2[0][0]);
}

#[test]
fn dropped_inputs_receive_nothing() {
    let fixture = Fixture::new();
    let id = EndpointId::bidirectional("usb-1");
    let received = Arc::new(Received::default());
    let input = fixture
        .session
        .connect_input(
            Arc::new(NoListener),
            &id,
            PacketProtocol::Midi1,
            Arc::clone(&received) as _,
        )
        .unwrap();
    let device = fixture.backend.device(0);
    drop(input);
    device.hub().deliver_words(&[NOTE_ON], 0.0);
    assert!(received.packets.lock().is_empty());
}

#[test]
fn disconnection_is_reported_once_per_connection() {
    let fixture = Fixture::new();
    let id = EndpointId::bidirectional("usb-1");
    let input_listener = Arc::new(CountingListener::default());
    let output_listener = Arc::new(CountingListener::default());
    let received = Arc::new(Received::default());
    let input = fixture
        .session
        .connect_input(
            Arc::clone(&input_listener) as _,
            &id,
            PacketProtocol::Midi1,
            Arc::clone(&received) as _,
        )
        .unwrap();
    let output = fixture
        .session
        .connect_output(Arc::clone(&output_listener) as _, &id)
        .unwrap();
    assert!(output.send(&[NOTE_ON]));

    let device = fixture.backend.device(0);
    device.hub().notify_disconnected();
    device.hub().notify_disconnected();
    fixture.flush();

    assert_eq!(1, input_listener.count.load(Ordering::SeqCst));
    assert_eq!(1, output_listener.count.load(Ordering::SeqCst));
    assert!(input.is_disconnected());
    assert!(output.is_disconnected());
    assert!(!output.send(&[NOTE_ON]));
    assert_eq!(vec![NOTE_ON], *device.sent.lock());

    device.hub().deliver_words(&[NOTE_ON], 0.0);
    assert!(received.packets.lock().is_empty());
}

#[test]
fn inputs_and_outputs_agree_on_disconnection_before_notification() {
    let fixture = Fixture::new();
    let id = EndpointId::bidirectional("usb-1");
    let input_listener = Arc::new(CountingListener::default());
    let input = fixture
        .session
        .connect_input(
            Arc::clone(&input_listener) as _,
            &id,
            PacketProtocol::Midi1,
            Arc::new(Received::default()),
        )
        .unwrap();
    let output = fixture
        .session
        .connect_output(Arc::new(NoListener), &id)
        .unwrap();
    assert!(!input.is_disconnected());

    fixture.backend.device(0).hub().notify_disconnected();
    assert!(input.is_disconnected());
    assert!(output.is_disconnected());

    fixture.flush();
    assert_eq!(1, input_listener.count.load(Ordering::SeqCst));
}

#[test]
fn reconnecting_requires_releasing_the_disconnected_device() {
    let fixture = Fixture::new();
    let id = EndpointId::bidirectional("usb-1");
    let output = fixture
        .session
        .connect_output(Arc::new(NoListener), &id)
        .unwrap();
    fixture.backend.device(0).hub().notify_disconnected();
    fixture.flush();
    assert!(!output.send(&[NOTE_ON]));

    // The disconnected device is still in use
    assert!(fixture
        .session
        .connect_output(Arc::new(NoListener), &id)
        .is_none());
    assert_eq!(1, fixture.backend.opened.lock().len());

    drop(output);
    fixture.backend.opened.lock().clear();
    let reconnected = fixture
        .session
        .connect_output(Arc::new(NoListener), &id)
        .unwrap();
    assert_eq!(1, fixture.backend.opened.lock().len());
    assert!(reconnected.send(&[NOTE_ON]));
    assert_eq!(vec![NOTE_ON], *fixture.backend.device(0).sent.lock());
}

#[test]
fn failed_opens_yield_no_connection() {
    let fixture = Fixture::new();
    let id = EndpointId::bidirectional("missing");
    assert!(fixture
        .session
        .connect_output(Arc::new(NoListener), &id)
        .is_none());
    assert!(fixture
        .session
        .connect_input(
            Arc::new(NoListener),
            &id,
            PacketProtocol::Midi1,
            Arc::new(Received::default()),
        )
        .is_none());
}

#[test]
fn sending_nothing_succeeds() {
    let fixture = Fixture::new();
    let output = fixture
        .session
        .connect_output(Arc::new(NoListener), &EndpointId::make(IoKind::Dst, "out"))
        .unwrap();
    assert!(output.send(&[]));
    assert!(fixture.backend.device(0).sent.lock().is_empty());
}

#[test]
fn virtual_endpoints_are_visible_while_alive() {
    let fixture = Fixture::new();
    assert_eq!("test", fixture.session.name());
    let config = VirtualEndpointConfig::new("Synth").with_blocks([
        Block::legacy("A", BlockDirection::Bidirectional),
        Block::legacy("B", BlockDirection::Sender),
    ]);
    let virtual_endpoint = fixture.session.create_virtual_endpoint(&config).unwrap();
    let id = virtual_endpoint.id();
    assert_eq!("Synth", fixture.registry.endpoint(&id).unwrap().name());

    assert!(virtual_endpoint.set_name("Renamed"));
    assert_eq!("Renamed", fixture.registry.endpoint(&id).unwrap().name());

    let mut block = Block::legacy("C", BlockDirection::Receiver);
    block.first_group = 3;
    assert!(virtual_endpoint.set_block(1, block.clone()));
    assert!(!virtual_endpoint.set_block(2, block.clone()));
    assert_eq!(&block, &virtual_endpoint.endpoint().blocks()[1]);

    drop(virtual_endpoint);
    assert!(fixture.registry.endpoint(&id).is_none());
}

#[test]
fn legacy_virtual_endpoints_have_a_single_midi1_block() {
    let fixture = Fixture::new();
    let input = fixture.session.create_legacy_virtual_input("In").unwrap();
    let output = fixture.session.create_legacy_virtual_output("Out").unwrap();
    let input_endpoint = input.endpoint();
    let output_endpoint = output.endpoint();
    assert_eq!(PacketProtocol::Midi1, input_endpoint.protocol());
    assert_eq!(1, input_endpoint.blocks().len());
    assert_eq!(BlockDirection::Receiver, input_endpoint.blocks()[0].direction);
    assert_eq!(BlockDirection::Sender, output_endpoint.blocks()[0].direction);
}

#[test]
fn rejected_virtual_updates_keep_the_previous_state() {
    let entry = make_entry("Keep");
    let virtual_endpoint = VirtualEndpoint {
        entry: Arc::new(RwLock::new(entry)),
        device: Box::new(FakeVirtualDevice { reject: true }),
    };
    assert!(!virtual_endpoint.set_name("Other"));
    assert!(!virtual_endpoint.set_block(0, Block::default()));
    assert_eq!("Keep", virtual_endpoint.endpoint().name());
}

fn make_entry(name: &str) -> EndpointAndStaticInfo {
    EndpointAndStaticInfo {
        id: EndpointId::bidirectional(name),
        endpoint: VirtualEndpointConfig::legacy(name, BlockDirection::Bidirectional).to_endpoint(),
        info: StaticDeviceInfo::default().with_name(name),
    }
}
