//! In-memory stand-ins for the board. Each fake is a cheap handle; clones
//! share state so a test can keep one while the device owns another.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use crate::{
    hal::{
        AccessPointSettings, ByteStore, InboundMessage, MqttTransport, Platform, QoS, RadioError,
        RelayPin, SessionOptions, StationCredentials, StorageError, TransportError, WifiRadio,
    },
    http::{HttpRequest, HttpResponse, HttpSurface},
    types::ScanEntry,
};

#[derive(Debug)]
struct MemoryInner {
    staged: Vec<u8>,
    committed: Vec<u8>,
    commits: usize,
    write_offsets: Vec<usize>,
    fail_writes: bool,
}

/// Byte store with commit semantics. Starts erased (0xFF).
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Rc<RefCell<MemoryInner>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(MemoryInner {
                staged: vec![0xFF; capacity],
                committed: vec![0xFF; capacity],
                commits: 0,
                write_offsets: Vec::new(),
                fail_writes: false,
            })),
        }
    }

    pub fn committed(&self) -> Vec<u8> {
        self.inner.borrow().committed.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.inner.borrow().commits
    }

    pub fn write_offsets(&self) -> Vec<usize> {
        self.inner.borrow().write_offsets.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.borrow_mut().fail_writes = fail;
    }

    /// Drops everything written since the last commit.
    pub fn power_cycle(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.staged = inner.committed.clone();
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), StorageError> {
        let capacity = self.capacity();
        if offset.checked_add(len).map_or(true, |end| end > capacity) {
            return Err(StorageError::OutOfRange {
                offset,
                len,
                capacity,
            });
        }
        Ok(())
    }
}

impl ByteStore for MemoryStore {
    fn capacity(&self) -> usize {
        self.inner.borrow().staged.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check(offset, buf.len())?;
        buf.copy_from_slice(&self.inner.borrow().staged[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StorageError> {
        if self.inner.borrow().fail_writes {
            return Err(StorageError::Backend("injected write failure".to_string()));
        }
        self.check(offset, bytes.len())?;
        let mut inner = self.inner.borrow_mut();
        inner.staged[offset..offset + bytes.len()].copy_from_slice(bytes);
        inner.write_offsets.push(offset);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_writes {
            return Err(StorageError::Backend("injected commit failure".to_string()));
        }
        inner.committed = inner.staged.clone();
        inner.commits += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPin {
    levels: Rc<RefCell<Vec<bool>>>,
}

impl RecordingPin {
    pub fn levels(&self) -> Vec<bool> {
        self.levels.borrow().clone()
    }

    pub fn last_level(&self) -> Option<bool> {
        self.levels.borrow().last().copied()
    }
}

impl RelayPin for RecordingPin {
    fn set_level(&mut self, high: bool) {
        self.levels.borrow_mut().push(high);
    }
}

type Configuration = (Option<StationCredentials>, Option<AccessPointSettings>);

#[derive(Debug, Default)]
struct RadioInner {
    available: bool,
    associating: bool,
    connect_calls: usize,
    configurations: Vec<Configuration>,
    fail_configure: bool,
    scanning: bool,
    scan_calls: usize,
    scan_results: Option<Vec<ScanEntry>>,
}

/// Radio whose station link comes up once a connect was issued and the
/// network is marked available.
#[derive(Debug, Clone, Default)]
pub struct FakeRadio {
    inner: Rc<RefCell<RadioInner>>,
}

impl FakeRadio {
    pub fn set_available(&self, available: bool) {
        self.inner.borrow_mut().available = available;
    }

    /// Link loss: the driver needs a fresh connect.
    pub fn drop_link(&self) {
        self.inner.borrow_mut().associating = false;
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.borrow().connect_calls
    }

    pub fn fail_configure(&self, fail: bool) {
        self.inner.borrow_mut().fail_configure = fail;
    }

    pub fn configure_calls(&self) -> usize {
        self.inner.borrow().configurations.len()
    }

    pub fn last_configuration(&self) -> Option<Configuration> {
        self.inner.borrow().configurations.last().cloned()
    }

    pub fn set_scan_results(&self, results: Vec<ScanEntry>) {
        self.inner.borrow_mut().scan_results = Some(results);
    }

    pub fn scan_calls(&self) -> usize {
        self.inner.borrow().scan_calls
    }
}

impl WifiRadio for FakeRadio {
    fn configure(
        &mut self,
        station: Option<&StationCredentials>,
        access_point: Option<&AccessPointSettings>,
    ) -> Result<(), RadioError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_configure {
            return Err(RadioError::Driver("injected configure failure".to_string()));
        }
        inner
            .configurations
            .push((station.cloned(), access_point.cloned()));
        Ok(())
    }

    fn connect_station(&mut self) -> Result<(), RadioError> {
        let mut inner = self.inner.borrow_mut();
        inner.connect_calls += 1;
        inner.associating = true;
        Ok(())
    }

    fn station_connected(&self) -> bool {
        let inner = self.inner.borrow();
        inner.associating && inner.available
    }

    fn start_scan(&mut self) -> Result<(), RadioError> {
        let mut inner = self.inner.borrow_mut();
        inner.scan_calls += 1;
        inner.scanning = true;
        Ok(())
    }

    fn scan_results(&mut self) -> Option<Vec<ScanEntry>> {
        let mut inner = self.inner.borrow_mut();
        if !inner.scanning {
            return None;
        }
        let results = inner.scan_results.clone()?;
        inner.scanning = false;
        Some(results)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: String,
}

#[derive(Debug)]
struct TransportInner {
    accept: bool,
    auto_ack: bool,
    fail_subscribe: bool,
    connected: bool,
    connect_calls: usize,
    disconnect_calls: usize,
    client_id: Option<String>,
    will: Option<RecordedWill>,
    published: Vec<Published>,
    subscriptions: Vec<(String, QoS)>,
    inbound: VecDeque<InboundMessage>,
}

impl Default for TransportInner {
    fn default() -> Self {
        Self {
            accept: true,
            auto_ack: true,
            fail_subscribe: false,
            connected: false,
            connect_calls: 0,
            disconnect_calls: 0,
            client_id: None,
            will: None,
            published: Vec::new(),
            subscriptions: Vec::new(),
            inbound: VecDeque::new(),
        }
    }
}

/// Broker stand-in. Accepts and acknowledges connects by default.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    inner: Rc<RefCell<TransportInner>>,
}

impl RecordingTransport {
    pub fn set_accept(&self, accept: bool) {
        self.inner.borrow_mut().accept = accept;
    }

    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.inner.borrow_mut().auto_ack = auto_ack;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner.borrow_mut().fail_subscribe = fail;
    }

    pub fn ack(&self) {
        self.inner.borrow_mut().connected = true;
    }

    pub fn drop_connection(&self) {
        self.inner.borrow_mut().connected = false;
    }

    pub fn deliver(&self, topic: &str, payload: &str) {
        self.inner.borrow_mut().inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }

    pub fn pending_inbound(&self) -> usize {
        self.inner.borrow().inbound.len()
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.borrow().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.inner.borrow().disconnect_calls
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.borrow().client_id.clone()
    }

    pub fn last_will(&self) -> Option<RecordedWill> {
        self.inner.borrow().will.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.inner.borrow().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.inner
            .borrow()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.inner.borrow().subscriptions.clone()
    }
}

impl MqttTransport for RecordingTransport {
    fn connect(&mut self, options: &SessionOptions<'_>) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        inner.connect_calls += 1;
        inner.client_id = Some(options.client_id.to_string());
        inner.will = Some(RecordedWill {
            topic: options.will.topic.to_string(),
            payload: options.will.payload.to_vec(),
            qos: options.will.qos,
            retain: options.will.retain,
        });
        if !inner.accept {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        inner.connected = inner.auto_ack;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    fn disconnect(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.connected = false;
        inner.disconnect_calls += 1;
    }

    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        inner.published.push(Published {
            topic: topic.to_string(),
            qos,
            retain,
            payload: String::from_utf8_lossy(payload).into_owned(),
        });
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_subscribe {
            return Err(TransportError::Client("subscribe rejected".to_string()));
        }
        inner.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    fn poll_message(&mut self) -> Option<InboundMessage> {
        let mut inner = self.inner.borrow_mut();
        if !inner.connected {
            return None;
        }
        inner.inbound.pop_front()
    }
}

/// Clock that only moves when told to, or when the code under test sleeps.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Rc<Cell<u64>>,
    free_heap: Rc<Cell<u32>>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Rc::new(Cell::new(start_ms)),
            free_heap: Rc::new(Cell::new(64 * 1024)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get() + ms);
    }

    pub fn set_free_heap(&self, bytes: u32) {
        self.free_heap.set(bytes);
    }
}

impl Platform for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }

    fn delay_ms(&self, ms: u64) {
        self.advance(ms);
    }

    fn free_heap(&self) -> u32 {
        self.free_heap.get()
    }
}

#[derive(Debug, Default)]
struct SurfaceInner {
    pending: VecDeque<HttpRequest>,
    responses: Vec<HttpResponse>,
}

/// Requests queued by the test, answered on the next `serve`.
#[derive(Debug, Clone, Default)]
pub struct QueuedSurface {
    inner: Rc<RefCell<SurfaceInner>>,
}

impl QueuedSurface {
    pub fn push(&self, request: HttpRequest) {
        self.inner.borrow_mut().pending.push_back(request);
    }

    pub fn responses(&self) -> Vec<HttpResponse> {
        self.inner.borrow().responses.clone()
    }

    pub fn last_response(&self) -> Option<HttpResponse> {
        self.inner.borrow().responses.last().cloned()
    }
}

impl HttpSurface for QueuedSurface {
    fn serve(&mut self, handler: &mut dyn FnMut(HttpRequest) -> HttpResponse) {
        loop {
            let Some(request) = self.inner.borrow_mut().pending.pop_front() else {
                break;
            };
            let response = handler(request);
            self.inner.borrow_mut().responses.push(response);
        }
    }
}
