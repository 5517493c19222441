//! BLE client for talking to an echo server through the initiator session.
//!
//! The session is synchronous: its [`GattClient`] requests are queued on a
//! channel and executed by a driver task against btleplug. Completions,
//! notifications and disconnects come back on a second channel and are fed
//! into the session one at a time by [`EchoClient::pump`].

#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use uuid::Uuid;

use ble_echo_firmware::gatt::{
    Attribute, Clock, GattClient, GattError, PeerId, ServiceHandle,
};
use ble_echo_firmware::protocol::{MessageAssembler, Properties, WriteMode};
use ble_echo_firmware::session::{
    InitiatorDelegate, InitiatorSession, SendError, SessionConfig, SessionError, SessionState,
};

/// How long a single pump waits before re-checking the ack timeout
const PUMP_SLICE: Duration = Duration::from_millis(100);

/// Request issued by the session, executed by the driver task
#[derive(Debug)]
enum GattRequest {
    DiscoverService(Uuid),
    DiscoverAttributes(Uuid, Vec<Uuid>),
    Write(Uuid, Vec<u8>, WriteMode),
    Read(Uuid, usize),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
}

/// Result of a request, or an unsolicited event from the peripheral
#[derive(Debug)]
enum GattCompletion {
    ServicesDiscovered(Result<Vec<ServiceHandle>, GattError>),
    AttributesDiscovered(Result<Vec<Attribute>, GattError>),
    Subscribed(Result<(), GattError>),
    WriteComplete(Result<(), GattError>),
    ReadResponse(Result<Vec<u8>, GattError>),
    Notification(Uuid, Vec<u8>),
    Disconnected,
}

/// [`GattClient`] that forwards requests to the driver task
pub struct ChannelGatt {
    requests: UnboundedSender<GattRequest>,
}

impl ChannelGatt {
    fn send(&self, request: GattRequest) -> Result<(), GattError> {
        self.requests
            .send(request)
            .map_err(|_| GattError::NotConnected)
    }
}

impl GattClient for ChannelGatt {
    fn discover_service(&mut self, _peer: PeerId, service: Uuid) -> Result<(), GattError> {
        self.send(GattRequest::DiscoverService(service))
    }

    fn discover_attributes(
        &mut self,
        _peer: PeerId,
        service: ServiceHandle,
        ids: &[Uuid],
    ) -> Result<(), GattError> {
        self.send(GattRequest::DiscoverAttributes(service.uuid, ids.to_vec()))
    }

    fn write_attribute(
        &mut self,
        _peer: PeerId,
        attribute: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), GattError> {
        self.send(GattRequest::Write(attribute, value.to_vec(), mode))
    }

    fn read_attribute(
        &mut self,
        _peer: PeerId,
        attribute: Uuid,
        offset: usize,
    ) -> Result<(), GattError> {
        self.send(GattRequest::Read(attribute, offset))
    }

    fn subscribe(&mut self, _peer: PeerId, attribute: Uuid) -> Result<(), GattError> {
        self.send(GattRequest::Subscribe(attribute))
    }

    fn unsubscribe(&mut self, _peer: PeerId, attribute: Uuid) -> Result<(), GattError> {
        self.send(GattRequest::Unsubscribe(attribute))
    }
}

/// Wall-clock milliseconds since the client was created
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Collects session callbacks and reassembles echoed frames into messages
#[derive(Default)]
pub struct CollectingDelegate {
    assembler: MessageAssembler,
    /// Complete echoed messages, terminator stripped
    pub messages: VecDeque<String>,
    /// Every decoded notification, in arrival order
    pub fragments: Vec<String>,
    pub errors: Vec<SessionError>,
    pub states: Vec<SessionState>,
    pub completed: usize,
}

impl InitiatorDelegate for CollectingDelegate {
    fn on_message_received(&mut self, text: &str) {
        self.fragments.push(text.to_string());
        match self.assembler.push(text.as_bytes()) {
            Ok(Some(message)) => {
                self.messages
                    .push_back(String::from_utf8_lossy(&message).into_owned());
            }
            Ok(None) => {}
            Err(e) => log::warn!("reassembly reset: {}", e),
        }
    }

    fn on_capabilities_discovered(&mut self, attributes: &[Attribute]) {
        for attribute in attributes {
            log::info!(
                "characteristic {} properties 0x{:02x}",
                attribute.id,
                attribute.properties.bits()
            );
        }
    }

    fn on_state_changed(&mut self, state: SessionState) {
        log::debug!("session state {:?}", state);
        self.states.push(state);
    }

    fn on_transfer_complete(&mut self) {
        self.completed += 1;
    }

    fn on_error(&mut self, error: SessionError) {
        log::warn!("session error: {}", error);
        self.errors.push(error);
    }
}

pub type EchoSession = InitiatorSession<ChannelGatt, CollectingDelegate, SystemClock>;

/// Connected echo client
pub struct EchoClient {
    peripheral: Peripheral,
    session: EchoSession,
    completions: UnboundedReceiver<GattCompletion>,
}

impl EchoClient {
    /// Scan for a device by name, connect and run discovery until the session is ready.
    pub async fn connect_by_name(
        name: &str,
        scan_timeout: Duration,
        config: SessionConfig,
    ) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapters found"))?;

        adapter.start_scan(ScanFilter::default()).await?;
        let peripheral = find_device_by_name(&adapter, name, scan_timeout).await?;
        adapter.stop_scan().await?;

        peripheral.connect().await?;
        log::info!("connected to '{}'", name);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        tokio::spawn(forward_notifications(peripheral.clone(), completion_tx.clone()));
        tokio::spawn(watch_disconnect(adapter, peripheral.clone(), completion_tx.clone()));
        tokio::spawn(drive(peripheral.clone(), request_rx, completion_tx));

        let session = InitiatorSession::connect(
            PeerId(0),
            ChannelGatt {
                requests: request_tx,
            },
            CollectingDelegate::default(),
            SystemClock::new(),
            config,
        );

        let mut client = Self {
            peripheral,
            session,
            completions: completion_rx,
        };
        client.wait_until_ready(scan_timeout).await?;
        Ok(client)
    }

    pub fn session(&self) -> &EchoSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut EchoSession {
        &mut self.session
    }

    pub fn delegate(&self) -> &CollectingDelegate {
        self.session.delegate()
    }

    /// Feed at most one completion into the session, then check the ack timeout.
    ///
    /// Returns false if nothing arrived within `wait`.
    pub async fn pump(&mut self, wait: Duration) -> bool {
        let completion = match timeout(wait, self.completions.recv()).await {
            Ok(Some(completion)) => completion,
            Ok(None) => GattCompletion::Disconnected,
            Err(_) => {
                self.session.check_timeout();
                return false;
            }
        };

        log::trace!("completion {:?}", completion);
        match completion {
            GattCompletion::ServicesDiscovered(result) => {
                self.session.on_services_discovered(result.as_deref().map_err(|e| *e));
            }
            GattCompletion::AttributesDiscovered(result) => {
                self.session
                    .on_capabilities_discovered(result.as_deref().map_err(|e| *e));
            }
            GattCompletion::Subscribed(result) => self.session.on_subscribed(result),
            GattCompletion::WriteComplete(result) => self.session.on_write_complete(result),
            GattCompletion::ReadResponse(result) => {
                self.session.on_read_response(result.as_deref().map_err(|e| *e));
            }
            GattCompletion::Notification(uuid, value) => {
                if uuid == self.session.config().outbox {
                    self.session.on_remote_update(&value);
                }
            }
            GattCompletion::Disconnected => self.session.on_disconnect(),
        }
        self.session.check_timeout();
        true
    }

    /// Pump until discovery reaches `Ready`.
    pub async fn wait_until_ready(&mut self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        while !self.session.is_ready() {
            if self.session.state() == SessionState::Disconnected {
                bail!("discovery failed: {:?}", self.delegate().errors.last());
            }
            if Instant::now() >= deadline {
                bail!("discovery stuck in {:?}", self.session.state());
            }
            self.pump(PUMP_SLICE).await;
        }
        Ok(())
    }

    /// Start sending `text`. Frames after the first go out as acknowledgements arrive.
    pub fn start_send(&mut self, text: &str) -> Result<(), SendError> {
        self.session.send(text)
    }

    /// Send `text` and pump until its last frame is acknowledged.
    pub async fn send(&mut self, text: &str, limit: Duration) -> Result<()> {
        let completed = self.delegate().completed;
        let errors = self.delegate().errors.len();
        self.session.send(text).map_err(|e| anyhow!("send rejected: {}", e))?;

        let deadline = Instant::now() + limit;
        while self.delegate().completed == completed {
            if let Some(error) = self.delegate().errors.get(errors) {
                bail!("transfer failed: {}", error);
            }
            if Instant::now() >= deadline {
                bail!("transfer stalled at {:?}", self.session.transfer_progress());
            }
            self.pump(PUMP_SLICE).await;
        }
        Ok(())
    }

    /// Pump until a complete echoed message is available.
    pub async fn next_message(&mut self, limit: Duration) -> Result<String> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(message) = self.session.delegate_mut().messages.pop_front() {
                return Ok(message);
            }
            if self.session.state() == SessionState::Disconnected {
                bail!("disconnected while waiting for echo");
            }
            if Instant::now() >= deadline {
                bail!("timeout waiting for echo");
            }
            self.pump(PUMP_SLICE).await;
        }
    }

    /// Drain completions that are already queued.
    pub async fn settle(&mut self, quiet: Duration) {
        while self.pump(quiet).await {}
    }

    /// Forget buffered messages and fragments.
    pub fn clear(&mut self) {
        let delegate = self.session.delegate_mut();
        delegate.messages.clear();
        delegate.fragments.clear();
        delegate.errors.clear();
    }

    /// Unsubscribe and disconnect.
    pub async fn disconnect(mut self) -> Result<()> {
        self.session.close();
        // Give the driver a moment to send the unsubscribe
        tokio::time::sleep(PUMP_SLICE).await;
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Find a device by name within the scan timeout.
async fn find_device_by_name(
    adapter: &Adapter,
    name: &str,
    scan_timeout: Duration,
) -> Result<Peripheral> {
    let start = Instant::now();

    while start.elapsed() < scan_timeout {
        for peripheral in adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await? {
                if props.local_name.as_deref() == Some(name) {
                    return Ok(peripheral);
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Err(anyhow!("Device '{}' not found within timeout", name))
}

fn gatt_error(err: btleplug::Error) -> GattError {
    log::debug!("btleplug: {}", err);
    match err {
        btleplug::Error::NotConnected => GattError::NotConnected,
        btleplug::Error::TimedOut(_) => GattError::Timeout,
        _ => GattError::Failed,
    }
}

fn properties(flags: CharPropFlags) -> Properties {
    let mut properties = Properties::NONE;
    for (flag, property) in [
        (CharPropFlags::READ, Properties::READ),
        (CharPropFlags::WRITE_WITHOUT_RESPONSE, Properties::WRITE_WITHOUT_RESPONSE),
        (CharPropFlags::WRITE, Properties::WRITE),
        (CharPropFlags::NOTIFY, Properties::NOTIFY),
    ] {
        if flags.contains(flag) {
            properties = properties | property;
        }
    }
    properties
}

fn characteristic(peripheral: &Peripheral, id: Uuid) -> Result<Characteristic, GattError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == id)
        .ok_or(GattError::Att(0x0A))
}

/// Execute session requests in order until the session is dropped.
async fn drive(
    peripheral: Peripheral,
    mut requests: UnboundedReceiver<GattRequest>,
    completions: UnboundedSender<GattCompletion>,
) {
    while let Some(request) = requests.recv().await {
        log::trace!("request {:?}", request);
        let completion = match request {
            GattRequest::DiscoverService(_) => {
                let result = peripheral.discover_services().await.map_err(gatt_error).map(|_| {
                    peripheral
                        .services()
                        .iter()
                        .map(|s| ServiceHandle {
                            uuid: s.uuid,
                            start_handle: 0,
                        })
                        .collect()
                });
                GattCompletion::ServicesDiscovered(result)
            }
            GattRequest::DiscoverAttributes(service, ids) => {
                let found = peripheral
                    .services()
                    .into_iter()
                    .find(|s| s.uuid == service)
                    .map(|s| {
                        s.characteristics
                            .iter()
                            .filter(|c| ids.contains(&c.uuid))
                            .map(|c| Attribute::new(c.uuid, properties(c.properties)))
                            .collect()
                    })
                    .ok_or(GattError::Att(0x0A));
                GattCompletion::AttributesDiscovered(found)
            }
            GattRequest::Write(id, value, mode) => {
                let write_type = match mode {
                    WriteMode::WithResponse => WriteType::WithResponse,
                    WriteMode::WithoutResponse => WriteType::WithoutResponse,
                };
                let result = match characteristic(&peripheral, id) {
                    Ok(c) => peripheral
                        .write(&c, &value, write_type)
                        .await
                        .map_err(gatt_error),
                    Err(e) => Err(e),
                };
                GattCompletion::WriteComplete(result)
            }
            GattRequest::Read(id, offset) => {
                let result = match characteristic(&peripheral, id) {
                    Ok(c) => peripheral.read(&c).await.map_err(gatt_error).and_then(|value| {
                        value.get(offset..).map(<[u8]>::to_vec).ok_or(GattError::Att(0x07))
                    }),
                    Err(e) => Err(e),
                };
                GattCompletion::ReadResponse(result)
            }
            GattRequest::Subscribe(id) => {
                let result = match characteristic(&peripheral, id) {
                    Ok(c) => peripheral.subscribe(&c).await.map_err(gatt_error),
                    Err(e) => Err(e),
                };
                GattCompletion::Subscribed(result)
            }
            GattRequest::Unsubscribe(id) => {
                if let Ok(c) = characteristic(&peripheral, id) {
                    if let Err(e) = peripheral.unsubscribe(&c).await {
                        log::warn!("unsubscribe failed: {}", e);
                    }
                }
                continue;
            }
        };

        if completions.send(completion).is_err() {
            break;
        }
    }
}

/// Forward every value notification to the session.
async fn forward_notifications(peripheral: Peripheral, completions: UnboundedSender<GattCompletion>) {
    let mut stream = match peripheral.notifications().await {
        Ok(s) => s,
        Err(e) => {
            log::error!("notification stream unavailable: {}", e);
            return;
        }
    };

    while let Some(data) = stream.next().await {
        if completions
            .send(GattCompletion::Notification(data.uuid, data.value))
            .is_err()
        {
            break;
        }
    }
}

/// Report a disconnect of `peripheral` to the session.
async fn watch_disconnect(
    adapter: Adapter,
    peripheral: Peripheral,
    completions: UnboundedSender<GattCompletion>,
) {
    let mut events = match adapter.events().await {
        Ok(e) => e,
        Err(e) => {
            log::error!("adapter event stream unavailable: {}", e);
            return;
        }
    };

    let id = peripheral.id();
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(gone) = event {
            if gone == id {
                let _ = completions.send(GattCompletion::Disconnected);
                break;
            }
        }
    }
}
