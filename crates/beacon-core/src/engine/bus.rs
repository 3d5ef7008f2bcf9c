//! Multi-node engine over a shared in-process bus.
//!
//! Every node owns a [`BusEngine`]; all of them hold clones of one [`Bus`]
//! and one [`MemoryStore`]. Publishes are encoded as [`Envelope`] frames,
//! written to the bus by a single writer task, and read back by every
//! node's listener, which delivers into the local hub only for channels the
//! node has subscribed to.
//!
//! Delivery is at most once. A publish resolves once its frame is on the bus,
//! not when peers have read it. A listener that falls more than the bus
//! capacity behind skips the overwritten frames and logs how many were lost;
//! history in the shared store is unaffected.

use super::memory::{spawn_sweeper, DEFAULT_SWEEP_INTERVAL};
use super::{Engine, EngineError, EngineResult, HistoryOptions, MemoryStore, PublishResult};
use crate::channel::ChannelId;
use crate::config::{ChannelOptions, Config};
use crate::hub::{Delivery, Hub};
use async_trait::async_trait;
use beacon_protocol::{
    codec, AdminMessage, ClientInfo, ConnId, ControlMessage, Envelope, EnvelopeKind,
    JoinLeaveMessage, Message, ProtocolError,
};
use bytes::Bytes;
use dashmap::DashSet;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Default number of frames a lagging listener may fall behind.
pub const DEFAULT_BUS_CAPACITY: usize = 4096;

/// Shared frame bus connecting the nodes of a cluster.
#[derive(Debug, Clone)]
pub struct Bus {
    sender: broadcast::Sender<Bytes>,
}

impl Bus {
    /// Create a bus buffering up to `capacity` frames per listener.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a frame to every listener. Returns the number of listeners.
    pub fn publish(&self, frame: Bytes) -> usize {
        self.sender.send(frame).unwrap_or_default()
    }

    /// Listen for frames published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.sender.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

type Outgoing = (Bytes, oneshot::Sender<EngineResult<()>>);

/// Engine for one node of a bus-connected cluster.
pub struct BusEngine {
    bus: Bus,
    hub: Arc<Hub>,
    store: Arc<MemoryStore>,
    admin_id: ChannelId,
    control_id: ChannelId,
    subscribed: Arc<DashSet<ChannelId>>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
    sweep_interval: Duration,
    running: AtomicBool,
    shutdown: watch::Sender<()>,
}

impl BusEngine {
    /// Create an engine for a node delivering into `hub`.
    ///
    /// Routing keys for admin and control traffic come from `config`.
    #[must_use]
    pub fn new(bus: Bus, hub: Arc<Hub>, store: Arc<MemoryStore>, config: &Config) -> Self {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(());
        Self {
            bus,
            hub,
            store,
            admin_id: config.admin_channel_id(),
            control_id: config.control_channel_id(),
            subscribed: Arc::new(DashSet::new()),
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Set the period of the expiry sweep.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Encode a value as a bus frame.
    fn frame<T: Serialize>(
        kind: EnvelopeKind,
        channel: &ChannelId,
        value: &T,
    ) -> Result<Bytes, ProtocolError> {
        codec::encode(&Envelope::wrap(kind, channel.as_str(), value)?)
    }

    /// Encode and queue a frame for the writer task.
    fn enqueue<T: Serialize>(&self, kind: EnvelopeKind, channel: &ChannelId, value: &T) -> PublishResult {
        match Self::frame(kind, channel, value) {
            Ok(frame) => self.send(frame),
            Err(e) => PublishResult::ready(Err(e.into())),
        }
    }

    fn send(&self, frame: Bytes) -> PublishResult {
        let (done, result) = PublishResult::pending();
        // A closed outbox drops `done`, which resolves to `Closed`.
        let _ = self.outbox.send((frame, done));
        result
    }
}

/// Routes frames read from the bus into the local hub.
struct Listener {
    hub: Arc<Hub>,
    subscribed: Arc<DashSet<ChannelId>>,
    admin_id: ChannelId,
    control_id: ChannelId,
}

impl Listener {
    fn dispatch(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        let envelope = codec::decode(frame)?;
        let key = ChannelId::new(envelope.channel.as_str());

        match envelope.kind {
            EnvelopeKind::Message | EnvelopeKind::Join | EnvelopeKind::Leave => {
                if !self.subscribed.contains(&key) {
                    trace!(channel = %key, "Ignoring frame for unsubscribed channel");
                    return Ok(());
                }
                let delivery = match envelope.kind {
                    EnvelopeKind::Message => Delivery::Message(envelope.open::<Message>()?),
                    EnvelopeKind::Join => Delivery::Join(envelope.open::<JoinLeaveMessage>()?),
                    _ => Delivery::Leave(envelope.open::<JoinLeaveMessage>()?),
                };
                let name = delivery.channel().to_string();
                self.hub.deliver(&name, delivery);
            }
            EnvelopeKind::Admin if key == self.admin_id => {
                self.hub.deliver_admin(envelope.open::<AdminMessage>()?);
            }
            EnvelopeKind::Control if key == self.control_id => {
                self.hub.deliver_control(envelope.open::<ControlMessage>()?);
            }
            EnvelopeKind::Admin | EnvelopeKind::Control => {
                trace!(channel = %key, "Ignoring frame for foreign prefix");
            }
        }
        Ok(())
    }

    async fn run(self, mut frames: broadcast::Receiver<Bytes>, mut shutdown: watch::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        if let Err(e) = self.dispatch(&frame) {
                            warn!(error = %e, "Dropping undecodable bus frame");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Bus listener lagged, frames lost");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Bus listener stopped");
    }
}

async fn write_frames(
    bus: Bus,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = outbox.recv() => {
                let Some((frame, done)) = next else { break };
                let listeners = bus.publish(frame);
                trace!(listeners, "Frame published");
                let _ = done.send(Ok(()));
            }
        }
    }
    debug!("Bus writer stopped");
}

#[async_trait]
impl Engine for BusEngine {
    fn name(&self) -> &'static str {
        "bus"
    }

    async fn run(&self) -> EngineResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        let outbox = self
            .outbox_rx
            .lock()
            .map_err(|_| EngineError::Backend("outbox lock poisoned".to_string()))?
            .take()
            .ok_or(EngineError::AlreadyRunning)?;

        let listener = Listener {
            hub: Arc::clone(&self.hub),
            subscribed: Arc::clone(&self.subscribed),
            admin_id: self.admin_id.clone(),
            control_id: self.control_id.clone(),
        };
        tokio::spawn(listener.run(self.bus.subscribe(), self.shutdown.subscribe()));
        tokio::spawn(write_frames(self.bus.clone(), outbox, self.shutdown.subscribe()));
        spawn_sweeper(
            Arc::clone(&self.store),
            self.sweep_interval,
            self.shutdown.subscribe(),
        );

        info!(engine = self.name(), "Engine running");
        Ok(())
    }

    fn publish_message(
        &self,
        channel: &ChannelId,
        message: Message,
        options: &ChannelOptions,
    ) -> PublishResult {
        // History is only written for messages that made it into a frame.
        let frame = match Self::frame(EnvelopeKind::Message, channel, &message) {
            Ok(frame) => frame,
            Err(e) => return PublishResult::ready(Err(e.into())),
        };
        let inactive = self.hub.subscriber_count(&message.channel) == 0;
        self.store.add_history(channel, &message, options, inactive);
        self.send(frame)
    }

    fn publish_join(&self, channel: &ChannelId, message: JoinLeaveMessage) -> PublishResult {
        self.enqueue(EnvelopeKind::Join, channel, &message)
    }

    fn publish_leave(&self, channel: &ChannelId, message: JoinLeaveMessage) -> PublishResult {
        self.enqueue(EnvelopeKind::Leave, channel, &message)
    }

    fn publish_admin(&self, message: AdminMessage) -> PublishResult {
        let id = self.admin_id.clone();
        self.enqueue(EnvelopeKind::Admin, &id, &message)
    }

    fn publish_control(&self, message: ControlMessage) -> PublishResult {
        let id = self.control_id.clone();
        self.enqueue(EnvelopeKind::Control, &id, &message)
    }

    async fn subscribe(&self, channel: &ChannelId) -> EngineResult<()> {
        if self.subscribed.insert(channel.clone()) {
            debug!(channel = %channel, "Bus subscribed");
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> EngineResult<()> {
        if self.subscribed.remove(channel).is_some() {
            debug!(channel = %channel, "Bus unsubscribed");
        }
        Ok(())
    }

    async fn channels(&self) -> EngineResult<Vec<ChannelId>> {
        Ok(self.subscribed.iter().map(|c| c.clone()).collect())
    }

    async fn add_presence(
        &self,
        channel: &ChannelId,
        connection_id: &str,
        info: ClientInfo,
    ) -> EngineResult<()> {
        self.store.add_presence(channel, connection_id, info);
        Ok(())
    }

    async fn remove_presence(&self, channel: &ChannelId, connection_id: &str) -> EngineResult<()> {
        self.store.remove_presence(channel, connection_id);
        Ok(())
    }

    async fn presence(&self, channel: &ChannelId) -> EngineResult<HashMap<ConnId, ClientInfo>> {
        Ok(self.store.presence(channel))
    }

    async fn history(
        &self,
        channel: &ChannelId,
        options: HistoryOptions,
    ) -> EngineResult<Vec<Message>> {
        Ok(self.store.history(channel, options.limit))
    }
}
