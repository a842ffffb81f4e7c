//! Store-and-forward delivery of device commands.
//!
//! The device cannot be reached directly, so every administrative action is
//! queued and handed out in the response to the device's next uplink. One
//! [`CommandQueue`] exists per [`CommandKind`]; all three share the lifecycle
//!
//! ```text
//! PENDING ──claim──▶ SENDING ──acknowledge──▶ SUCCESS | PARTIALLY_APPLIED | FAILED | COMPLETED
//!    │                    │
//!    │                    └──cancel / ack timeout──▶ FAILED
//!    └──gate refused / unreadable payload / cancel──▶ FAILED
//! ```
//!
//! At most one item per kind is in flight. While a kind has a `SENDING` item
//! nothing new of that kind is delivered, so two uplinks can never carry two
//! items of one kind. The `PENDING → SENDING` step is a conditional update in
//! the store, and claims of one kind are additionally serialized in-process.
//!
//! ```rust
//! use std::sync::Arc;
//! use uplink_relay::queue::{CommandQueue, ConfigKind, ConfigUpdate, MemoryCommandStore, UplinkId};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> uplink_relay::Result<()> {
//! let queue = CommandQueue::<ConfigKind>::new(Arc::new(MemoryCommandStore::new()));
//! queue.enqueue(ConfigUpdate { upload_interval: Some(60), ..Default::default() }).await?;
//!
//! let delivery = queue.claim(UplinkId(1)).await?.expect("one pending item");
//! assert_eq!(delivery.payload.upload_interval, Some(60));
//! assert!(queue.claim(UplinkId(2)).await?.is_none());
//! # Ok(())
//! # }
//! ```

mod feed;
mod kinds;
mod store;
mod types;

pub use feed::{CommandTransition, TransitionFeed};
pub use kinds::{
    ArtifactGate, CommandResult, ConfigAck, ConfigKind, ConfigUpdate, FirmwareJob, FirmwareKind,
    FirmwareLog, FotaManifest, RegisterWrite, RegisterWriteKind, WriteCommand, lenient_json,
};
pub use store::{CommandStore, MemoryCommandStore};
pub use types::{CommandId, CommandKind, CommandRecord, CommandStatus, StatusUpdate, UplinkId};

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{Result, UplinkError};

/// Kind-specific behavior plugged into [`CommandQueue`].
pub trait QueueKind: Send + Sync + 'static {
    const KIND: CommandKind;

    /// Enqueued request, stored as the item payload
    type Request: Serialize + DeserializeOwned + Debug + Clone + Send + Sync;
    /// Read-only projection placed in the uplink response
    type Delivery: Serialize + Debug + Clone + Send + Sync;
    /// Acknowledgment sent by the device
    type Ack: Serialize + DeserializeOwned + Debug + Send + Sync;

    /// Reject requests the device could never apply.
    fn validate(request: &Self::Request) -> Result<()>;

    fn project(record: &CommandRecord, request: Self::Request, ctx: &DeliveryContext)
    -> Self::Delivery;

    /// Item the acknowledgment names explicitly, if any.
    fn target(ack: &Self::Ack) -> Option<AckTarget>;

    fn verdict(ack: &Self::Ack) -> Verdict;
}

/// Deployment values needed to build device projections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryContext {
    /// Download URL placed in firmware manifests
    pub firmware_url: String,
}

/// Terminal status derived from an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: CommandStatus,
    pub error_message: Option<String>,
}

impl Verdict {
    pub fn new(status: CommandStatus) -> Self {
        Self { status, error_message: None }
    }

    pub fn failed_with(status: CommandStatus, message: impl Into<String>) -> Self {
        Self { status, error_message: Some(message.into()) }
    }
}

/// How an acknowledgment names the item it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTarget {
    /// The item with this id
    Item(CommandId),
    /// The item delivered in this uplink
    Uplink(UplinkId),
}

/// Decision of a [`DeliveryGate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Fail the item without delivering it
    Reject(String),
}

/// Precondition checked right before an item is delivered.
#[async_trait]
pub trait DeliveryGate: Send + Sync + Debug {
    async fn admit(&self, record: &CommandRecord) -> Result<Admission>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAdmit;

#[async_trait]
impl DeliveryGate for AlwaysAdmit {
    async fn admit(&self, _record: &CommandRecord) -> Result<Admission> {
        Ok(Admission::Admit)
    }
}

/// Item moved to `SENDING` for one uplink.
#[derive(Debug, Clone)]
pub struct Delivery<K: QueueKind> {
    pub record: CommandRecord,
    pub payload: K::Delivery,
}

/// Result of applying an acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The in-flight item reached a terminal status
    Applied(CommandRecord),
    /// Nothing was in flight to acknowledge; the acknowledgment was dropped
    Orphaned,
}

impl AckOutcome {
    pub fn record(&self) -> Option<&CommandRecord> {
        match self {
            AckOutcome::Applied(record) => Some(record),
            AckOutcome::Orphaned => None,
        }
    }
}

/// Queue of one command kind.
pub struct CommandQueue<K: QueueKind> {
    store: Arc<dyn CommandStore>,
    gate: Arc<dyn DeliveryGate>,
    feed: TransitionFeed,
    ack_timeout: Option<Duration>,
    context: DeliveryContext,
    claim_lock: Mutex<()>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: QueueKind> CommandQueue<K> {
    pub fn new(store: Arc<dyn CommandStore>) -> Self {
        Self {
            store,
            gate: Arc::new(AlwaysAdmit),
            feed: TransitionFeed::default(),
            ack_timeout: None,
            context: DeliveryContext::default(),
            claim_lock: Mutex::new(()),
            _kind: PhantomData,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn DeliveryGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Share one feed between queues.
    pub fn with_feed(mut self, feed: TransitionFeed) -> Self {
        self.feed = feed;
        self
    }

    /// Fail `SENDING` items not acknowledged within `timeout`.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, context: DeliveryContext) -> Self {
        self.context = context;
        self
    }

    pub fn kind(&self) -> CommandKind {
        K::KIND
    }

    /// Validate and store a new `PENDING` item.
    pub async fn enqueue(&self, request: K::Request) -> Result<CommandRecord> {
        K::validate(&request)?;
        let payload = serde_json::to_value(&request)
            .map_err(|err| UplinkError::json(format!("{} payload", K::KIND), err))?;
        let record = self.store.insert(K::KIND, payload).await?;
        info!("Queued {} #{}", K::KIND, record.id);
        self.feed.publish(CommandTransition::of(&record, None));
        Ok(record)
    }

    /// Move the oldest deliverable `PENDING` item to `SENDING` for `uplink`.
    ///
    /// Returns `None` when an item of this kind is already in flight or
    /// nothing is pending. On a store error no item changes status.
    pub async fn claim(&self, uplink: UplinkId) -> Result<Option<Delivery<K>>> {
        let _claim = self.claim_lock.lock().await;
        self.expire_stale().await?;

        loop {
            if let Some(in_flight) = self.in_flight().await? {
                debug!(
                    "{} #{} still in flight since uplink {:?}, nothing delivered",
                    K::KIND, in_flight.id, in_flight.delivered_in
                );
                return Ok(None);
            }

            let Some(candidate) =
                self.store.list_by_status(K::KIND, CommandStatus::Pending).await?.into_iter().next()
            else {
                return Ok(None);
            };

            if let Admission::Reject(reason) = self.gate.admit(&candidate).await? {
                warn!("{} #{} refused at delivery: {}", K::KIND, candidate.id, reason);
                self.commit(&candidate, CommandStatus::Pending, StatusUpdate::failed(reason)).await?;
                continue;
            }

            let request: K::Request = match serde_json::from_value(candidate.payload.clone()) {
                Ok(request) => request,
                Err(err) => {
                    warn!("{} #{} has an unreadable payload: {}", K::KIND, candidate.id, err);
                    let reason = format!("unreadable payload: {}", err);
                    self.commit(&candidate, CommandStatus::Pending, StatusUpdate::failed(reason)).await?;
                    continue;
                }
            };

            match self.commit(&candidate, CommandStatus::Pending, StatusUpdate::sending(uplink)).await? {
                Some(record) => {
                    info!("Delivering {} #{} in uplink {}", K::KIND, record.id, uplink);
                    let payload = K::project(&record, request, &self.context);
                    return Ok(Some(Delivery { record, payload }));
                }
                None => {
                    debug!("{} #{} claimed elsewhere, re-reading queue", K::KIND, candidate.id);
                }
            }
        }
    }

    /// Apply the device's verdict to the item it answers.
    ///
    /// An acknowledgment with nothing to apply to is logged and reported as
    /// [`AckOutcome::Orphaned`], never as an error.
    pub async fn acknowledge(&self, ack: K::Ack) -> Result<AckOutcome> {
        let Some(target) = self.resolve(K::target(&ack)).await? else {
            warn!("Orphaned {} acknowledgment, no matching SENDING item: {:?}", K::KIND, ack);
            return Ok(AckOutcome::Orphaned);
        };

        let verdict = K::verdict(&ack);
        let response = serde_json::to_value(&ack)
            .map_err(|err| UplinkError::json(format!("{} acknowledgment", K::KIND), err))?;
        let update = StatusUpdate {
            to: verdict.status,
            error_message: verdict.error_message,
            device_response: Some(response),
            delivered_in: None,
        };

        match self.commit(&target, CommandStatus::Sending, update).await? {
            Some(record) => {
                info!("{} #{} acknowledged: {}", K::KIND, record.id, record.status);
                Ok(AckOutcome::Applied(record))
            }
            None => {
                warn!("{} #{} was resolved concurrently, acknowledgment dropped", K::KIND, target.id);
                Ok(AckOutcome::Orphaned)
            }
        }
    }

    /// Fail an item that is still `PENDING` or `SENDING`.
    ///
    /// Frees the kind when an acknowledgment will never arrive. Returns
    /// `None` when the item is missing or already terminal.
    pub async fn cancel(
        &self,
        id: CommandId,
        reason: impl Into<String>,
    ) -> Result<Option<CommandRecord>> {
        let Some(record) = self.get(id).await? else {
            return Ok(None);
        };
        if record.status.is_terminal() {
            return Ok(None);
        }
        let cancelled = self.commit(&record, record.status, StatusUpdate::failed(reason)).await?;
        if let Some(cancelled) = &cancelled {
            info!("{} #{} cancelled while {}", K::KIND, cancelled.id, record.status);
        }
        Ok(cancelled)
    }

    /// The item currently `SENDING`, if any.
    pub async fn in_flight(&self) -> Result<Option<CommandRecord>> {
        let mut sending = self.store.list_by_status(K::KIND, CommandStatus::Sending).await?;
        Ok(sending.pop())
    }

    pub async fn pending(&self) -> Result<Vec<CommandRecord>> {
        self.store.list_by_status(K::KIND, CommandStatus::Pending).await
    }

    pub async fn get(&self, id: CommandId) -> Result<Option<CommandRecord>> {
        self.store.get(K::KIND, id).await
    }

    /// History, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<CommandRecord>> {
        self.store.recent(K::KIND, limit).await
    }

    pub async fn status_summary(&self) -> Result<BTreeMap<CommandStatus, usize>> {
        self.store.count_by_status(K::KIND).await
    }

    pub fn subscribe(&self) -> impl Stream<Item = CommandTransition> + Send + 'static {
        self.feed.subscribe()
    }

    /// Fail `SENDING` items older than the acknowledgment timeout.
    pub async fn expire_stale(&self) -> Result<usize> {
        let Some(timeout) = self.ack_timeout else {
            return Ok(0);
        };
        let Ok(max_age) = chrono::Duration::from_std(timeout) else {
            return Ok(0);
        };

        let now = Utc::now();
        let mut expired = 0;
        for record in self.store.list_by_status(K::KIND, CommandStatus::Sending).await? {
            if now - record.updated_at < max_age {
                continue;
            }
            let reason = format!("no acknowledgment within {}s", timeout.as_secs());
            if self.commit(&record, CommandStatus::Sending, StatusUpdate::failed(reason)).await?.is_some() {
                warn!("{} #{} expired without acknowledgment", K::KIND, record.id);
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn resolve(&self, target: Option<AckTarget>) -> Result<Option<CommandRecord>> {
        match target {
            Some(AckTarget::Item(id)) => Ok(self
                .store
                .get(K::KIND, id)
                .await?
                .filter(|record| record.status == CommandStatus::Sending)),
            Some(AckTarget::Uplink(uplink)) => Ok(self
                .store
                .list_by_status(K::KIND, CommandStatus::Sending)
                .await?
                .into_iter()
                .find(|record| record.delivered_in == Some(uplink))),
            None => self.in_flight().await,
        }
    }

    async fn commit(
        &self,
        record: &CommandRecord,
        from: CommandStatus,
        update: StatusUpdate,
    ) -> Result<Option<CommandRecord>> {
        let updated = self.store.transition(K::KIND, record.id, from, update).await?;
        if let Some(updated) = &updated {
            self.feed.publish(CommandTransition::of(updated, Some(from)));
        }
        Ok(updated)
    }
}

impl<K: QueueKind> Debug for CommandQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("kind", &K::KIND)
            .field("store", &self.store)
            .field("gate", &self.gate)
            .field("ack_timeout", &self.ack_timeout)
            .finish_non_exhaustive()
    }
}
