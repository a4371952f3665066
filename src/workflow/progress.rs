// Progress events and their per-workflow fan-out
//
// Each subscriber owns an unbounded channel; publish copies the event into
// every channel registered for that workflow id at the moment of the call.
// There is no replay buffer. The last unsubscribe for an id drops its entry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::errors::OnboardingError;
use crate::trials::types::TrialId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardTrialStatus {
    CreatingTrial,
    TrialCreated,
    ProtocolAdding,
    ProtocolAdded,
    SiteRegistering,
    SiteRegistered,
    Completed,
    Failed,
}

impl OnboardTrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnboardTrialStatus::CreatingTrial => "creating_trial",
            OnboardTrialStatus::TrialCreated => "trial_created",
            OnboardTrialStatus::ProtocolAdding => "protocol_adding",
            OnboardTrialStatus::ProtocolAdded => "protocol_added",
            OnboardTrialStatus::SiteRegistering => "site_registering",
            OnboardTrialStatus::SiteRegistered => "site_registered",
            OnboardTrialStatus::Completed => "completed",
            OnboardTrialStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OnboardTrialStatus::Completed | OnboardTrialStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialSnapshot {
    pub id: TrialId,
    pub name: String,
    pub phase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteProgress {
    /// 1-based
    pub current_index: usize,
    pub total: usize,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressError {
    pub failed_step: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub workflow_id: String,
    pub status: OnboardTrialStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial: Option<TrialSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_progress: Option<SiteProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProgressError>,
}

impl ProgressEvent {
    pub fn new(workflow_id: impl Into<String>, status: OnboardTrialStatus, message: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status,
            message: message.into(),
            trial: None,
            site_progress: None,
            error: None,
        }
    }

    pub fn with_trial(mut self, trial: Option<TrialSnapshot>) -> Self {
        self.trial = trial;
        self
    }

    pub fn with_site_progress(mut self, site_progress: SiteProgress) -> Self {
        self.site_progress = Some(site_progress);
        self
    }

    pub fn with_error(mut self, error: ProgressError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Where the workflow executor sends progress. Returns the number of
/// receivers the event reached.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, event: ProgressEvent) -> Result<usize, OnboardingError>;
}

pub type SubscriptionId = u64;

#[derive(Debug)]
struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
}

/// Process-wide fan-out of progress events keyed by workflow id.
///
/// Clones share one registry; create it once at startup and inject it.
#[derive(Debug, Clone, Default)]
pub struct ProgressBroadcaster {
    registry: Arc<Registry>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.registry
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start receiving events published for `workflow_id` from now on.
    pub fn subscribe(&self, workflow_id: &str) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.topics()
            .entry(workflow_id.to_string())
            .or_default()
            .push(Subscriber { id, sender });
        debug!(workflow_id, subscription_id = id, "Progress subscriber attached");

        Subscription {
            id,
            workflow_id: workflow_id.to_string(),
            receiver,
            broadcaster: self.clone(),
        }
    }

    /// Deliver `event` to every current subscriber of `workflow_id`.
    ///
    /// Subscribers whose receiving side is gone are pruned on the way.
    pub fn publish(&self, workflow_id: &str, event: ProgressEvent) -> usize {
        let mut topics = self.topics();
        let Some(subscribers) = topics.get_mut(workflow_id) else {
            trace!(workflow_id, status = event.status.as_str(), "No subscribers, dropping progress event");
            return 0;
        };

        subscribers.retain(|subscriber| subscriber.sender.send(event.clone()).is_ok());
        let delivered = subscribers.len();
        if subscribers.is_empty() {
            topics.remove(workflow_id);
        }
        delivered
    }

    /// Detach one subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, workflow_id: &str, id: SubscriptionId) -> bool {
        let mut topics = self.topics();
        let Some(subscribers) = topics.get_mut(workflow_id) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            topics.remove(workflow_id);
        }
        if removed {
            debug!(workflow_id, subscription_id = id, "Progress subscriber detached");
        }
        removed
    }

    pub fn subscriber_count(&self, workflow_id: &str) -> usize {
        self.topics().get(workflow_id).map(Vec::len).unwrap_or(0)
    }

    /// Workflow ids that currently have bookkeeping
    pub fn active_workflows(&self) -> usize {
        self.topics().len()
    }
}

#[async_trait]
impl ProgressSink for ProgressBroadcaster {
    async fn publish(&self, event: ProgressEvent) -> Result<usize, OnboardingError> {
        let workflow_id = event.workflow_id.clone();
        Ok(ProgressBroadcaster::publish(self, &workflow_id, event))
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    workflow_id: String,
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
    broadcaster: ProgressBroadcaster,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }

    /// Receive until a completed or failed event arrives, then detach.
    pub async fn until_terminal(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            let terminal = event.status.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(&self.workflow_id, self.id);
    }
}
