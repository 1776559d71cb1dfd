use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery priority. Each priority has its own queue lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Priority {
    #[serde(alias = "critical")]
    High,
    #[serde(alias = "low")]
    Normal,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
        }
    }
}

/// Kind of upstream insight. Only used for routing and priority defaults;
/// the pipeline never looks inside the rendered payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum InsightType {
    RegulatoryApproval,
    ClinicalTrial,
    MergerAcquisition,
    FundingRound,
    Partnership,
    Custom,
}

impl InsightType {
    /// Priority used when the event does not carry one.
    pub fn default_priority(&self) -> Priority {
        match self {
            InsightType::RegulatoryApproval | InsightType::MergerAcquisition => Priority::High,
            InsightType::ClinicalTrial
            | InsightType::FundingRound
            | InsightType::Partnership
            | InsightType::Custom => Priority::Normal,
        }
    }
}

impl std::fmt::Display for InsightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InsightType::RegulatoryApproval => write!(f, "regulatory_approval"),
            InsightType::ClinicalTrial => write!(f, "clinical_trial"),
            InsightType::MergerAcquisition => write!(f, "merger_acquisition"),
            InsightType::FundingRound => write!(f, "funding_round"),
            InsightType::Partnership => write!(f, "partnership"),
            InsightType::Custom => write!(f, "custom"),
        }
    }
}

impl std::str::FromStr for InsightType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regulatory_approval" => Ok(InsightType::RegulatoryApproval),
            "clinical_trial" => Ok(InsightType::ClinicalTrial),
            "merger_acquisition" => Ok(InsightType::MergerAcquisition),
            "funding_round" => Ok(InsightType::FundingRound),
            "partnership" => Ok(InsightType::Partnership),
            "custom" => Ok(InsightType::Custom),
            other => Err(format!("unknown insight type '{}'", other)),
        }
    }
}

/// Notification lifecycle state.
///
/// `pending → queued → sending → sent → delivered`, with `sending → queued`
/// on retry and `failed` / `dead_lettered` as the failure terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Queued,
    Sending,
    Sent,
    Delivered,
    Failed,
    DeadLettered,
}

impl NotificationStatus {
    /// No transition leaves a terminal state, except `sent → delivered`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent
                | NotificationStatus::Delivered
                | NotificationStatus::Failed
                | NotificationStatus::DeadLettered
        )
    }

    /// Whether a worker may start a delivery attempt from this state.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, NotificationStatus::Pending | NotificationStatus::Queued)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "pending"),
            NotificationStatus::Queued => write!(f, "queued"),
            NotificationStatus::Sending => write!(f, "sending"),
            NotificationStatus::Sent => write!(f, "sent"),
            NotificationStatus::Delivered => write!(f, "delivered"),
            NotificationStatus::Failed => write!(f, "failed"),
            NotificationStatus::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "queued" => Ok(NotificationStatus::Queued),
            "sending" => Ok(NotificationStatus::Sending),
            "sent" => Ok(NotificationStatus::Sent),
            "delivered" => Ok(NotificationStatus::Delivered),
            "failed" => Ok(NotificationStatus::Failed),
            "dead_lettered" => Ok(NotificationStatus::DeadLettered),
            other => Err(format!("unknown notification status '{}'", other)),
        }
    }
}

/// An insight as received from the Insight Source.
///
/// Fields default instead of failing deserialization so that missing values
/// surface as `InvalidEvent` from ingestion rather than a JSON rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightEvent {
    #[serde(default)]
    pub insight_id: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub insight_type: Option<InsightType>,
    #[serde(default)]
    pub channel_target: Option<String>,
    #[serde(default)]
    pub rendered_payload: serde_json::Value,
}

/// Identity of a notification obligation: one per insight per channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub insight_id: String,
    pub channel_target: String,
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.insight_id, self.channel_target)
    }
}

/// A notification row as held by the delivery ledger.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub insight_id: String,
    pub channel_target: String,
    pub priority: Priority,
    pub insight_type: Option<InsightType>,
    pub status: NotificationStatus,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub read_by: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// When the pending delayed queue entry becomes due, if there is one.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            insight_id: self.insight_id.clone(),
            channel_target: self.channel_target.clone(),
        }
    }

    /// Reference point for the recovery sweep: the last status change, or the
    /// due time of a scheduled retry or throttle if that is later.
    pub fn last_activity(&self) -> DateTime<Utc> {
        match self.next_attempt_at {
            Some(due) if due > self.updated_at => due,
            _ => self.updated_at,
        }
    }
}

/// A validated notification ready to be written to the ledger.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub key: DedupKey,
    pub priority: Priority,
    pub insight_type: Option<InsightType>,
    pub payload: serde_json::Value,
}

/// A unit of delivery work sitting in a priority lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub notification_id: Uuid,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(notification_id: Uuid, priority: Priority) -> Self {
        Self {
            notification_id,
            priority,
            enqueued_at: Utc::now(),
        }
    }

    /// Same work item, stamped for re-entry at the tail of its lane.
    pub fn requeued(&self) -> Self {
        Self::new(self.notification_id, self.priority)
    }
}

/// User interaction on a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionAction {
    Acknowledge,
    Read,
}
