use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A normalized security/compliance signal as produced by a source adapter.
///
/// Immutable once submitted; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub source: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    pub category: String,
    pub severity: Severity,
    pub event_type: String,
    pub resource: ResourceRef,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: HashMap<String, String>,
    pub observed_at: DateTime<Utc>,
}

/// The resource an event refers to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::Info => "INFO",
        }
    }
}

/// The outcome of running one event through the engine.
///
/// Callers map Admit to persisting a record, Suppress and RateLimited to
/// dropping the event, and AggregateEmit to persisting one summary record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Suppress,
    AggregateEmit {
        count: u64,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Signal,
    Summary,
}

/// A durable record derived from an admitted event or an aggregate emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: String,
    pub record_kind: RecordKind,
    pub source: String,
    pub category: String,
    pub severity: Severity,
    pub event_type: String,
    pub resource: ResourceRef,
    pub message: String,
    pub details: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SignalRecord {
    /// Build a record for a freshly admitted event.
    pub fn from_admitted(event: &CandidateEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record_kind: RecordKind::Signal,
            source: event.source.clone(),
            category: event.category.clone(),
            severity: event.severity,
            event_type: event.event_type.clone(),
            resource: event.resource.clone(),
            message: event.message.clone(),
            details: event.details.clone(),
            duplicate_count: None,
            window_start: None,
            window_end: None,
            created_at: Utc::now(),
        }
    }

    /// Build a summary record covering `count` suppressed duplicates seen
    /// between `first_seen` and `last_seen`.
    pub fn summary(
        event: &CandidateEvent,
        count: u64,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record_kind: RecordKind::Summary,
            source: event.source.clone(),
            category: event.category.clone(),
            severity: event.severity,
            event_type: event.event_type.clone(),
            resource: event.resource.clone(),
            message: format!("{} occurrences: {}", count, event.message),
            details: event.details.clone(),
            duplicate_count: Some(count),
            window_start: Some(first_seen),
            window_end: Some(last_seen),
            created_at: Utc::now(),
        }
    }
}

// Helper functions for creating common events
pub mod builders {
    use super::*;

    pub fn vulnerability_event(
        source: &str,
        resource_kind: &str,
        resource_name: &str,
        severity: Severity,
        vulnerability_id: &str,
    ) -> CandidateEvent {
        let mut details = HashMap::new();
        details.insert("vulnerabilityID".to_string(), vulnerability_id.to_string());

        CandidateEvent {
            source: source.to_string(),
            namespace: "default".to_string(),
            kind: resource_kind.to_string(),
            name: resource_name.to_string(),
            category: "security".to_string(),
            severity,
            event_type: "vulnerability".to_string(),
            resource: ResourceRef {
                kind: resource_kind.to_string(),
                name: resource_name.to_string(),
                namespace: "default".to_string(),
            },
            message: format!("{} found in {}", vulnerability_id, resource_name),
            details,
            observed_at: Utc::now(),
        }
    }

    pub fn policy_violation_event(
        source: &str,
        resource_name: &str,
        policy: &str,
    ) -> CandidateEvent {
        let mut details = HashMap::new();
        details.insert("policy".to_string(), policy.to_string());

        CandidateEvent {
            source: source.to_string(),
            namespace: "default".to_string(),
            kind: "Pod".to_string(),
            name: resource_name.to_string(),
            category: "compliance".to_string(),
            severity: Severity::Medium,
            event_type: "policy-violation".to_string(),
            resource: ResourceRef {
                kind: "Pod".to_string(),
                name: resource_name.to_string(),
                namespace: "default".to_string(),
            },
            message: format!("policy {} violated by {}", policy, resource_name),
            details,
            observed_at: Utc::now(),
        }
    }
}
