//! Core domain model for the contractor directory harvester.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rcd-core";

/// Lightweight summary parsed from one listing card, before any detail fetch.
///
/// Cards without a profile URL never become summaries; the profile URL is the
/// only way to derive a contractor id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub profile_url: String,
    pub name: Option<String>,
    pub rating: Option<String>,
    pub location: Option<String>,
    pub phone: Option<String>,
}

/// Detail fields extracted best-effort from a contractor profile page.
///
/// Every field is independently optional: a failed extractor leaves its field
/// empty without aborting the rest of the item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailFields {
    pub about: Option<String>,
    #[serde(default)]
    pub reviews: Vec<String>,
    pub founding_year: Option<String>,
    pub state_license: Option<String>,
    pub number_of_employees: Option<String>,
}

/// Canonical persisted record, keyed by `contractor_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractorRecord {
    pub contractor_id: String,
    pub profile_url: String,
    pub name: Option<String>,
    pub rating: Option<String>,
    pub location: Option<String>,
    pub phone: Option<String>,
    #[serde(flatten)]
    pub detail: DetailFields,
    /// Opaque change fingerprint observed on the profile page, compared only
    /// for equality.
    pub last_modified: Option<String>,
    pub last_updated: DateTime<Utc>,
    /// Written by the insight enrichment pass, never by the crawl.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_insight: Option<String>,
}

impl ContractorRecord {
    pub fn from_summary(
        contractor_id: String,
        summary: ListingSummary,
        detail: DetailFields,
        last_modified: Option<String>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            contractor_id,
            profile_url: summary.profile_url,
            name: summary.name,
            rating: summary.rating,
            location: summary.location,
            phone: summary.phone,
            detail,
            last_modified,
            last_updated,
            ai_insight: None,
        }
    }
}

/// Kinds of work a client can enqueue. Only full refreshes exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Refresh,
}

/// One queued unit of work. Never persisted; lost on process restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub kind: JobKind,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn refresh(now: DateTime<Utc>) -> Self {
        Self {
            kind: JobKind::Refresh,
            enqueued_at: now,
        }
    }
}

/// Point-in-time view of the queue for polling clients.
///
/// `position` counts pending jobs plus the one in flight; zero means idle and
/// immediately servable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub position: usize,
    pub processing: bool,
}

impl QueueSnapshot {
    pub fn is_idle(&self) -> bool {
        self.position == 0 && !self.processing
    }
}
