use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{ChannelKind, RecipientRole, Relationship, Severity};

// ---------------------------------------------------------------------------
// Directory entries (supplied by the external family/relationship graph)
// ---------------------------------------------------------------------------

/// One reachable address for a contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactChannel {
    pub kind: ChannelKind,
    /// Device token, phone number, etc. Opaque to the engine.
    pub address: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A contactable party as stored in the external relationship graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: Uuid,
    pub name: String,
    /// A contact may hold several roles (a spouse who is also the
    /// primary caregiver); the resolver deduplicates across them.
    pub roles: Vec<RecipientRole>,
    pub relationship: Relationship,
    /// Explicit flag that outweighs relationship seniority.
    #[serde(default)]
    pub notify_first: bool,
    /// Numeric tie-breaker, lower is earlier.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub disabled: bool,
    pub channels: Vec<ContactChannel>,
    /// BCP 47-ish language tag, e.g. "en", "fr", "de".
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Cultural adaptation: prefer formal address in composed messages.
    #[serde(default)]
    pub formal_address: bool,
}

fn default_locale() -> String {
    "en".to_string()
}

// ---------------------------------------------------------------------------
// Resolved recipient
// ---------------------------------------------------------------------------

/// A contact after tier resolution: ordered, deduplicated, and restricted
/// to the channels the tier allows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    pub name: String,
    pub roles: Vec<RecipientRole>,
    pub relationship: Relationship,
    /// Eligible channels in the tier's preference order.
    pub channels: Vec<ContactChannel>,
    pub locale: String,
    pub formal_address: bool,
}

// ---------------------------------------------------------------------------
// Composed message
// ---------------------------------------------------------------------------

/// Channel-ready message content produced by the composer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelMessage {
    pub subject: String,
    pub body: String,
    pub locale: String,
    pub severity: Severity,
}
