use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::models::enums::{
    ChannelKind, CriticalityClass, RecipientRole, ResponderRole, ResponseType, RiskClass, Severity,
    TriggerType,
};
use crate::models::Response;

/// Escalation ceiling applied when a plan does not set its own:
/// an unresolved emergency is forced to `timeout` this many minutes
/// after escalation started, independent of tier delays.
pub const DEFAULT_OVERALL_TIMEOUT_MINUTES: i64 = 30;

/// Upper bound on one tier's fan-out; a tier never waits longer than
/// this for its delivery attempts to settle.
pub const DEFAULT_TIER_BUDGET_SECONDS: u64 = 300;

/// Bounded recent-history window kept in memory.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

const DEFAULT_ACTION_TIMEOUT_SECONDS: u64 = 30;

/// Cap on a single computed retry delay, whatever the configured backoff.
const MAX_RETRY_DELAY_SECONDS: f64 = 3600.0;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry applied by the scheduler around each dispatcher call, so retry
/// semantics are uniform across channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_seconds: u64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    10
}

fn default_backoff() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_seconds: default_retry_delay(),
            backoff_multiplier: default_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), with fixed backoff.
    /// Clamped to `[0, MAX_RETRY_DELAY_SECONDS]` so extreme configured
    /// multipliers cannot overflow the duration.
    pub fn delay_before(&self, retry: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        let secs = self.delay_seconds as f64 * factor;
        let secs = if secs.is_finite() {
            secs.clamp(0.0, MAX_RETRY_DELAY_SECONDS)
        } else {
            MAX_RETRY_DELAY_SECONDS
        };
        std::time::Duration::from_secs_f64(secs)
    }
}

// ---------------------------------------------------------------------------
// Stop conditions
// ---------------------------------------------------------------------------

/// Predicate that halts further escalation when met. Evaluated strictly
/// after the current tier's deliveries have been folded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopCondition {
    /// The patient responded, with any response type.
    PatientResponded,
    /// Someone other than the patient confirmed the patient is safe.
    FamilyConfirmedSafe,
    /// Anyone reported the medication as taken.
    MedicationTaken,
    /// A response of an explicitly named type arrived. Configuration
    /// decides what counts; nothing is inferred from locale or flow.
    ResponseOfType { response_type: ResponseType },
}

impl StopCondition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PatientResponded => "patient_responded",
            Self::FamilyConfirmedSafe => "family_confirmed_safe",
            Self::MedicationTaken => "medication_taken",
            Self::ResponseOfType { .. } => "response_of_type",
        }
    }

    /// Evaluate against the responses appended so far, in arrival order.
    pub fn is_met(&self, responses: &[Response]) -> bool {
        match self {
            Self::PatientResponded => responses
                .iter()
                .any(|r| r.responder_role == ResponderRole::Patient),
            Self::FamilyConfirmedSafe => responses.iter().any(|r| {
                r.responder_role != ResponderRole::Patient
                    && r.responder_role != ResponderRole::System
                    && r.response_type == ResponseType::PatientSafe
            }),
            Self::MedicationTaken => responses
                .iter()
                .any(|r| r.response_type == ResponseType::MedicationTaken),
            Self::ResponseOfType { response_type } => {
                responses.iter().any(|r| r.response_type == *response_type)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Escalation plan
// ---------------------------------------------------------------------------

/// One unit of work within a tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationAction {
    /// Which directory roles this action targets.
    pub roles: Vec<RecipientRole>,
    /// Allowed delivery channels, ordered by preference.
    pub channels: Vec<ChannelKind>,
    /// Template key passed to the message composer.
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default = "default_action_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_template() -> String {
    "default".to_string()
}

fn default_action_timeout() -> u64 {
    DEFAULT_ACTION_TIMEOUT_SECONDS
}

/// Ordered step within an escalation plan. Read-only configuration,
/// not per-instance state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationTier {
    /// 1..N, monotonically increasing urgency.
    pub level: u32,
    /// Minutes to wait after the previous tier before executing.
    #[serde(default)]
    pub delay_minutes: i64,
    pub actions: Vec<EscalationAction>,
    #[serde(default)]
    pub stop_conditions: Vec<StopCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPlan {
    pub tiers: Vec<EscalationTier>,
    #[serde(default = "default_overall_timeout")]
    pub overall_timeout_minutes: i64,
}

fn default_overall_timeout() -> i64 {
    DEFAULT_OVERALL_TIMEOUT_MINUTES
}

// ---------------------------------------------------------------------------
// Trigger conditions
// ---------------------------------------------------------------------------

/// Per-trigger detection behavior. `require_confirmation` holds an
/// opened emergency in `detected` until explicitly confirmed;
/// `auto_resolve` closes an unresolved escalation as resolved after
/// `auto_resolve_minutes` instead of letting it run to the timeout
/// ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub require_confirmation: bool,
    #[serde(default)]
    pub auto_resolve: bool,
    #[serde(default)]
    pub auto_resolve_minutes: Option<i64>,
}

fn default_true() -> bool {
    true
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_confirmation: false,
            auto_resolve: false,
            auto_resolve_minutes: None,
        }
    }
}

/// A named, versioned detection rule with its escalation plan.
/// Immutable once loaded; replaced only by a rule-set reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub id: String,
    pub trigger_type: TriggerType,
    pub severity: Severity,
    /// Minutes past the scheduled/expected time before the condition holds.
    #[serde(default)]
    pub time_threshold_minutes: Option<i64>,
    /// Consecutive missed doses required (overdue-dose rules).
    #[serde(default)]
    pub consecutive_misses: Option<u32>,
    /// Only fire for medications of at least this criticality class.
    #[serde(default)]
    pub criticality: Option<CriticalityClass>,
    /// Only fire for patients in one of these risk classes; empty = any.
    #[serde(default)]
    pub risk_classes: Vec<RiskClass>,
    /// Advisory window; checked against `max_detection_minutes` at load.
    #[serde(default)]
    pub detection_window_minutes: Option<i64>,
    #[serde(default)]
    pub max_detection_minutes: Option<i64>,
    #[serde(default)]
    pub detection: DetectionConfig,
    pub escalation: EscalationPlan,
}

// ---------------------------------------------------------------------------
// RuleSet + RuleBook
// ---------------------------------------------------------------------------

/// Versioned rule document supplied by configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: u32,
    pub triggers: Vec<TriggerCondition>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            version: 1,
            triggers: Vec::new(),
        }
    }
}

impl RuleSet {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let rules: RuleSet = serde_json::from_str(json)?;
        rules.log_advisories();
        Ok(rules)
    }

    /// First trigger condition of the given type, regardless of enabled flag.
    pub fn find(&self, trigger_type: TriggerType) -> Option<&TriggerCondition> {
        self.triggers.iter().find(|t| t.trigger_type == trigger_type)
    }

    /// First enabled trigger condition matching the type.
    pub fn find_enabled(&self, trigger_type: TriggerType) -> Option<&TriggerCondition> {
        self.triggers
            .iter()
            .find(|t| t.trigger_type == trigger_type && t.detection.enabled)
    }

    pub fn find_by_id(&self, id: &str) -> Option<&TriggerCondition> {
        self.triggers.iter().find(|t| t.id == id)
    }

    /// The window/max relation is advisory, not enforced.
    fn log_advisories(&self) {
        for trigger in &self.triggers {
            if let (Some(window), Some(max)) =
                (trigger.detection_window_minutes, trigger.max_detection_minutes)
            {
                if window > max {
                    tracing::warn!(
                        trigger_id = %trigger.id,
                        window,
                        max,
                        "Detection window exceeds max detection time"
                    );
                }
            }
            if trigger.escalation.tiers.is_empty() {
                tracing::warn!(trigger_id = %trigger.id, "Trigger has no escalation tiers");
            }
        }
    }
}

/// Shared handle over the active rule set. Reload swaps the whole set
/// atomically; emergencies already in flight keep the trigger condition
/// they were bound to at creation.
pub struct RuleBook {
    inner: RwLock<Arc<RuleSet>>,
}

impl RuleBook {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            inner: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn current(&self) -> Arc<RuleSet> {
        self.inner
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|poisoned| Arc::clone(&poisoned.into_inner()))
    }

    pub fn reload(&self, rules: RuleSet) {
        let version = rules.version;
        let next = Arc::new(rules);
        match self.inner.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!(version, "Rule set reloaded");
    }
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// When set, a repeat trigger for the same patient + trigger type +
    /// medication within this window returns the existing emergency id
    /// instead of opening a duplicate.
    #[serde(default)]
    pub dedup_window_minutes: Option<i64>,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_tier_budget")]
    pub tier_budget_seconds: u64,
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_tier_budget() -> u64 {
    DEFAULT_TIER_BUDGET_SECONDS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dedup_window_minutes: None,
            history_limit: default_history_limit(),
            tier_budget_seconds: default_tier_budget(),
        }
    }
}
