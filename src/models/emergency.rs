use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{
    ActionStatus, ChannelKind, CriticalityClass, DeliveryStatus, EmergencyStatus, ResponderRole,
    ResponseType, RiskClass, Severity, TriggerType,
};

// ---------------------------------------------------------------------------
// TriggerContext
// ---------------------------------------------------------------------------

/// Observation context supplied by the external adherence monitor when a
/// trigger fires. Which fields are present depends on the trigger type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerContext {
    /// Display name used in composed messages.
    pub patient_name: Option<String>,
    pub medication_id: Option<Uuid>,
    pub medication_name: Option<String>,
    /// When the missed dose was scheduled to be taken.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Consecutive missed doses observed by the monitor.
    pub missed_count: Option<u32>,
    /// Minutes since the patient was last seen active.
    pub inactivity_minutes: Option<i64>,
    pub severity_hint: Option<Severity>,
    pub criticality: Option<CriticalityClass>,
    pub risk_class: Option<RiskClass>,
    pub note: Option<String>,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Geolocation attached to a response, when the responder shared one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// An authoritative human-originated signal about an emergency.
/// Append-only: responses are never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub responder_id: Uuid,
    pub responder_role: ResponderRole,
    pub response_type: ResponseType,
    pub message: Option<String>,
    pub location: Option<GeoPoint>,
    pub received_at: DateTime<Utc>,
}

/// Attribution for a resolved emergency. Set at most once; the first
/// resolving signal wins even when responses race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedBy {
    pub role: ResponderRole,
    pub responder_id: Option<Uuid>,
    pub response_type: Option<ResponseType>,
    /// Stop-condition name for system-attributed resolutions.
    pub detail: Option<String>,
}

impl ResolvedBy {
    pub fn responder(response: &Response) -> Self {
        Self {
            role: response.responder_role,
            responder_id: Some(response.responder_id),
            response_type: Some(response.response_type),
            detail: None,
        }
    }

    pub fn system(detail: &str) -> Self {
        Self {
            role: ResponderRole::System,
            responder_id: None,
            response_type: None,
            detail: Some(detail.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery records
// ---------------------------------------------------------------------------

/// Outcome of one (recipient, channel) delivery attempt, after retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub recipient_id: Uuid,
    pub recipient_name: String,
    pub channel: ChannelKind,
    pub status: DeliveryStatus,
    pub message_id: Option<Uuid>,
    pub error: Option<String>,
    /// Number of transport attempts made before settling.
    pub tries: u32,
    pub completed_at: DateTime<Utc>,
}

/// Folded outcome of one executed escalation action within one tier.
/// Attempts are stored in the order they settled, not launch order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub tier_index: usize,
    pub action_index: usize,
    pub attempts: Vec<DeliveryAttempt>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ActionResult {
    /// Aggregate status derived from the per-attempt outcomes.
    pub fn status(&self) -> ActionStatus {
        let delivered = self
            .attempts
            .iter()
            .filter(|a| a.status == DeliveryStatus::Delivered)
            .count();
        if delivered == 0 {
            ActionStatus::Failed
        } else if delivered == self.attempts.len() {
            ActionStatus::Delivered
        } else {
            ActionStatus::Partial
        }
    }

    pub fn delivered_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.status == DeliveryStatus::Delivered)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.attempts.len() - self.delivered_count()
    }
}

// ---------------------------------------------------------------------------
// Emergency
// ---------------------------------------------------------------------------

/// The central mutable aggregate: one escalation lifecycle for one
/// detected condition. Created by the engine on successful trigger
/// validation; mutated only through the store while the scheduler or
/// response recording holds the write lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emergency {
    pub id: Uuid,
    pub patient_id: Uuid,
    /// Id of the trigger condition that fired, bound at creation.
    /// Rule reloads do not rebind in-flight emergencies.
    pub trigger_id: String,
    pub trigger_type: TriggerType,
    pub severity: Severity,
    pub context: TriggerContext,
    pub status: EmergencyStatus,
    pub current_tier_index: usize,
    pub detected_at: DateTime<Utc>,
    pub escalation_started_at: Option<DateTime<Utc>>,
    pub last_escalation_at: Option<DateTime<Utc>>,
    pub action_results: Vec<ActionResult>,
    pub responses: Vec<Response>,
    pub resolved_by: Option<ResolvedBy>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Emergency {
    pub fn new(
        patient_id: Uuid,
        trigger_id: &str,
        trigger_type: TriggerType,
        severity: Severity,
        context: TriggerContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            trigger_id: trigger_id.to_string(),
            trigger_type,
            severity,
            context,
            status: EmergencyStatus::Detected,
            current_tier_index: 0,
            detected_at: Utc::now(),
            escalation_started_at: None,
            last_escalation_at: None,
            action_results: Vec::new(),
            responses: Vec::new(),
            resolved_by: None,
            resolved_at: None,
        }
    }

    /// Move to a tier. The tier index never decreases; a stale or replayed
    /// advance is ignored rather than rewinding the record.
    pub fn advance_tier(&mut self, tier_index: usize) {
        if tier_index >= self.current_tier_index {
            self.current_tier_index = tier_index;
        }
        self.last_escalation_at = Some(Utc::now());
        if !self.status.is_terminal() && self.status != EmergencyStatus::ManualReview {
            self.status = EmergencyStatus::Escalating;
        }
    }

    pub fn begin_escalation(&mut self) {
        if self.escalation_started_at.is_none() {
            self.escalation_started_at = Some(Utc::now());
        }
        if !self.status.is_terminal() {
            self.status = EmergencyStatus::Escalating;
        }
    }

    /// Append a response in arrival order. Always recorded, including
    /// after the emergency reached a terminal status.
    pub fn append_response(&mut self, response: Response) {
        if !self.status.is_terminal()
            && self.status != EmergencyStatus::ManualReview
            && !response.response_type.is_resolving()
        {
            self.status = EmergencyStatus::Responded;
        }
        self.responses.push(response);
    }

    /// Set a terminal status exactly once. Returns false when the
    /// emergency already reached a terminal status; attribution is
    /// never overwritten.
    pub fn try_terminate(&mut self, status: EmergencyStatus, resolved_by: Option<ResolvedBy>) -> bool {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.resolved_by = resolved_by;
        self.resolved_at = Some(Utc::now());
        true
    }

    /// Park the emergency for operator review after an internal fault.
    pub fn mark_manual_review(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = EmergencyStatus::ManualReview;
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_emergency() -> Emergency {
        Emergency::new(
            Uuid::new_v4(),
            "trig-missed-critical",
            TriggerType::MissedCriticalMedication,
            Severity::Critical,
            TriggerContext::default(),
        )
    }

    fn make_response(response_type: ResponseType) -> Response {
        Response {
            id: Uuid::new_v4(),
            responder_id: Uuid::new_v4(),
            responder_role: ResponderRole::Family,
            response_type,
            message: None,
            location: None,
            received_at: Utc::now(),
        }
    }

    fn make_attempt(status: DeliveryStatus) -> DeliveryAttempt {
        DeliveryAttempt {
            recipient_id: Uuid::new_v4(),
            recipient_name: "Ana".into(),
            channel: ChannelKind::Sms,
            status,
            message_id: Some(Uuid::new_v4()),
            error: None,
            tries: 1,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn new_emergency_starts_detected_at_tier_zero() {
        let e = make_emergency();
        assert_eq!(e.status, EmergencyStatus::Detected);
        assert_eq!(e.current_tier_index, 0);
        assert!(e.action_results.is_empty());
        assert!(e.responses.is_empty());
        assert!(e.resolved_by.is_none());
    }

    #[test]
    fn tier_index_never_decreases() {
        let mut e = make_emergency();
        e.advance_tier(2);
        assert_eq!(e.current_tier_index, 2);
        e.advance_tier(1);
        assert_eq!(e.current_tier_index, 2);
        e.advance_tier(3);
        assert_eq!(e.current_tier_index, 3);
    }

    #[test]
    fn terminal_status_set_at_most_once() {
        let mut e = make_emergency();
        let first = make_response(ResponseType::MedicationTaken);
        assert!(e.try_terminate(
            EmergencyStatus::Resolved,
            Some(ResolvedBy::responder(&first)),
        ));
        let first_responder = e.resolved_by.as_ref().unwrap().responder_id;

        // Second resolution attempt is a no-op and keeps attribution.
        let second = make_response(ResponseType::PatientSafe);
        assert!(!e.try_terminate(
            EmergencyStatus::Resolved,
            Some(ResolvedBy::responder(&second)),
        ));
        assert_eq!(e.resolved_by.as_ref().unwrap().responder_id, first_responder);

        // Timeout after resolution does not overwrite either.
        assert!(!e.try_terminate(EmergencyStatus::Timeout, None));
        assert_eq!(e.status, EmergencyStatus::Resolved);
    }

    #[test]
    fn responses_recorded_after_termination() {
        let mut e = make_emergency();
        e.try_terminate(EmergencyStatus::Cancelled, None);
        e.append_response(make_response(ResponseType::PatientSafe));
        assert_eq!(e.responses.len(), 1);
        assert_eq!(e.status, EmergencyStatus::Cancelled);
    }

    #[test]
    fn non_resolving_response_marks_responded() {
        let mut e = make_emergency();
        e.begin_escalation();
        e.append_response(make_response(ResponseType::NeedHelp));
        assert_eq!(e.status, EmergencyStatus::Responded);
    }

    #[test]
    fn begin_escalation_is_idempotent() {
        let mut e = make_emergency();
        e.begin_escalation();
        let started = e.escalation_started_at;
        assert!(started.is_some());
        e.begin_escalation();
        assert_eq!(e.escalation_started_at, started);
    }

    #[test]
    fn action_result_aggregate_status() {
        let mut result = ActionResult {
            tier_index: 0,
            action_index: 0,
            attempts: vec![
                make_attempt(DeliveryStatus::Delivered),
                make_attempt(DeliveryStatus::Delivered),
            ],
            started_at: Utc::now(),
            completed_at: Utc::now(),
        };
        assert_eq!(result.status(), ActionStatus::Delivered);

        result.attempts.push(make_attempt(DeliveryStatus::Failed));
        assert_eq!(result.status(), ActionStatus::Partial);
        assert_eq!(result.delivered_count(), 2);
        assert_eq!(result.failed_count(), 1);

        result.attempts = vec![
            make_attempt(DeliveryStatus::Failed),
            make_attempt(DeliveryStatus::Timeout),
        ];
        assert_eq!(result.status(), ActionStatus::Failed);
    }

    #[test]
    fn manual_review_does_not_override_terminal() {
        let mut e = make_emergency();
        e.try_terminate(EmergencyStatus::Resolved, Some(ResolvedBy::system("test")));
        assert!(!e.mark_manual_review());
        assert_eq!(e.status, EmergencyStatus::Resolved);
    }
}
