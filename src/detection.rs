//! Pure trigger validation. Given a trigger condition and the observation
//! context supplied by the adherence monitor, decide whether the observed
//! condition constitutes an emergency. No clock access: `now` is a
//! parameter so the predicates stay deterministic and testable.

use chrono::{DateTime, Utc};

use crate::config::TriggerCondition;
use crate::models::enums::TriggerType;
use crate::models::TriggerContext;

/// Evaluate a trigger condition against the observed context.
pub fn validate_condition(
    trigger: &TriggerCondition,
    context: &TriggerContext,
    now: DateTime<Utc>,
) -> bool {
    if !patient_filters_match(trigger, context) {
        return false;
    }

    match trigger.trigger_type {
        TriggerType::Manual => true,
        TriggerType::MissedCriticalMedication => threshold_elapsed(trigger, context, now),
        TriggerType::OverdueDose => {
            consecutive_misses_reached(trigger, context)
                && threshold_elapsed(trigger, context, now)
        }
        TriggerType::ProlongedInactivity => inactivity_exceeded(trigger, context),
        TriggerType::HealthIncident => severity_sufficient(trigger, context),
    }
}

/// Criticality and risk-class filters common to all trigger types.
fn patient_filters_match(trigger: &TriggerCondition, context: &TriggerContext) -> bool {
    if let Some(required) = trigger.criticality {
        if context.criticality != Some(required) {
            tracing::debug!(
                trigger_id = %trigger.id,
                required = required.as_str(),
                "Criticality class does not match"
            );
            return false;
        }
    }

    if !trigger.risk_classes.is_empty() {
        match context.risk_class {
            Some(risk) if trigger.risk_classes.contains(&risk) => {}
            _ => {
                tracing::debug!(trigger_id = %trigger.id, "Patient risk class out of scope");
                return false;
            }
        }
    }

    true
}

/// Time since the scheduled dose must meet or exceed the threshold.
/// Without a scheduled time there is nothing to measure against.
fn threshold_elapsed(
    trigger: &TriggerCondition,
    context: &TriggerContext,
    now: DateTime<Utc>,
) -> bool {
    let Some(scheduled) = context.scheduled_time else {
        return false;
    };
    let threshold = trigger.time_threshold_minutes.unwrap_or(0);
    let elapsed = (now - scheduled).num_minutes();
    elapsed >= threshold
}

fn consecutive_misses_reached(trigger: &TriggerCondition, context: &TriggerContext) -> bool {
    let required = trigger.consecutive_misses.unwrap_or(1);
    context.missed_count.unwrap_or(0) >= required
}

fn inactivity_exceeded(trigger: &TriggerCondition, context: &TriggerContext) -> bool {
    let Some(threshold) = trigger.time_threshold_minutes else {
        return false;
    };
    context.inactivity_minutes.unwrap_or(0) >= threshold
}

/// Incident reports fire unless the monitor explicitly rated them below
/// the rule's severity.
fn severity_sufficient(trigger: &TriggerCondition, context: &TriggerContext) -> bool {
    match context.severity_hint {
        Some(hint) => hint >= trigger.severity,
        None => true,
    }
}
