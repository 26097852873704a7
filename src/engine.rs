//! Engine entry point. Validates incoming triggers against the active
//! rule set, opens emergency records, hands them to the escalation
//! scheduler, and applies responder signals. Everything external — the
//! adherence monitor, the contact graph, channel transports, durable
//! storage — arrives through the contracts in the sibling modules.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::{EngineConfig, RuleBook, RuleSet};
use crate::detection::validate_condition;
use crate::dispatch::{DeliveryDispatcher, DeliveryEvent};
use crate::messages::MessageComposer;
use crate::models::enums::{EmergencyStatus, TriggerType};
use crate::models::{Emergency, ResolvedBy, Response, TriggerContext};
use crate::recipients::{ContactDirectory, RecipientResolver};
use crate::scheduler::{EscalationContext, EscalationScheduler};
use crate::store::{EmergencyRepository, EmergencyStore, StoreError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No enabled trigger condition for type '{0}'")]
    NoActiveTrigger(TriggerType),

    #[error("Trigger condition '{trigger_id}' not met by the supplied context")]
    ConditionNotMet { trigger_id: String },

    #[error("Emergency not found: {0}")]
    EmergencyNotFound(Uuid),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::EmergencyNotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Result of a trigger report accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// A new emergency was opened and escalation scheduled.
    Opened(Uuid),
    /// A matching emergency is already in flight within the dedup
    /// window; no new record was opened.
    Duplicate(Uuid),
}

impl DetectionOutcome {
    pub fn emergency_id(&self) -> Uuid {
        match self {
            Self::Opened(id) | Self::Duplicate(id) => *id,
        }
    }
}

/// The adherence emergency engine. One instance per deployment; all
/// methods take `&self` and are safe to call from concurrent tasks.
pub struct EmergencyEngine {
    config: EngineConfig,
    rules: RuleBook,
    store: Arc<EmergencyStore>,
    repository: Arc<dyn EmergencyRepository>,
    dispatcher: Arc<DeliveryDispatcher>,
    scheduler: EscalationScheduler,
}

impl EmergencyEngine {
    pub fn new(
        config: EngineConfig,
        rules: RuleSet,
        directory: Arc<dyn ContactDirectory>,
        repository: Arc<dyn EmergencyRepository>,
        dispatcher: DeliveryDispatcher,
        composer: MessageComposer,
    ) -> Self {
        let store = Arc::new(EmergencyStore::new(config.history_limit));
        let dispatcher = Arc::new(dispatcher);
        let scheduler = EscalationScheduler::new(EscalationContext {
            store: Arc::clone(&store),
            repository: Arc::clone(&repository),
            resolver: RecipientResolver::new(directory),
            composer,
            dispatcher: Arc::clone(&dispatcher),
            tier_budget: Duration::from_secs(config.tier_budget_seconds),
        });
        Self {
            config,
            rules: RuleBook::new(rules),
            store,
            repository,
            dispatcher,
            scheduler,
        }
    }

    /// Validate a reported trigger and, when the condition holds, open an
    /// emergency and start its escalation. The trigger condition is bound
    /// to the emergency at this point; later rule reloads do not affect it.
    pub async fn detect_emergency(
        &self,
        patient_id: Uuid,
        trigger_type: TriggerType,
        context: TriggerContext,
    ) -> Result<DetectionOutcome, EngineError> {
        let rules = self.rules.current();
        let trigger = rules
            .find_enabled(trigger_type)
            .ok_or(EngineError::NoActiveTrigger(trigger_type))?;

        let now = Utc::now();
        if !validate_condition(trigger, &context, now) {
            return Err(EngineError::ConditionNotMet {
                trigger_id: trigger.id.clone(),
            });
        }

        if let Some(window) = self.config.dedup_window_minutes {
            let duplicate = self.store.find_recent_duplicate(
                patient_id,
                trigger_type,
                context.medication_id,
                chrono::Duration::minutes(window),
                now,
            )?;
            if let Some(existing) = duplicate {
                tracing::info!(
                    emergency_id = %existing,
                    patient_id = %patient_id,
                    trigger_type = trigger_type.as_str(),
                    "Repeat trigger within dedup window; joining existing emergency"
                );
                return Ok(DetectionOutcome::Duplicate(existing));
            }
        }

        // A severity hint from the monitor can raise, never lower, the
        // rule's configured severity.
        let severity = context
            .severity_hint
            .map_or(trigger.severity, |hint| hint.max(trigger.severity));

        let emergency = Emergency::new(patient_id, &trigger.id, trigger_type, severity, context);
        let id = emergency.id;
        self.store.insert(emergency.clone())?;
        self.repository.save(&emergency).await?;

        tracing::warn!(
            emergency_id = %id,
            patient_id = %patient_id,
            trigger_id = %trigger.id,
            trigger_type = trigger_type.as_str(),
            severity = severity.as_str(),
            "Emergency detected"
        );

        if trigger.detection.require_confirmation {
            tracing::info!(
                emergency_id = %id,
                trigger_id = %trigger.id,
                "Detection awaiting confirmation before escalation"
            );
        } else {
            self.scheduler
                .schedule(id, Arc::new(trigger.clone()), 0, Duration::ZERO);
        }
        Ok(DetectionOutcome::Opened(id))
    }

    /// Start escalation for a detection opened under a rule with
    /// `require_confirmation`. A no-op for records that are already
    /// escalating or closed.
    pub async fn confirm_emergency(&self, emergency_id: Uuid) -> Result<Emergency, EngineError> {
        let emergency = self.get_emergency(emergency_id)?;
        if emergency.escalation_started_at.is_some() || emergency.is_terminal() {
            return Ok(emergency);
        }
        let rules = self.rules.current();
        let trigger = rules
            .find_by_id(&emergency.trigger_id)
            .cloned()
            .ok_or(EngineError::NoActiveTrigger(emergency.trigger_type))?;
        tracing::info!(
            emergency_id = %emergency_id,
            trigger_id = %emergency.trigger_id,
            "Detection confirmed; starting escalation"
        );
        self.scheduler
            .schedule(emergency_id, Arc::new(trigger), 0, Duration::ZERO);
        Ok(emergency)
    }

    /// Record a responder signal against an emergency. Responses are
    /// always appended, even after a terminal status; a resolving
    /// response type additionally terminates the emergency and cancels
    /// its escalation. When responses race, the first resolving one wins
    /// and keeps the attribution.
    pub async fn record_response(
        &self,
        emergency_id: Uuid,
        response: Response,
    ) -> Result<Emergency, EngineError> {
        let resolving = response.response_type.is_resolving();
        let attribution = ResolvedBy::responder(&response);

        let active = self.store.update(emergency_id, |e| {
            e.append_response(response.clone());
            if resolving {
                e.try_terminate(EmergencyStatus::Resolved, Some(attribution.clone()))
            } else {
                false
            }
        });
        let (terminated, snapshot) = match active {
            Ok(pair) => pair,
            // Already closed and archived: the response ledger still
            // grows, but status and attribution are settled.
            Err(StoreError::NotFound(_)) => {
                let (_, snapshot) = self
                    .store
                    .update_closed(emergency_id, |e| e.append_response(response.clone()))?;
                (false, snapshot)
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            emergency_id = %emergency_id,
            responder_id = %response.responder_id,
            response_type = response.response_type.as_str(),
            "Response recorded"
        );

        self.repository.save(&snapshot).await?;
        if terminated {
            self.scheduler.cancel(emergency_id);
            self.store.archive(emergency_id)?;
            tracing::info!(
                emergency_id = %emergency_id,
                responder_id = %response.responder_id,
                "Emergency resolved by responder"
            );
        }
        Ok(snapshot)
    }

    /// Terminate an emergency without a responder, e.g. an operator
    /// dismissing a false alarm. First terminal status wins.
    pub async fn cancel_emergency(
        &self,
        emergency_id: Uuid,
        reason: &str,
    ) -> Result<Emergency, EngineError> {
        let (terminated, snapshot) = self.store.update(emergency_id, |e| {
            e.try_terminate(EmergencyStatus::Cancelled, Some(ResolvedBy::system(reason)))
        })?;
        self.repository.save(&snapshot).await?;
        if terminated {
            self.scheduler.cancel(emergency_id);
            self.store.archive(emergency_id)?;
            tracing::info!(emergency_id = %emergency_id, reason, "Emergency cancelled");
        }
        Ok(snapshot)
    }

    pub fn get_emergency(&self, emergency_id: Uuid) -> Result<Emergency, EngineError> {
        self.store
            .get(emergency_id)?
            .ok_or(EngineError::EmergencyNotFound(emergency_id))
    }

    /// Active emergencies ordered by detection time.
    pub fn active_emergencies(&self) -> Result<Vec<Emergency>, EngineError> {
        Ok(self.store.active()?)
    }

    /// Recently closed emergencies, most recent first.
    pub fn history(&self, limit: usize) -> Result<Vec<Emergency>, EngineError> {
        Ok(self.store.history(limit)?)
    }

    /// Per-attempt delivery events for analytics and audit consumers.
    pub fn subscribe_delivery_events(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.dispatcher.subscribe()
    }

    /// Swap in a new rule set. In-flight emergencies keep the trigger
    /// condition they were bound to at detection.
    pub fn reload_rules(&self, rules: RuleSet) {
        self.rules.reload(rules);
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.current()
    }

    /// Reload persisted active emergencies after a restart and resume
    /// their escalations. Consumed ceiling time carries over; an
    /// emergency whose trigger condition no longer exists in the current
    /// rule set is parked for manual review instead of being dropped.
    pub async fn resume_active(&self) -> Result<usize, EngineError> {
        let persisted = self.repository.load_active().await?;
        let rules = self.rules.current();
        let now = Utc::now();
        let mut resumed = 0;

        for emergency in persisted {
            let id = emergency.id;
            let trigger = rules.find_by_id(&emergency.trigger_id).cloned();
            self.store.insert(emergency.clone())?;

            match trigger {
                Some(trigger) => {
                    // An unconfirmed detection keeps waiting for its
                    // confirmation across restarts.
                    if trigger.detection.require_confirmation
                        && emergency.escalation_started_at.is_none()
                    {
                        tracing::info!(
                            emergency_id = %id,
                            trigger_id = %emergency.trigger_id,
                            "Restored detection still awaiting confirmation"
                        );
                        continue;
                    }
                    // The persisted tier already executed; resume with
                    // the next one and the ceiling time already spent.
                    let start_tier = if emergency.last_escalation_at.is_some() {
                        emergency.current_tier_index + 1
                    } else {
                        0
                    };
                    let elapsed = emergency
                        .escalation_started_at
                        .map(|t| (now - t).to_std().unwrap_or_default())
                        .unwrap_or_default();
                    tracing::info!(
                        emergency_id = %id,
                        trigger_id = %emergency.trigger_id,
                        start_tier,
                        "Resuming escalation after restart"
                    );
                    self.scheduler
                        .schedule(id, Arc::new(trigger), start_tier, elapsed);
                    resumed += 1;
                }
                None => {
                    tracing::error!(
                        emergency_id = %id,
                        trigger_id = %emergency.trigger_id,
                        "Trigger condition missing after restart; parking for manual review"
                    );
                    let (_, snapshot) = self.store.update(id, |e| e.mark_manual_review())?;
                    self.repository.save(&snapshot).await?;
                }
            }
        }
        Ok(resumed)
    }

    /// Stop all escalation tasks and persist the active set. Emergencies
    /// stay active in storage and resume on the next start.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.scheduler.shutdown().await;
        for emergency in self.store.active()? {
            self.repository.save(&emergency).await?;
        }
        tracing::info!("Emergency engine stopped");
        Ok(())
    }

    pub fn pending_escalations(&self) -> usize {
        self.scheduler.pending_count()
    }
}
