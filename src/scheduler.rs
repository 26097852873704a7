//! Escalation scheduling. One tokio task per emergency owns that
//! emergency's tier progression: timer waits between tiers, concurrent
//! fan-out of delivery attempts, stop-condition evaluation, and the
//! overall timeout ceiling. Tasks are keyed by emergency id with a
//! oneshot cancel handle; rescheduling an id replaces (and cancels) any
//! prior pending timer for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{EscalationAction, EscalationTier, StopCondition, TriggerCondition};
use crate::dispatch::DeliveryDispatcher;
use crate::messages::{MessageComposer, MessageVars};
use crate::models::enums::EmergencyStatus;
use crate::models::{ActionResult, DeliveryAttempt, Recipient, ResolvedBy, Response};
use crate::recipients::RecipientResolver;
use crate::store::{EmergencyRepository, EmergencyStore, StoreError};

/// Shared collaborators the per-emergency tasks work against.
pub struct EscalationContext {
    pub store: Arc<EmergencyStore>,
    pub repository: Arc<dyn EmergencyRepository>,
    pub resolver: RecipientResolver,
    pub composer: MessageComposer,
    pub dispatcher: Arc<DeliveryDispatcher>,
    /// Upper bound on one tier's fan-out.
    pub tier_budget: Duration,
}

struct TaskEntry {
    generation: u64,
    cancel: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Owns the per-emergency escalation tasks.
pub struct EscalationScheduler {
    ctx: Arc<EscalationContext>,
    tasks: Arc<Mutex<HashMap<Uuid, TaskEntry>>>,
    next_generation: Mutex<u64>,
}

impl EscalationScheduler {
    pub fn new(ctx: EscalationContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Mutex::new(0),
        }
    }

    /// Start (or restart) escalation for an emergency. `start_tier` is
    /// the next tier to execute: 0 for a fresh emergency, the persisted
    /// index + 1 when resuming after a restart. `elapsed` is how much of
    /// the overall ceiling was already consumed before this call.
    pub fn schedule(
        &self,
        emergency_id: Uuid,
        trigger: Arc<TriggerCondition>,
        start_tier: usize,
        elapsed: Duration,
    ) {
        let generation = {
            let mut next = match self.next_generation.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *next += 1;
            *next
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let ctx = Arc::clone(&self.ctx);
        let tasks = Arc::clone(&self.tasks);

        let join = tokio::spawn(async move {
            run_escalation(ctx, emergency_id, trigger, start_tier, elapsed, cancel_rx).await;
            let mut tasks = match tasks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if tasks.get(&emergency_id).map(|t| t.generation) == Some(generation) {
                tasks.remove(&emergency_id);
            }
        });

        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = tasks.insert(
            emergency_id,
            TaskEntry {
                generation,
                cancel: cancel_tx,
                join,
            },
        ) {
            // Replacing cancels the prior pending timer for this id.
            let _ = previous.cancel.send(());
        }
    }

    /// Cancel the pending timer/task for an emergency, if any. Safe to
    /// call for unknown ids.
    pub fn cancel(&self, emergency_id: Uuid) {
        let entry = {
            let mut tasks = match self.tasks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            tasks.remove(&emergency_id)
        };
        if let Some(entry) = entry {
            let _ = entry.cancel.send(());
        }
    }

    /// Cancel all tasks and wait for them to wind down. In-flight
    /// deliveries finish their current attempt before the task exits.
    pub async fn shutdown(&self) {
        let entries: Vec<TaskEntry> = {
            let mut tasks = match self.tasks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            tasks.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.cancel.send(());
            let _ = entry.join.await;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Per-emergency task
// ---------------------------------------------------------------------------

async fn run_escalation(
    ctx: Arc<EscalationContext>,
    emergency_id: Uuid,
    trigger: Arc<TriggerCondition>,
    start_tier: usize,
    elapsed: Duration,
    mut cancel: oneshot::Receiver<()>,
) {
    let plan = &trigger.escalation;
    let overall = Duration::from_secs((plan.overall_timeout_minutes.max(0) as u64) * 60);

    // An auto-resolving rule closes the record as resolved before the
    // timeout ceiling would fire; otherwise the plan ceiling closes it
    // as timeout.
    let auto_resolve = trigger
        .detection
        .auto_resolve
        .then_some(trigger.detection.auto_resolve_minutes)
        .flatten()
        .map(|m| Duration::from_secs((m.max(0) as u64) * 60));
    let (bound, expiry) = match auto_resolve {
        Some(after) if after < overall => (after, Expiry::AutoResolve),
        _ => (overall, Expiry::Timeout),
    };
    let ceiling = tokio::time::Instant::now() + bound.saturating_sub(elapsed);

    if let Err(e) = begin(&ctx, emergency_id).await {
        fault(&ctx, emergency_id, &e).await;
        return;
    }

    let mut tier_index = start_tier;
    while tier_index < plan.tiers.len() {
        let tier = &plan.tiers[tier_index];

        // Tier 0 of a fresh escalation executes immediately; every other
        // tier (including a resumed one) waits out its delay, bounded by
        // the overall ceiling.
        if tier_index > 0 || start_tier > 0 {
            let delay = Duration::from_secs((tier.delay_minutes.max(0) as u64) * 60);
            let wake = tokio::time::Instant::now() + delay;
            if wake >= ceiling {
                tokio::select! {
                    _ = &mut cancel => return,
                    _ = tokio::time::sleep_until(ceiling) => {
                        close_expired(&ctx, emergency_id, tier_for_checks(plan, tier_index), expiry)
                            .await;
                        return;
                    }
                }
            }
            tokio::select! {
                _ = &mut cancel => return,
                _ = tokio::time::sleep_until(wake) => {}
            }
        }

        match execute_tier(&ctx, emergency_id, tier_index, tier, ceiling).await {
            Ok(TierVerdict::Continue) => {}
            Ok(TierVerdict::Stopped) => return,
            Err(StoreError::NotFound(_)) => return, // resolved elsewhere
            Err(e) => {
                fault(&ctx, emergency_id, &e).await;
                return;
            }
        }

        // A slow fan-out may have consumed the remaining ceiling.
        if tokio::time::Instant::now() >= ceiling {
            close_expired(&ctx, emergency_id, Some(tier), expiry).await;
            return;
        }

        tier_index += 1;
    }

    // Tiers exhausted without resolution: stay responsive until the
    // ceiling, then close unless an explicit response wins.
    tokio::select! {
        _ = &mut cancel => {}
        _ = tokio::time::sleep_until(ceiling) => {
            close_expired(&ctx, emergency_id, plan.tiers.last(), expiry).await;
        }
    }
}

fn tier_for_checks(
    plan: &crate::config::EscalationPlan,
    upcoming: usize,
) -> Option<&EscalationTier> {
    // The tier whose stop conditions were last in force.
    upcoming.checked_sub(1).and_then(|i| plan.tiers.get(i))
}

async fn begin(ctx: &Arc<EscalationContext>, emergency_id: Uuid) -> Result<(), StoreError> {
    let (_, snapshot) = ctx.store.update(emergency_id, |e| e.begin_escalation())?;
    ctx.repository.save(&snapshot).await?;
    tracing::info!(
        emergency_id = %emergency_id,
        trigger_id = %snapshot.trigger_id,
        "Escalation started"
    );
    Ok(())
}

enum TierVerdict {
    Continue,
    Stopped,
}

async fn execute_tier(
    ctx: &Arc<EscalationContext>,
    emergency_id: Uuid,
    tier_index: usize,
    tier: &EscalationTier,
    ceiling: tokio::time::Instant,
) -> Result<TierVerdict, StoreError> {
    let (_, snapshot) = ctx.store.update(emergency_id, |e| e.advance_tier(tier_index))?;
    ctx.repository.save(&snapshot).await?;
    tracing::info!(
        emergency_id = %emergency_id,
        tier = tier.level,
        actions = tier.actions.len(),
        "Executing escalation tier"
    );

    let vars = MessageVars {
        patient_name: snapshot
            .context
            .patient_name
            .clone()
            .unwrap_or_else(|| "your family member".to_string()),
        medication_name: snapshot.context.medication_name.clone(),
    };

    // All actions of the tier fan out concurrently; each folds its own
    // attempts in settle order and appends its ActionResult as it
    // completes. The tier is complete only when every launched attempt
    // has settled, bounded by the tier budget.
    let mut actions: FuturesUnordered<_> = tier
        .actions
        .iter()
        .enumerate()
        .map(|(action_index, action)| {
            execute_action(ctx, emergency_id, &snapshot, tier_index, action_index, action, &vars)
        })
        .collect();

    let fold = async {
        while let Some(result) = actions.next().await {
            let (_, snapshot) = ctx
                .store
                .update(emergency_id, |e| e.action_results.push(result.clone()))?;
            ctx.repository.save(&snapshot).await?;
        }
        Ok::<(), StoreError>(())
    };

    // The fold never outlives the overall ceiling, however generous the
    // tier budget is.
    let fold_deadline = (tokio::time::Instant::now() + ctx.tier_budget).min(ceiling);
    match tokio::time::timeout_at(fold_deadline, fold).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            tracing::warn!(
                emergency_id = %emergency_id,
                tier = tier.level,
                "Tier fan-out cut short; abandoning unsettled attempts"
            );
        }
    }

    // Stop conditions are evaluated strictly after the fold, never
    // speculatively.
    if check_stop_conditions(ctx, emergency_id, Some(tier)).await? {
        return Ok(TierVerdict::Stopped);
    }

    // A resolving response may have landed during the fan-out.
    let current = ctx
        .store
        .get(emergency_id)?
        .ok_or(StoreError::NotFound(emergency_id))?;
    if current.is_terminal() {
        return Ok(TierVerdict::Stopped);
    }
    Ok(TierVerdict::Continue)
}

#[allow(clippy::too_many_arguments)]
async fn execute_action(
    ctx: &Arc<EscalationContext>,
    emergency_id: Uuid,
    emergency: &crate::models::Emergency,
    tier_index: usize,
    action_index: usize,
    action: &EscalationAction,
    vars: &MessageVars,
) -> ActionResult {
    let started_at = Utc::now();
    let recipients = ctx
        .resolver
        .resolve(emergency.patient_id, &action.roles, &action.channels)
        .await;

    if recipients.is_empty() {
        tracing::warn!(
            emergency_id = %emergency_id,
            tier_index,
            action_index,
            "No reachable recipients for action"
        );
    }

    let timeout = Duration::from_secs(action.timeout_seconds);
    let mut attempts: FuturesUnordered<_> = recipients
        .iter()
        .flat_map(|recipient| {
            let message = ctx.composer.compose(
                recipient,
                emergency.trigger_type,
                emergency.severity,
                &action.template,
                vars,
            );
            recipient.channels.iter().map(move |channel| {
                deliver_with_retry(
                    ctx,
                    emergency_id,
                    recipient.clone(),
                    channel.clone(),
                    message.clone(),
                    action,
                    timeout,
                )
            })
        })
        .collect();

    let mut settled = Vec::new();
    while let Some(attempt) = attempts.next().await {
        settled.push(attempt);
    }

    ActionResult {
        tier_index,
        action_index,
        attempts: settled,
        started_at,
        completed_at: Utc::now(),
    }
}

/// Retry policy is applied here, around the dispatcher, so semantics are
/// identical for every channel back-end.
async fn deliver_with_retry(
    ctx: &Arc<EscalationContext>,
    emergency_id: Uuid,
    recipient: Recipient,
    channel: crate::models::ContactChannel,
    message: crate::models::ChannelMessage,
    action: &EscalationAction,
    timeout: Duration,
) -> DeliveryAttempt {
    let max_attempts = action.retry.max_attempts.max(1);
    let mut tries = 0;
    loop {
        tries += 1;
        let outcome = ctx
            .dispatcher
            .send(emergency_id, &recipient, &channel, &message, timeout)
            .await;

        if outcome.is_delivered() || tries >= max_attempts {
            return DeliveryAttempt {
                recipient_id: recipient.id,
                recipient_name: recipient.name.clone(),
                channel: channel.kind,
                status: outcome.status,
                message_id: outcome.message_id,
                error: outcome.error,
                tries,
                completed_at: Utc::now(),
            };
        }

        tokio::time::sleep(action.retry.delay_before(tries)).await;
    }
}

/// Returns true when a stop condition resolved the emergency.
async fn check_stop_conditions(
    ctx: &Arc<EscalationContext>,
    emergency_id: Uuid,
    tier: Option<&EscalationTier>,
) -> Result<bool, StoreError> {
    let Some(tier) = tier else {
        return Ok(false);
    };
    let emergency = ctx
        .store
        .get(emergency_id)?
        .ok_or(StoreError::NotFound(emergency_id))?;
    if emergency.is_terminal() {
        return Ok(true);
    }

    for condition in &tier.stop_conditions {
        if condition.is_met(&emergency.responses) {
            let resolved_by = attribution(condition, &emergency.responses);
            let (terminated, snapshot) = ctx.store.update(emergency_id, |e| {
                e.try_terminate(EmergencyStatus::Resolved, Some(resolved_by.clone()))
            })?;
            if terminated {
                tracing::info!(
                    emergency_id = %emergency_id,
                    stop_condition = condition.name(),
                    "Escalation stopped by condition"
                );
                ctx.repository.save(&snapshot).await?;
                ctx.store.archive(emergency_id)?;
            }
            return Ok(true);
        }
    }
    Ok(false)
}

/// Attribute a stop-condition resolution to the response that satisfied
/// it when one is identifiable; otherwise to the system.
fn attribution(condition: &StopCondition, responses: &[Response]) -> ResolvedBy {
    let matched = responses.iter().find(|r| condition.is_met(std::slice::from_ref(r)));
    match matched {
        Some(response) => {
            let mut by = ResolvedBy::responder(response);
            by.detail = Some(condition.name().to_string());
            by
        }
        None => ResolvedBy::system(condition.name()),
    }
}

/// How an escalation that reaches its ceiling is closed.
#[derive(Clone, Copy)]
enum Expiry {
    /// The plan's overall timeout: close as unresolved `timeout`.
    Timeout,
    /// The rule's auto-resolve window: close as `resolved` with system
    /// attribution.
    AutoResolve,
}

/// Ceiling reached: the current tier's stop conditions get one final
/// check so an explicit response racing the expiry always wins.
async fn close_expired(
    ctx: &Arc<EscalationContext>,
    emergency_id: Uuid,
    tier: Option<&EscalationTier>,
    expiry: Expiry,
) {
    match check_stop_conditions(ctx, emergency_id, tier).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(StoreError::NotFound(_)) => return,
        Err(e) => {
            fault(ctx, emergency_id, &e).await;
            return;
        }
    }

    let (status, resolved_by) = match expiry {
        Expiry::Timeout => (EmergencyStatus::Timeout, None),
        Expiry::AutoResolve => (
            EmergencyStatus::Resolved,
            Some(ResolvedBy::system("auto_resolve")),
        ),
    };
    let result = ctx
        .store
        .update(emergency_id, |e| e.try_terminate(status, resolved_by.clone()));
    match result {
        Ok((true, snapshot)) => {
            match expiry {
                Expiry::Timeout => {
                    tracing::warn!(emergency_id = %emergency_id, "Escalation timed out unresolved")
                }
                Expiry::AutoResolve => {
                    tracing::info!(emergency_id = %emergency_id, "Escalation auto-resolved by rule")
                }
            }
            if let Err(e) = ctx.repository.save(&snapshot).await {
                tracing::error!(emergency_id = %emergency_id, error = %e, "Persist failed");
            }
            if let Err(e) = ctx.store.archive(emergency_id) {
                tracing::error!(emergency_id = %emergency_id, error = %e, "Archive failed");
            }
        }
        Ok((false, _)) | Err(StoreError::NotFound(_)) => {}
        Err(e) => fault(ctx, emergency_id, &e).await,
    }
}

/// Internal fault policy: never drop the emergency silently; park it for
/// operator review.
async fn fault(ctx: &Arc<EscalationContext>, emergency_id: Uuid, error: &StoreError) {
    tracing::error!(
        emergency_id = %emergency_id,
        error = %error,
        "Scheduler fault; parking emergency for manual review"
    );
    if let Ok((true, snapshot)) = ctx.store.update(emergency_id, |e| e.mark_manual_review()) {
        let _ = ctx.repository.save(&snapshot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DetectionConfig, EscalationPlan, RetryPolicy, RuleSet, TriggerCondition,
    };
    use crate::dispatch::{ChannelError, DeliveryChannel};
    use crate::messages::MessageComposer;
    use crate::models::enums::{
        ChannelKind, DeliveryStatus, RecipientRole, Relationship, ResponderRole, ResponseType,
        Severity, TriggerType,
    };
    use crate::models::{ContactChannel, ContactRecord, Emergency, TriggerContext};
    use crate::recipients::InMemoryDirectory;
    use crate::store::InMemoryRepository;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum SmsMode {
        Succeed,
        Fail,
        Hang,
    }

    struct CountingSms {
        mode: SmsMode,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DeliveryChannel for CountingSms {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Sms
        }

        async fn deliver(
            &self,
            _address: &str,
            _message: &crate::models::ChannelMessage,
        ) -> Result<Uuid, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                SmsMode::Succeed => Ok(Uuid::new_v4()),
                SmsMode::Fail => Err(ChannelError("provider down".into())),
                SmsMode::Hang => {
                    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                    Ok(Uuid::new_v4())
                }
            }
        }
    }

    fn make_trigger(tiers: Vec<EscalationTier>, overall_timeout_minutes: i64) -> TriggerCondition {
        TriggerCondition {
            id: "trig-test".into(),
            trigger_type: TriggerType::MissedCriticalMedication,
            severity: Severity::Critical,
            time_threshold_minutes: None,
            consecutive_misses: None,
            criticality: None,
            risk_classes: vec![],
            detection_window_minutes: None,
            max_detection_minutes: None,
            detection: DetectionConfig::default(),
            escalation: EscalationPlan {
                tiers,
                overall_timeout_minutes,
            },
        }
    }

    fn make_tier(
        level: u32,
        delay_minutes: i64,
        retry: RetryPolicy,
        stop_conditions: Vec<StopCondition>,
    ) -> EscalationTier {
        EscalationTier {
            level,
            delay_minutes,
            actions: vec![EscalationAction {
                roles: vec![RecipientRole::Family],
                channels: vec![ChannelKind::Sms],
                template: "default".into(),
                timeout_seconds: 30,
                retry,
            }],
            stop_conditions,
        }
    }

    struct Harness {
        scheduler: EscalationScheduler,
        store: Arc<EmergencyStore>,
        backend: Arc<CountingSms>,
        patient_id: Uuid,
    }

    fn make_harness(mode: SmsMode) -> Harness {
        let patient_id = Uuid::new_v4();
        let directory = InMemoryDirectory::new();
        directory.add_contact(
            patient_id,
            ContactRecord {
                id: Uuid::new_v4(),
                name: "Maria".into(),
                roles: vec![RecipientRole::Family],
                relationship: Relationship::Spouse,
                notify_first: false,
                priority: 1,
                disabled: false,
                channels: vec![ContactChannel {
                    kind: ChannelKind::Sms,
                    address: "sms:maria".into(),
                    enabled: true,
                }],
                locale: "en".into(),
                formal_address: false,
            },
        );

        let backend = Arc::new(CountingSms {
            mode,
            calls: AtomicU32::new(0),
        });
        let store = Arc::new(EmergencyStore::new(10));
        let scheduler = EscalationScheduler::new(EscalationContext {
            store: Arc::clone(&store),
            repository: Arc::new(InMemoryRepository::new()),
            resolver: RecipientResolver::new(Arc::new(directory)),
            composer: MessageComposer::default(),
            dispatcher: Arc::new(DeliveryDispatcher::new(vec![
                Arc::clone(&backend) as Arc<dyn DeliveryChannel>
            ])),
            tier_budget: Duration::from_secs(300),
        });
        Harness {
            scheduler,
            store,
            backend,
            patient_id,
        }
    }

    fn open_emergency(harness: &Harness) -> Uuid {
        let emergency = Emergency::new(
            harness.patient_id,
            "trig-test",
            TriggerType::MissedCriticalMedication,
            Severity::Critical,
            TriggerContext::default(),
        );
        let id = emergency.id;
        harness.store.insert(emergency).unwrap();
        id
    }

    fn make_response(response_type: ResponseType) -> Response {
        Response {
            id: Uuid::new_v4(),
            responder_id: Uuid::new_v4(),
            responder_role: ResponderRole::Family,
            response_type,
            message: None,
            location: None,
            received_at: chrono::Utc::now(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_retries_until_attempts_exhausted() {
        let h = make_harness(SmsMode::Fail);
        let id = open_emergency(&h);
        let retry = RetryPolicy {
            max_attempts: 3,
            delay_seconds: 2,
            backoff_multiplier: 2.0,
        };
        let trigger = make_trigger(vec![make_tier(1, 0, retry, vec![])], 30);
        h.scheduler.schedule(id, Arc::new(trigger), 0, Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 3);
        let emergency = h.store.get(id).unwrap().unwrap();
        let attempt = &emergency.action_results[0].attempts[0];
        assert_eq!(attempt.tries, 3);
        assert_eq!(attempt.status, DeliveryStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn met_stop_condition_resolves_with_responder_attribution() {
        let h = make_harness(SmsMode::Succeed);
        let id = open_emergency(&h);
        let response = make_response(ResponseType::MedicationTaken);
        let responder = response.responder_id;
        h.store.update(id, |e| e.responses.push(response)).unwrap();

        let retry = RetryPolicy::default();
        let trigger = make_trigger(
            vec![make_tier(1, 0, retry, vec![StopCondition::MedicationTaken])],
            30,
        );
        h.scheduler.schedule(id, Arc::new(trigger), 0, Duration::ZERO);
        settle().await;

        // Resolved and archived with attribution to the matching response.
        assert!(h.store.get(id).unwrap().is_none());
        let closed = &h.store.history(10).unwrap()[0];
        assert_eq!(closed.status, EmergencyStatus::Resolved);
        let resolved_by = closed.resolved_by.as_ref().unwrap();
        assert_eq!(resolved_by.responder_id, Some(responder));
        assert_eq!(resolved_by.detail.as_deref(), Some("medication_taken"));
    }

    #[tokio::test(start_paused = true)]
    async fn response_racing_the_ceiling_beats_timeout() {
        let h = make_harness(SmsMode::Succeed);
        let id = open_emergency(&h);
        let trigger = make_trigger(
            vec![make_tier(
                1,
                0,
                RetryPolicy::default(),
                vec![StopCondition::PatientResponded],
            )],
            30,
        );
        h.scheduler.schedule(id, Arc::new(trigger), 0, Duration::ZERO);
        settle().await;

        // A patient response lands while the task is waiting out the
        // ceiling; the final check at the ceiling must honor it.
        let mut response = make_response(ResponseType::NeedHelp);
        response.responder_role = ResponderRole::Patient;
        h.store.update(id, |e| e.responses.push(response)).unwrap();

        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        let closed = &h.store.history(10).unwrap()[0];
        assert_eq!(closed.status, EmergencyStatus::Resolved);
        assert_ne!(closed.status, EmergencyStatus::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_pending_task() {
        let h = make_harness(SmsMode::Succeed);
        let id = open_emergency(&h);
        let trigger = Arc::new(make_trigger(
            vec![make_tier(1, 20, RetryPolicy::default(), vec![])],
            60,
        ));
        h.scheduler.schedule(id, Arc::clone(&trigger), 1, Duration::ZERO);
        h.scheduler.schedule(id, trigger, 1, Duration::ZERO);
        settle().await;
        assert_eq!(h.scheduler.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_safe_for_unknown_ids() {
        let h = make_harness(SmsMode::Succeed);
        h.scheduler.cancel(Uuid::new_v4());
        assert_eq!(h.scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_all_tasks() {
        let h = make_harness(SmsMode::Succeed);
        let trigger = Arc::new(make_trigger(
            vec![make_tier(1, 20, RetryPolicy::default(), vec![])],
            60,
        ));
        for _ in 0..3 {
            let id = open_emergency(&h);
            h.scheduler.schedule(id, Arc::clone(&trigger), 1, Duration::ZERO);
        }
        settle().await;
        assert_eq!(h.scheduler.pending_count(), 3);

        h.scheduler.shutdown().await;
        assert_eq!(h.scheduler.pending_count(), 0);
        // Cancelled mid-delay; nothing was delivered.
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_task_waits_out_its_tier_delay() {
        let h = make_harness(SmsMode::Succeed);
        let id = open_emergency(&h);
        let trigger = make_trigger(
            vec![
                make_tier(1, 0, RetryPolicy::default(), vec![]),
                make_tier(2, 10, RetryPolicy::default(), vec![]),
            ],
            60,
        );
        // Resume at the second tier as after a restart.
        h.scheduler.schedule(id, Arc::new(trigger), 1, Duration::ZERO);
        settle().await;
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(10 * 60 + 5)).await;
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
        let emergency = h.store.get(id).unwrap().unwrap();
        assert_eq!(emergency.current_tier_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_resolve_rule_closes_unresolved_escalation_as_resolved() {
        let h = make_harness(SmsMode::Succeed);
        let id = open_emergency(&h);
        let mut trigger = make_trigger(
            vec![make_tier(1, 0, RetryPolicy::default(), vec![])],
            30,
        );
        trigger.detection.auto_resolve = true;
        trigger.detection.auto_resolve_minutes = Some(10);
        h.scheduler.schedule(id, Arc::new(trigger), 0, Duration::ZERO);
        settle().await;

        tokio::time::sleep(Duration::from_secs(9 * 60)).await;
        assert!(h.store.get(id).unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert!(h.store.get(id).unwrap().is_none());
        let closed = &h.store.history(10).unwrap()[0];
        assert_eq!(closed.status, EmergencyStatus::Resolved);
        let resolved_by = closed.resolved_by.as_ref().unwrap();
        assert_eq!(resolved_by.role, ResponderRole::System);
        assert_eq!(resolved_by.detail.as_deref(), Some("auto_resolve"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tier_fanout_cannot_overrun_the_ceiling() {
        // Transport hangs and the per-attempt timeout exceeds the plan
        // ceiling; the generous tier budget must not delay the timeout.
        let h = make_harness(SmsMode::Hang);
        let id = open_emergency(&h);
        let trigger = make_trigger(
            vec![EscalationTier {
                level: 1,
                delay_minutes: 0,
                actions: vec![EscalationAction {
                    roles: vec![RecipientRole::Family],
                    channels: vec![ChannelKind::Sms],
                    template: "default".into(),
                    timeout_seconds: 3600,
                    retry: RetryPolicy::default(),
                }],
                stop_conditions: vec![],
            }],
            2,
        );
        h.scheduler.schedule(id, Arc::new(trigger), 0, Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(3 * 60)).await;
        assert!(h.store.get(id).unwrap().is_none());
        let closed = &h.store.history(10).unwrap()[0];
        assert_eq!(closed.status, EmergencyStatus::Timeout);
    }

    #[test]
    fn rule_set_round_trips_with_scheduler_shapes() {
        let trigger = make_trigger(
            vec![make_tier(
                1,
                5,
                RetryPolicy::default(),
                vec![StopCondition::PatientResponded],
            )],
            45,
        );
        let rules = RuleSet {
            version: 7,
            triggers: vec![trigger],
        };
        let json = serde_json::to_string(&rules).unwrap();
        let parsed = RuleSet::from_json(&json).unwrap();
        assert_eq!(parsed.version, 7);
        assert_eq!(parsed.triggers[0].escalation.overall_timeout_minutes, 45);
    }
}
