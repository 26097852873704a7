//! Medication adherence emergency engine.
//!
//! Watches nothing itself: an external adherence monitor reports trigger
//! observations, and this crate validates them against a configurable
//! rule set, opens emergency records, and walks each one through a
//! tiered, time-boxed escalation — composing localized messages,
//! fanning deliveries out across push/SMS/voice back-ends with retry,
//! and stopping the moment a responder signal satisfies a stop
//! condition. Unresolved emergencies are forced to a timeout at the
//! plan's overall ceiling.
//!
//! [`engine::EmergencyEngine`] is the entry point; the surrounding
//! application supplies contacts ([`recipients::ContactDirectory`]),
//! durable storage ([`store::EmergencyRepository`]), and real channel
//! transports ([`dispatch::DeliveryChannel`]).

pub mod config;
pub mod detection;
pub mod dispatch;
pub mod engine;
pub mod messages;
pub mod models;
pub mod recipients;
pub mod scheduler;
pub mod store;

pub use config::{EngineConfig, RuleSet, TriggerCondition};
pub use engine::{DetectionOutcome, EmergencyEngine, EngineError};
pub use models::{Emergency, Response, TriggerContext};
