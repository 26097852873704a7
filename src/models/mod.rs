pub mod emergency;
pub mod enums;
pub mod recipient;

pub use emergency::{
    ActionResult, DeliveryAttempt, Emergency, GeoPoint, ResolvedBy, Response, TriggerContext,
};
pub use enums::{
    ActionStatus, ChannelKind, CriticalityClass, DeliveryStatus, EmergencyStatus, EnumParseError,
    RecipientRole, Relationship, ResponderRole, ResponseType, RiskClass, Severity, TriggerType,
};
pub use recipient::{ChannelMessage, ContactChannel, ContactRecord, Recipient};
