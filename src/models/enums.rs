use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a string value does not map to a known enum variant.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid value '{value}' for {field}")]
pub struct EnumParseError {
    pub field: String,
    pub value: String,
}

/// Macro to generate enum with as_str + Display + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(EnumParseError {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(TriggerType {
    MissedCriticalMedication => "missed_critical_medication",
    OverdueDose => "overdue_dose",
    ProlongedInactivity => "prolonged_inactivity",
    HealthIncident => "health_incident",
    Manual => "manual",
});

str_enum!(ResponseType {
    MedicationTaken => "medication_taken",
    PatientSafe => "patient_safe",
    NeedHelp => "need_help",
    FalseAlarm => "false_alarm",
    EscalateFurther => "escalate_further",
});

impl ResponseType {
    /// Whether this response type resolves an emergency on its own.
    pub fn is_resolving(&self) -> bool {
        matches!(self, Self::MedicationTaken | Self::PatientSafe)
    }
}

str_enum!(ResponderRole {
    Patient => "patient",
    Family => "family",
    Caregiver => "caregiver",
    EmergencyContact => "emergency_contact",
    System => "system",
});

str_enum!(RecipientRole {
    Patient => "patient",
    Family => "family",
    PrimaryCaregiver => "primary_caregiver",
    Caregiver => "caregiver",
    EmergencyContact => "emergency_contact",
});

str_enum!(ChannelKind {
    Push => "push",
    Sms => "sms",
    Voice => "voice",
});

str_enum!(DeliveryStatus {
    Delivered => "delivered",
    Failed => "failed",
    Timeout => "timeout",
});

str_enum!(ActionStatus {
    Delivered => "delivered",
    Partial => "partial",
    Failed => "failed",
});

str_enum!(CriticalityClass {
    Routine => "routine",
    Important => "important",
    Critical => "critical",
});

str_enum!(RiskClass {
    Standard => "standard",
    Elevated => "elevated",
    High => "high",
});

str_enum!(Relationship {
    Spouse => "spouse",
    Parent => "parent",
    Child => "child",
    Sibling => "sibling",
    Friend => "friend",
    Neighbor => "neighbor",
    Professional => "professional",
});

impl Relationship {
    /// Seniority weight used by the recipient resolver: heavier contacts
    /// are reached earlier within the same notify-first class.
    pub fn seniority_weight(&self) -> u8 {
        match self {
            Self::Spouse => 6,
            Self::Parent => 5,
            Self::Child => 4,
            Self::Sibling => 3,
            Self::Professional => 2,
            Self::Friend => 1,
            Self::Neighbor => 0,
        }
    }
}

/// Severity determines escalation urgency and message tone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emergency lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyStatus {
    /// Trigger validated, escalation not yet started.
    Detected,
    /// Tier execution in progress; re-entered at each tier boundary.
    Escalating,
    /// A non-resolving response arrived while escalation continues.
    Responded,
    /// Terminal: resolved by an authoritative response or stop condition.
    Resolved,
    /// Terminal: cancelled by an operator.
    Cancelled,
    /// Terminal: the overall escalation ceiling elapsed unresolved.
    Timeout,
    /// Parked after an internal scheduler fault; requires operator review.
    ManualReview,
}

impl EmergencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Escalating => "escalating",
            Self::Responded => "responded",
            Self::Resolved => "resolved",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::ManualReview => "manual_review",
        }
    }

    /// Terminal statuses are set at most once and end escalation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Cancelled | Self::Timeout)
    }
}

impl std::fmt::Display for EmergencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
