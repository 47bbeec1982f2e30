//! Status and classification vocabularies.
//!
//! Every vocabulary is a proper sum type; the string form exists only for the
//! storage boundary and the wire, via `as_str` and `FromStr`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a storage-boundary string does not belong to a vocabulary.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {vocabulary} value: {value}")]
pub struct EnumParseError {
    /// Which vocabulary rejected the value.
    pub vocabulary: &'static str,
    /// The offending string.
    pub value: String,
}

macro_rules! storage_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Storage-boundary string form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EnumParseError {
                        vocabulary: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

storage_enum! {
    /// Functional classification of roles within the workflow graph.
    RoleKind {
        /// The origin - instantiates the base UOW.
        Alpha => "ALPHA",
        /// The processor - transforms and may decompose UOWs.
        Beta => "BETA",
        /// The terminal - reconciles and finalizes the UOW set.
        Omega => "OMEGA",
        /// The error handler - remediation target of the Ate Path.
        Epsilon => "EPSILON",
        /// The timeout handler - receives reclaimed zombie tokens.
        Tau => "TAU",
    }
}

storage_enum! {
    /// How a Beta role decomposes work into child UOWs.
    DecompositionStrategy {
        /// All child UOWs must be of the same type.
        Homogeneous => "HOMOGENEOUS",
        /// Diverse UOW types allowed within a single set.
        Heterogeneous => "HETEROGENEOUS",
    }
}

storage_enum! {
    /// Direction of token flow relative to a role.
    ComponentDirection {
        /// Flow into the role.
        Inbound => "INBOUND",
        /// Flow out of the role.
        Outbound => "OUTBOUND",
    }
}

storage_enum! {
    /// Logic class of a guard gate.
    GuardKind {
        /// Identity-only validation, always admits.
        PassThru => "PASS_THRU",
        /// Data-driven threshold enforcement.
        CriteriaGate => "CRITERIA_GATE",
        /// Age check against a reference timestamp attribute.
        TtlCheck => "TTL_CHECK",
        /// AND/OR chain of synthesized child guards.
        Composite => "COMPOSITE",
        /// Routing marker, never blocks admission.
        DirectionalFilter => "DIRECTIONAL_FILTER",
        /// Parent/child set synchronization at the terminal role.
        Cerberus => "CERBERUS",
        /// Ordered mutation rules applied at admission.
        ConditionalInjector => "CONDITIONAL_INJECTOR",
    }
}

storage_enum! {
    /// Current state of a unit of work.
    ///
    /// This is the single extended vocabulary used everywhere: the lifecycle
    /// core (`PENDING → ACTIVE → COMPLETED | FAILED`) plus the pilot and
    /// ambiguity-lock states.
    UowStatus {
        /// Waiting at an interaction for checkout.
        Pending => "PENDING",
        /// Checked out and locked by an actor.
        Active => "ACTIVE",
        /// Finished successfully.
        Completed => "COMPLETED",
        /// Finished unsuccessfully; usually routed to the Epsilon queue.
        Failed => "FAILED",
        /// Halted by the pilot kill switch.
        Paused => "PAUSED",
        /// Soft-stalled at the interaction budget, awaiting clarification.
        ZombiedSoft => "ZOMBIED_SOFT",
        /// Blocked on a high-risk transition awaiting pilot decision.
        PendingPilotApproval => "PENDING_PILOT_APPROVAL",
    }
}

storage_enum! {
    /// Deployment health of a runtime instance.
    InstanceStatus {
        /// Accepting work.
        Active => "ACTIVE",
        /// Halted by the pilot.
        Paused => "PAUSED",
        /// Retired; retained for audit.
        Archived => "ARCHIVED",
    }
}

storage_enum! {
    /// Kind of actor operating within an instance.
    ActorKind {
        /// A person.
        Human => "HUMAN",
        /// An automated agent.
        AiAgent => "AI_AGENT",
        /// The engine itself.
        System => "SYSTEM",
    }
}

storage_enum! {
    /// Lifecycle of an actor-role assignment.
    AssignmentStatus {
        /// The actor may check out work for the role.
        Active => "ACTIVE",
        /// Authorization withdrawn.
        Revoked => "REVOKED",
    }
}

storage_enum! {
    /// Scope of a role-memory record.
    MemoryScope {
        /// Shared blueprint knowledge, visible to every actor in the role.
        Global => "GLOBAL",
        /// Personal playbook, visible only to one actor.
        Actor => "ACTOR",
    }
}

storage_enum! {
    /// Category of an interaction-log row.
    LogKind {
        /// Token movement.
        Interaction => "INTERACTION",
        /// General telemetry.
        Telemetry => "TELEMETRY",
        /// Shadow-captured evaluation error.
        Error => "ERROR",
        /// Guard admission or routing decision.
        GuardianDecision => "GUARDIAN_DECISION",
        /// Status change record.
        StateTransition => "STATE_TRANSITION",
    }
}

storage_enum! {
    /// Severity of a violation packet.
    Severity {
        /// Must be acted on.
        Critical => "CRITICAL",
        /// Should be reviewed.
        Warning => "WARNING",
        /// Informational.
        Info => "INFO",
    }
}

/// Kind of an append-only UOW history event.
///
/// The well-known kinds get variants; adapters may record additional event
/// types, which round-trip through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryEventType {
    /// UOW row inserted.
    UowCreated,
    /// Status and/or interaction changed.
    StateTransition,
    /// Pilot override of a rule with mandatory justification.
    ConstitutionalWaiver,
    /// Any other pilot action.
    PilotOverride,
    /// Adapter-defined event type.
    Other(String),
}

impl HistoryEventType {
    /// Storage-boundary string form.
    pub fn as_str(&self) -> &str {
        match self {
            Self::UowCreated => "UOW_CREATED",
            Self::StateTransition => "STATE_TRANSITION",
            Self::ConstitutionalWaiver => "CONSTITUTIONAL_WAIVER",
            Self::PilotOverride => "PILOT_OVERRIDE",
            Self::Other(s) => s,
        }
    }

    /// Parse the storage form; never fails, unknown kinds become `Other`.
    pub fn parse(s: &str) -> Self {
        match s {
            "UOW_CREATED" => Self::UowCreated,
            "STATE_TRANSITION" => Self::StateTransition,
            "CONSTITUTIONAL_WAIVER" => Self::ConstitutionalWaiver,
            "PILOT_OVERRIDE" => Self::PilotOverride,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for HistoryEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
