#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tessera-guard** – Guard evaluation for the Tessera workflow engine.
//!
//! Every inbound edge of the workflow graph is gated by a guard; every
//! outbound routing decision is driven by a policy expression. This crate
//! implements:
//!
//! - the guard dispatch table ([`evaluate_guard`]): pass-through, criteria
//!   gates, TTL checks, composite chains, directional filters, Cerberus and
//!   conditional injectors;
//! - the safe expression [`dsl`]: a purpose-built lexer, parser and
//!   interpreter with no host-language evaluator, no function calls and no
//!   escape hatch;
//! - conditional-injector mutation planning ([`plan_injection`]), where the
//!   **last** matching rule wins;
//! - routing-policy resolution ([`RoutePolicy`]) with `on_error`/`default`
//!   fallthrough;
//! - the [`ModelRouter`] whitelist with safe failover.
//!
//! Guards are pure: they read the UOW and its attribute map and return
//! decisions. Persisting the consequences is the engine's job.

use thiserror::Error;

pub mod dsl;
pub mod evaluate;
pub mod injector;
pub mod policy;
pub mod router;

pub use dsl::DslError;
pub use evaluate::{evaluate_guard, evaluation_scope};
pub use injector::{plan_injection, InjectionPlan, InjectorOutcome};
pub use policy::{validate_policy, RouteDecision, RoutePolicy};
pub use router::{ModelResolution, ModelRouter};

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors produced while evaluating guards.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A composite step named a guard type outside the dispatch table.
    #[error("unknown guard type: {0}")]
    UnknownGuardType(String),

    /// A guard configuration does not have the shape its type requires.
    #[error("invalid guard config: {0}")]
    InvalidConfig(String),

    /// A policy expression failed to parse or evaluate.
    #[error(transparent)]
    Dsl(#[from] DslError),
}

/// Crate-wide result alias.
pub type GuardResult<T> = Result<T, GuardError>;
