//! Constrained routing over a bandit policy
//!
//! The router sits between callers and a [`BanditPolicy`](crate::bandit::BanditPolicy):
//!
//! - **Constraints**: allowed-arm sets and cost ceilings filter candidates
//!   before the policy sees them.
//!
//! - **Kill switch**: with `routing.bandit_enabled = false` the first
//!   candidate is returned without consulting the policy.
//!
//! - **Fallbacks**: empty filters and policy errors degrade to a deterministic
//!   arm instead of failing the caller.
//!
//! - **Rewards**: raw success, quality, cost and latency signals are folded
//!   into a single reward in [0, 1] before the policy learns from them.
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_core::routing::{Constraints, OutcomeSignals, Router};
//!
//! let router = Router::new("model_selection", policy);
//! let decision = router.select(&arms, None, &Constraints::new().with_max_cost(0.05))?;
//!
//! // ... call decision.arm ...
//!
//! router.update(
//!     &decision.arm,
//!     &OutcomeSignals::success().with_cost(0.002).with_latency(850.0),
//!     None,
//! )?;
//! ```

mod router;
mod types;

pub use router::Router;
pub use types::{Constraints, OutcomeSignals, RewardWeights, RoutingDecision, RoutingReason};
