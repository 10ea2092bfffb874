//! Domain-scoped policies
//!
//! A *domain* names one decision problem ("model_selection", "tool_planning").
//! [`PolicyRegistry`] holds exactly one policy per domain and
//! [`LearningEngine`] is the single call site for recommend/record plus
//! snapshot persistence.

mod engine;
mod registry;

pub use engine::LearningEngine;
pub use registry::PolicyRegistry;
