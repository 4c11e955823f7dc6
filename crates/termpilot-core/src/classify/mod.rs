//! Output classification: debounced pattern matching over PTY output.
//!
//! Two classifiers share the same feed/quiet-period shape. The state
//! classifier maps output onto coarse semantic states through prioritized
//! pattern groups; the readiness classifier maintains a single boolean
//! ("is the CLI at its prompt") per agent flavor.

mod debounce;
mod patterns;
mod ready;
mod state;

pub use debounce::Debouncer;
pub use patterns::{default_state_groups, ReadinessProfile, PatternGroup};
pub use ready::{ReadinessClassifier, ReadyTransition};
pub use state::{Detection, StateClassifier};

/// Quiet period before a pending detection is committed.
pub const DEBOUNCE_MS: u64 = 100;
