//! Mechanical governance: the card state machine and the tool gate.
//!
//! Both components are pure policy — they decide, they never mutate.
//! The repository runs transition checks inside its write transaction;
//! the turn executor runs gate checks before any tool side effect.

pub mod gate;
pub mod idesign;
pub mod machine;

pub use gate::{GateContext, ToolGate, Violation, ViolationCode, ViolationSeverity};
pub use idesign::ComponentCategory;
pub use machine::{StateMachine, TransitionError};
