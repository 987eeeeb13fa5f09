//! Node lifecycle: the phase machine and the published graph slot.

pub mod phase;
pub mod slot;

pub use phase::NodePhase;
pub use slot::GraphSlot;
