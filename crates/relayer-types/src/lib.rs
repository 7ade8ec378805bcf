//! Shared types for the settlement relayer.
//!
//! Every crate in the workspace speaks in terms of these types: decoded
//! order events, the relayer-local order state machine, transaction
//! receipts, operator events and configuration schemas.

pub mod delivery;
pub mod events;
pub mod order;
pub mod validation;

pub use alloy::primitives::Address;
pub use delivery::*;
pub use events::*;
pub use order::*;
pub use validation::*;
