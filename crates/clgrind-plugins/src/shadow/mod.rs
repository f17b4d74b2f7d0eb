//! Shadow state
//!
//! Metadata that mirrors the simulator's real state one-for-one:
//! - [`ShadowMemory`]: one metadata cell per byte of every tracked buffer
//! - [`ShadowValue`]: one poison byte per byte of an SSA value
//! - [`propagate`]: the per-opcode rules that compute a result's shadow from
//!   its operands' shadows
//!
//! ```text
//!   TypedValue ──(interpreter)──► TypedValue
//!       │                             │
//!   ShadowValue ──(propagate)───► ShadowValue
//!       │ store                       ▲ load
//!       ▼                             │
//!   ShadowMemory ◄──── same address ──┘
//! ```

mod dispatch;
mod memory;
mod value;

pub use dispatch::{propagate, ShadowOperands};
pub use memory::{Location, ShadowMemory, CHUNK_SIZE};
pub use value::{ShadowValue, DEFINED, POISONED};
