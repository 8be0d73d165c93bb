//! Adaptive Streaming
//!
//! Pro Stream ein Byte-begrenzter Puffer mit FIFO-Verdrängung, adaptive
//! Puffergröße und eine diskrete Quality-Stufe, die pro Zyklus höchstens
//! einen Schritt wechselt.

mod buffer;
mod controller;
mod level;
mod stream;

pub use buffer::{Admission, StreamBuffer};
pub use controller::{AdaptiveController, StreamingError};
pub use level::{buffer_health, decide_step, NetworkHealth, QualityLevel, StepDecision};
pub use stream::{StreamEvent, StreamState, StreamStats, TickOutput};
