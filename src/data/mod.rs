//! Preallocated inter-task queues.
//!
//! All steady-state communication between the daemon's tasks flows through
//! the fixed-capacity queue in [`spsc`]: log events (capacity 4096), fault
//! escalations (64), and inbound serial lines (256). Nothing here allocates
//! after construction.

pub mod spsc;

pub use spsc::{channel, Consumer, OverflowPolicy, Producer};
