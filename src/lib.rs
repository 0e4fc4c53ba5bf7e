//! Frametrace library - present correlation over graphics-stack trace events.
//!
//! The engine ingests typed events from the graphics kernel, the
//! presentation runtimes, the compositor, and the windowing subsystem, and
//! reconstructs one record per application present: who issued it, which
//! presentation path fulfilled it, when it was submitted, GPU-ready, and on
//! screen, and whether it was displayed or discarded.
//!
//! # Modules
//!
//! - [`consumer`] - The correlation engine and its consumer-facing queues
//! - [`store`] - Bounded storage and the multi-key record indexes
//! - [`events`] / [`providers`] - The typed event surface
//! - [`replay`] - Event-stream replay and the CSV/summary reports
//!
//! # Example
//!
//! ```no_run
//! use frametrace::{Config, PresentConsumer};
//! use frametrace::replay::replay_file;
//! use std::path::Path;
//!
//! let mut consumer = PresentConsumer::new(Config::default());
//! let result = replay_file(Path::new("./events.jsonl"), &mut consumer)
//!     .expect("replay failed");
//! for present in &result.completed {
//!     println!("{} {:?}", present.pid, present.present_mode);
//! }
//! ```

pub mod consumer;
pub mod dwm;
pub mod dxgkrnl;
pub mod events;
pub mod present;
pub mod providers;
pub mod replay;
pub mod runtime;
pub mod store;
pub mod win32k;

pub use consumer::{Config, CounterSnapshot, EngineCounters, EngineOutput, PresentConsumer};
pub use events::{Event, EventHeader, Payload};
pub use present::{PresentMode, PresentRecord, PresentResult, ProcessEvent, Runtime};
pub use store::{Handle, RecordStore, RING_CAPACITY_DEFAULT};
