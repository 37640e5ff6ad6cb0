//! The develop controller: the façade the application (and the headless
//! driver) talks to.
//!
//! A [`Develop`] exists per loaded image. It owns the history state behind
//! one mutex, the three pipelines, the monotonic develop timestamp, and the
//! `gui_leaving` kill switch. Edit intents come in through the controller
//! methods, which update history under lock, translate the stack's verdict
//! into pipeline change flags, emit lifecycle signals, and drive the
//! autosave policy.
//!
//! Lock order, strictly: the environment load lock (process-wide, load and
//! unload only) → the history mutex → a pipeline's run. The only sanctioned
//! inversion is the render run's node-sync closure, which briefly takes the
//! history mutex while its pipeline runs; nothing takes a pipeline's state
//! lock while holding the history mutex, so the pair cannot deadlock.

pub mod develop;
pub mod env;
pub mod signal;

pub use develop::{Develop, EditTarget};
pub use env::{Env, ImageSource};
pub use signal::{DevelopSignal, SignalBus};
