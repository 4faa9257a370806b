//! `sim`: Toy silicon barrel, particle gun and replay logs for the track finder.
//!
//! # Module layout
//! - [`detector`]  : Cylindrical barrel of flat pixel and strip modules
//! - [`gun`]       : Particles, clusters, noise and seeds of one event
//! - [`scenarios`] : Named, seeded scenario definitions
//! - [`evaluation`]: Truth matching of found tracks
//! - [`replay`]    : JSON logs of generated events

pub mod detector;
pub mod evaluation;
pub mod gun;
pub mod replay;
pub mod scenarios;

pub use detector::{LayerSpec, ModuleCrossing, ToyDetector};
pub use evaluation::TruthMetrics;
pub use gun::{Event, GunSpec, ParticleGun, TruthParticle};
pub use replay::{load_replay, save_replay, ReplayLog};
pub use scenarios::{Scenario, ScenarioKind};
