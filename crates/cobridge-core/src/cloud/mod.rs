// ── Cloud connection manager ──
//
// Drives one device's registration lifecycle over a single transport
// connection: sign-up, token refresh, sign-in, and resource publication,
// retried by a background runner on a timer or on explicit trigger.

mod manager;
mod routing;
mod runner;
mod steps;
mod trigger;

pub use manager::{CloudManager, SaveCallback};
pub use steps::Step;
