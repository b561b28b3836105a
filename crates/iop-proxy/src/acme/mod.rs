//! ACME certificate management (RFC 8555, HTTP-01 only).

mod challenge;
mod controller;
mod queue;
mod storage;

pub use challenge::ChallengeMap;
pub use controller::AcmeController;
pub use storage::{host_dir, remove_certificate};
