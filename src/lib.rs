//! coopfuzz, a cooperative coverage-guided fuzzing orchestrator.
//!
//! coopfuzz does not mutate inputs itself. It runs alongside sibling fuzzers
//! that publish their finds into a shared sync directory, replays every new
//! contribution against an instrumented target through a persistent fork
//! server, scores the observed edge coverage, and keeps everything - ranked
//! by how much new coverage it brought, or by how rare its edges are.

pub mod bitmap;
pub mod calibrate;
pub mod config;
pub mod coverage;
pub mod executor;
pub mod fuzzer;
pub mod persist;
pub mod queue;
pub mod signals;
pub mod stats;
pub mod sync;
pub mod target;
pub mod triage;
pub mod trim;

mod bolts;
