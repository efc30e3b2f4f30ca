//! prewarm - keep warm, preloaded worker processes ready for short-lived
//! program invocations.
//!
//! `prewarm serve` starts a [`pool`] and a shell registered with it;
//! `prewarm run` inside that shell claims a warm worker, ships it the
//! invocation's arguments, working directory and environment, and exits the
//! way the job exited.

pub mod engine;
pub mod error;
pub mod logging;
pub mod paths;
pub mod pool;
pub mod proctree;
pub mod server;
