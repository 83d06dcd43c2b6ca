//! rootcast library exports.
//!
//! The binary's command handlers are thin wrappers around these modules;
//! integration tests in `tests/` drive them directly.

pub mod build;
pub mod config;
pub mod device;
pub mod image;
pub mod pack;
pub mod process;
pub mod sbom;
pub mod scratch;
pub mod timing;
pub mod update;
