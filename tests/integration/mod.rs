//! Integration test suite for sift.
//!
//! These tests drive whole plans through the scheduler against a scripted
//! analysis service, using file-backed stores in temporary directories so
//! that "crash and restart" means dropping every handle and reopening the
//! state directory.
//!
//! # Test Categories
//!
//! - `resume`: Crash recovery and idempotent re-runs
//! - `cancellation`: Upstream failure, quality termination, budget
//! - `ensemble`: Divergence, debate, arbitration and calculation end to end
//! - `integrity`: Chronolog tampering detection
//!
//! # CI Compatibility
//!
//! No external service is contacted; every response is scripted.

mod fixtures;

mod cancellation;
mod ensemble;
mod integrity;
mod resume;
