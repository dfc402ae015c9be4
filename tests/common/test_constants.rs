//! Shared constants for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing shared constants under `tests/common/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/test_constants.rs"]
//! mod test_constants;
//! ```

/// Node source display name used across integration tests.
pub const NODE_SOURCE_NAME: &str = "Node source Name";

/// Deployment label derived from [`NODE_SOURCE_NAME`].
pub const NODE_SOURCE_LABEL: &str = "node_source_name";
