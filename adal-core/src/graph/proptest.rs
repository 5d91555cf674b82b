//! Property-based tests for parameter and graph invariants.
