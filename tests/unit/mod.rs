//! Unit tests for individual components

mod audit_test;
mod builders_test;
mod config_test;
mod error_test;
mod protocol_test;
mod runtime_test;
mod util_test;
