pub mod api;
pub mod assignment;
pub mod config;
pub mod config_resolution;
pub mod counters;
pub mod database;
pub mod experiment_definitions;
pub mod experiment_matching;
pub mod flow_definitions;
pub mod redis;
pub mod router;
pub mod server;
pub mod storage;
pub mod test_overrides;
pub mod v0_endpoint;
pub mod v0_request;
pub mod variant_selection;
pub mod winner_definitions;

// Test modules don't need to be compiled with main binary
// #[cfg(test)]
// TODO: To use in integration tests, we need to compile with binary
// or make it a separate feature using cfg(feature = "integration-tests")
// and then use this feature only in tests.
// For now, ok to just include in binary
pub mod test_utils;
