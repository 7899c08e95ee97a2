// tests/integration_test.rs

//! End-to-end scenarios exercising the controller subsystems together.

mod integration;
