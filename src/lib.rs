//! Keychain Secrets Controller Library
//!
//! Core functionality for the keychain secrets controller: the `SecretIntent`
//! CRD, the event-driven reconciliation engine, the keychain repositories, and
//! the command-line secret generator. Tests live in the module files
//! (e.g. `controller/reconciler.rs`).

pub mod controller;
pub mod crd;
pub mod generator;
pub mod keychain;
pub mod observability;
pub mod server;
