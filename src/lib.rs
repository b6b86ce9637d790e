//! Reconciliation Engine - bank record and ledger posting matching with
//! tolerance-based variance classification.

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;
