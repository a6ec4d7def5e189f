//! Payment service: debits user balances for payment requests and reports
//! the outcome.

pub mod handlers;
pub mod models;
pub mod postgres;
pub mod repository;
pub mod schema;
