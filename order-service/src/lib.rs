//! Order service: owns the order aggregate and reacts to inventory and
//! payment outcomes to move each order through the fulfillment saga.

pub mod api;
pub mod handlers;
pub mod models;
pub mod postgres;
pub mod repository;
pub mod schema;
