//! Inventory service: reserves stock for new orders and returns or
//! retires it once the order settles.

pub mod handlers;
pub mod models;
pub mod postgres;
pub mod repository;
pub mod schema;
