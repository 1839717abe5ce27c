//! HTTP API - proxy namespace and admin endpoints

pub mod admin;
pub mod proxy;
pub mod routes;
