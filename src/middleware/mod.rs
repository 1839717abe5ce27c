//! HTTP middleware layers

pub mod correlation;
