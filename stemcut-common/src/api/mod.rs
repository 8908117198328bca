//! API helpers shared by HTTP handlers

pub mod auth;
