pub mod config;
pub mod context;
pub mod core;
pub mod endpoints;
pub mod error;
pub mod frame;
pub mod logging;
pub mod rpc;
pub mod web;
