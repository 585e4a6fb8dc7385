#![forbid(unsafe_code)]

pub mod app;
pub mod commands;
pub mod store;
pub mod supervisor;
