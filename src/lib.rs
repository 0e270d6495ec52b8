pub mod auth;
pub mod client;
pub mod collector;
pub mod config;
pub mod database;
pub mod device;
pub mod events;
pub mod platform;
pub mod queue;
pub mod service;
pub mod tracker;
pub mod url;
pub mod util;
