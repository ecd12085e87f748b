pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod protocol;
pub mod proxy;
pub mod reload;
pub mod routing;
pub mod sdk;
pub mod state;
pub mod transport;
pub mod web;
