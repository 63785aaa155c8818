pub mod cli;
pub mod config;
pub mod context;
pub mod livechat;
pub mod logging;
