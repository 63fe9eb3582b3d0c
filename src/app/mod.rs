pub mod adb;
pub mod apple;
pub mod catalog;
pub mod config;
pub mod error;
pub mod logging;
pub mod menu;
pub mod models;
pub mod notify;
pub mod registry;
pub mod serialize;
