pub mod app;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod http;
pub mod index;
pub mod loadtest;
pub mod metrics;
pub mod migration;
pub mod monitor;
pub mod sql;

pub use app::AppContext;
pub use error::PerfError;
