pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod db;
pub mod engine;
pub mod executor;
pub mod model;
pub mod pause;
pub mod remote;
pub mod report;
pub mod scheduler;
pub mod whitelist;
