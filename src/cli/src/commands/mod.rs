pub mod config;
pub mod health;
pub mod job;
pub mod tasks;
