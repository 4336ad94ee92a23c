pub mod auth;
pub mod boundary;
pub mod chart;
pub mod clock;
pub mod config;
pub mod db;
pub mod delta;
pub mod error;
pub mod gmail;
pub mod intake;
pub mod merge;
pub mod models;
pub mod provider;
pub mod reconcile;
pub mod scheduler;
pub mod snapshot;
pub mod sync;

#[cfg(test)]
mod testing;
