//! Engine core: drivers, point handling, sessions and their supervisor

pub mod bootstrap;
pub mod config;
pub mod drivers;
pub mod evaluator;
pub mod points;
pub mod session;
pub mod sink;
pub mod supervisor;
