pub mod behavior;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod flow;
pub mod logger;
pub mod message;
pub mod orchestrator;
pub mod schema;
pub mod tutor;
pub mod util;
