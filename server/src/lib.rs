pub mod accounts;
pub mod auth;
pub mod blob;
pub mod cron;
pub mod deadline;
pub mod errors;
pub mod models;
pub mod password;
pub mod routes;
pub mod saga;
pub mod session;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod tokens;
pub mod videos;
