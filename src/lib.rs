pub mod agreement;
pub mod collector;
pub mod config;
pub mod error;
pub mod identity;
pub mod node;
pub mod notary;
pub mod orchestrator;
pub mod responder;
pub mod store;
pub mod telemetry;
pub mod transition;
pub mod transport;
pub mod utils;
pub mod validator;
