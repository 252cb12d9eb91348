//! Policy model, value classification and admission checks for the gateway
//! control plane.

pub mod classify;
pub mod config;
pub mod error;
pub mod model;
pub mod state;
pub mod validator;

pub use classify::*;
pub use config::*;
pub use error::*;
pub use model::*;
pub use state::*;
pub use validator::*;
