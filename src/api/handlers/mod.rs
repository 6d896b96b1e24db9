//! Route handlers for the gateway.

pub mod checks;
pub mod configuration;
pub mod first_factor;
pub mod health;
pub mod second_factor;
pub mod session;
pub mod user_state;
pub mod verify;
