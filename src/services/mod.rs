//! Demo services carried over the call core.
//!
//! Each service comes with its message types, a [`Service`](crate::server::Service)
//! implementation, and a typed client stub wrapping [`Client`](crate::Client).
pub mod calculator;
pub mod greet;

pub use calculator::{CalculatorClient, CalculatorService};
pub use greet::{GreetClient, GreetService};
