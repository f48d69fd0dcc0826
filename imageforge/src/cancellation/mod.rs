//! Cooperative cancellation of a build.

mod token;

pub use token::CancellationToken;
