//! Ambient utilities shared across handlers.
//!
//! The teacher's argon2 password hashing lived here; this gateway has no
//! password-authenticated principals, so only the request-logging hoop
//! survives (see [`logger`]).

pub mod logger;
