//! OTP relay: hands a one-time passcode read from SMS on a phone to a
//! browser extension waiting for it, pairing the two by a coarse
//! location fingerprint instead of a session.

pub mod app;
pub mod config;
pub mod errors;
pub mod extract;
pub mod routes;
pub mod services;
pub mod state;
