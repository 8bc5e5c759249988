pub mod broker;
pub mod fingerprint;
