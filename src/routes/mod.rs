pub mod otp_routes;
pub mod system_routes;
