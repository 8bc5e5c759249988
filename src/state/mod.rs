pub mod app;
pub mod channels;

pub use app::AppState;
