pub mod app;
pub mod result;
pub mod server;
pub mod version;
