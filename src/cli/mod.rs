pub mod app;
pub mod services;
