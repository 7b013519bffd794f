pub mod admin;
pub mod ws;
