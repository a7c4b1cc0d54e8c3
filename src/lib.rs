// ABOUTME: Library crate for the terminal bridge exposing the session, transport and codec APIs

pub mod config;
pub mod models;
pub mod terminal;
