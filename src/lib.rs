pub mod cache;
pub mod config;
pub mod debounce;
pub mod editor;
pub mod sandbox;
pub mod share;
pub mod terminal;
pub mod types;
pub mod workspace;
