//! Shelver - watches a download folder and files finished movies and TV
//! bundles into a Plex-style library.

pub mod app;
pub mod config;
pub mod error;
pub mod services;
