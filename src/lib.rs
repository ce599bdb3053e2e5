#![forbid(unsafe_code)]

//! Building blocks of the yt-dlp HTTP API: rendition selection, the in-memory
//! job registry, the background dispatcher and the yt-dlp process driver.

pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod provider;
pub mod registry;
pub mod rendition;
pub mod security;
pub mod ytdlp;
