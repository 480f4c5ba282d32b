#![forbid(unsafe_code)]

//! Shared library for the songfetch HTTP API.
//!
//! The heavy lifting (format negotiation, transcoding, metadata extraction)
//! belongs to yt-dlp; these modules only resolve identifiers, build argument
//! vectors, parse line-oriented JSON output, and manage the flat download
//! directory that the server binary exposes over HTTP.

pub mod config;
pub mod resolver;
pub mod security;
pub mod store;
pub mod ytdlp;
