#![forbid(unsafe_code)]

//! Scheduled relay that mirrors new uploads from a creator's channel to a
//! storage or video-hosting destination.
//!
//! One run discovers unprocessed items, resolves a display title, downloads
//! the media with bounded retries, uploads it and records the item in a
//! durable ledger so later runs never repeat the work.

pub mod config;
pub mod cookies;
pub mod discovery;
pub mod fetch;
pub mod http;
pub mod ledger;
pub mod model;
pub mod pacing;
pub mod runner;
pub mod translate;
pub mod upload;
pub mod ytdlp;
