#![forbid(unsafe_code)]

//! HTTP front end for the cardscan recognition dispatcher.

pub mod config;
pub mod demo;
pub mod error;
pub mod http;
pub mod preprocess;
pub mod service;
