#![deny(clippy::all)]

pub mod anonymizer;
pub mod config;
pub mod controller;
pub mod error;
pub mod export;
pub mod hierarchy;
pub mod ingest;
pub mod model;
pub mod qr;
pub mod storage;

pub use controller::AnonymizerController;
pub use error::{Error, Result};
