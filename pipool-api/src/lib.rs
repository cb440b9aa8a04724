#![deny(unsafe_code)]

//! This crate defines types and interfaces shared by the PiPool
//! daemon and any crate that needs to talk to pool hardware. The
//! actual control logic lives in `pipoold`; this crate only carries
//! the hardware abstraction seam and the common error type so that
//! real and simulated backends are interchangeable.

pub mod hal;
pub mod types;

pub use types::Error;

/// Shorthand used across the daemon for fallible operations; the
/// failure side is always [`types::Error`].

pub type Result<T> = std::result::Result<T, types::Error>;
