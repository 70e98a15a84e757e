#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

#[cfg(any(test, feature = "std"))]
extern crate std;

extern crate alloc;

pub mod error;
pub mod h2;

pub use error::{Error, H2Error};
pub use h2::{ConnectionConfig, H2Connection, Role, Side, StreamId};
