//! Address and provider identifiers shared by every triport crate.

pub mod address;
pub mod provider;

pub use address::{Address, AddressError, RAW_ADDR_LEN};
pub use provider::Provider;
