//! Device profiles for multi-vendor support.
//!
//! A [`DeviceProfile`] bundles the vendor-specific parts of a device
//! session: prompt patterns, failure markers, the nested diagnostic shell
//! and the queries that map interface names to hardware ports.

mod definition;
pub mod vendors;

pub use definition::{AsicQuery, DeviceProfile, PortQuery, SubCli};
