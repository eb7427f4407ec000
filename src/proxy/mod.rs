//! The local forward proxy: absolute-URI requests go to a [`Fetcher`],
//! CONNECT requests to a [`Connector`].
//!
//! [`Fetcher`]: crate::fetch::Fetcher
//! [`Connector`]: crate::connect::Connector

pub mod server;

pub use server::LocalProxy;
