//! Venafi Trust Protection Platform (TPP) as an SSH certificate authority.
//!
//! [`TppAuthority`] maps [`sshcert_core::SigningRequest`] onto the TPP
//! `SSHCertificates/Request` call and interprets `SSHCertificates/Retrieve`
//! replies as pending, issued, or failed.

pub mod api;
pub mod authority;
pub mod error;

pub use api::{TppClient, TppConfig};
pub use authority::TppAuthority;
pub use error::TppError;
