pub mod authority;

pub use authority::{CertAuthority, CertError, CertRecord};
