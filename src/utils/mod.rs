pub mod atomic_write;
pub mod crypto;
pub mod file_log;
pub mod sanitize;
pub mod sos;
