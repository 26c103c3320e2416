// ABOUTME: Library root for machine-ssh - remote command execution and file transfer over SSH.
// ABOUTME: The CLI binary is in main.rs.

pub mod config;
pub mod error;
pub mod ssh;
