//! Configuration types for connections, transfers and output

use std::time::Duration;

use crate::control::{DEFAULT_MAX_ERRORS_BEFORE_CANCEL, UNLIMITED_ERRORS};

/// Default port of an iRODS server
pub const DEFAULT_PORT: u16 = 1247;

/// Connection settings for the control connection to the grid
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Time allowed for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Size of the buffered reader/writer wrapped around the socket (bytes)
    pub io_buffer_size: usize,
    /// Ask the server to keep reconnection information for this session
    pub reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            io_buffer_size: 64 * 1024,
            reconnect: false,
        }
    }
}

impl ConnectionConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be greater than zero".to_string());
        }
        if self.io_buffer_size == 0 {
            return Err("io_buffer_size must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Settings for put/get/replicate operations
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Files of at least this size are moved over parallel streams (bytes)
    pub parallel_threshold: u64,
    /// Upper bound of parallel streams requested from the server (0 = never go parallel)
    pub max_parallel_threads: usize,
    /// Buffer used by each parallel stream (bytes)
    pub io_buffer_size: usize,
    /// Default error threshold for control blocks created by the transfer (-1 = unlimited)
    pub max_errors_before_cancel: i32,
    /// How often a paused transfer checks whether it was resumed
    pub pause_poll_interval: Duration,
    /// Overwrite existing data objects on put
    pub force_overwrite: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: 32 * 1024 * 1024,
            max_parallel_threads: 4,
            io_buffer_size: 64 * 1024,
            max_errors_before_cancel: DEFAULT_MAX_ERRORS_BEFORE_CANCEL,
            pause_poll_interval: Duration::from_millis(250),
            force_overwrite: false,
        }
    }
}

impl TransferConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.io_buffer_size == 0 {
            return Err("io_buffer_size must be greater than zero".to_string());
        }
        if self.max_errors_before_cancel < UNLIMITED_ERRORS {
            return Err(format!(
                "max_errors_before_cancel must be -1 or greater, got {}",
                self.max_errors_before_cancel
            ));
        }
        if self.pause_poll_interval.is_zero() {
            return Err("pause_poll_interval must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Number of parallel streams to request for a file of `size` bytes (0 = in-band transfer).
    pub fn threads_for(&self, size: u64) -> usize {
        if size < self.parallel_threshold {
            0
        } else {
            self.max_parallel_threads
        }
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.quiet && self.verbose > 0 {
            return Err("quiet and verbose cannot be used together".to_string());
        }
        Ok(())
    }
}
