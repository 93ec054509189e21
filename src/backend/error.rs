// Backend errors and the single check helper
//
// Every fallible Vulkan call goes through `Check::check`, which records the
// call name, the raw result code and the caller's source location. Callers
// either propagate the `Result` or hand it to `or_exit` for fail-fast
// behavior (the binary does the latter).

use ash::{prelude::VkResult, vk};
use std::panic::Location;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error(
        "Vulkan error at {}:{}: {} ({call}: {code})",
        .location.file(),
        .location.line(),
        .code.as_raw()
    )]
    Backend {
        call: &'static str,
        code: vk::Result,
        location: &'static Location<'static>,
    },

    #[error("Physical device {name:?} has no compute-capable queue family")]
    NoComputeQueue { name: String },

    #[error("No host-visible, host-coherent memory type can hold {size} bytes")]
    NoHostVisibleMemory { size: vk::DeviceSize },

    #[error("Buffers must have a non-zero size")]
    ZeroSize,

    #[error("Failed to read shader binary {path:?}: {source}")]
    ShaderRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Buffer is already mapped")]
    AlreadyMapped,

    #[error("At least one buffer must be bound")]
    EmptyBinding,

    #[error("Program has no bound buffers")]
    NotBound,

    #[error("Access of {requested} bytes exceeds buffer size {size}")]
    OutOfBounds {
        requested: vk::DeviceSize,
        size: vk::DeviceSize,
    },

    #[error("Buffer at binding {binding} belongs to a different device")]
    ForeignBuffer { binding: usize },

    #[error("{0} has been released")]
    Released(&'static str),

    #[error("No usable Vulkan device found")]
    NoDevice,
}

impl Error {
    /// Raw Vulkan result code, if this error came from a backend call
    pub fn code(&self) -> Option<vk::Result> {
        match self {
            Error::Backend { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Converts a raw Vulkan result into a backend `Result`
pub trait Check<T> {
    fn check(self, call: &'static str) -> Result<T>;
}

impl<T> Check<T> for VkResult<T> {
    #[track_caller]
    fn check(self, call: &'static str) -> Result<T> {
        let location = Location::caller();
        self.map_err(|code| Error::Backend { call, code, location })
    }
}

/// Print a diagnostic for `err` on stderr
pub fn report(err: &Error) {
    match err {
        Error::Backend { call, code, location } => {
            eprintln!(
                "Vulkan error at {}:{}: {} ({})",
                location.file(),
                location.line(),
                code.as_raw(),
                call
            );
        }
        other => eprintln!("error: {}", other),
    }
}

/// Unwrap `result`, or report the error and terminate the process.
pub fn or_exit<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            log::error!("{}", err);
            report(&err);
            std::process::exit(1);
        }
    }
}
