//! Image management for A/B firmware slots.
//!
//! Slot 0 holds the running image, slot 1 is where a new image is staged.
//! This crate receives a new image into slot 1 a chunk at a time, keeps the
//! persistent per-slot flags the bootloader reads at the next boot, and
//! reports what that boot will do.
//!
//! All of the state is owned by [`ImgMgmt`].  Upload chunks go through
//! [`ImgMgmt::inspect_upload`], which only decides, then
//! [`ImgMgmt::apply_chunk`] and [`ImgMgmt::report_chunk_result`], or all
//! three at once through [`ImgMgmt::upload`].

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use core::fmt;

mod audit;
mod mgmt;
mod slot;
pub mod trailer;
mod upload;
mod verify;

pub use audit::{AuditLog, NoAudit, Status};
pub use mgmt::ImgMgmt;
pub use slot::{Slot, SlotFlags, SlotLayout, SwapType, PRIMARY, SECONDARY, SLOT_COUNT};
pub use upload::{inspect, Session, UploadAction, UploadProgress, UploadRequest, UploadStatus};
pub use verify::{Sha256Verifier, Verifier};

pub type Result<T> = core::result::Result<T, Error>;

/// The result of a SHA256 hash, appropriate for stack allocation.
pub type Hash256 = [u8; 32];

// Use the error kind to avoid this depending on the particular flash.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// Slot index other than 0 or 1.
    InvalidSlot,
    /// An upload is in progress, or another chunk is in flight.
    SlotBusy,
    /// The slot has no recorded image.
    ImageNotPresent,
    /// The image, or this chunk of it, does not fit.
    ImageTooLarge,
    /// Chunk offset does not continue the upload.
    OffsetMismatch,
    Flash(storage::Error),
    /// The request is not valid given the current flags or upload.
    InvalidState,
    /// Digest mismatch, or an upload that ended early.
    VerificationFailed,
}

/// What an uploader should do after a chunk is rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Recovery {
    /// Send the same chunk again.
    Retry,
    /// The upload is gone; start again from offset 0.
    Restart,
    /// The request itself was wrong, resending it will not help.
    None,
}

impl Error {
    pub fn recovery(&self) -> Recovery {
        match self {
            Error::Flash(_) | Error::SlotBusy => Recovery::Retry,
            Error::OffsetMismatch | Error::ImageTooLarge | Error::VerificationFailed => {
                Recovery::Restart
            }
            Error::InvalidSlot | Error::ImageNotPresent | Error::InvalidState => Recovery::None,
        }
    }
}

/// Convert the flash error into our error type.
impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        Error::Flash(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidSlot => f.write_str("invalid slot"),
            Error::SlotBusy => f.write_str("slot busy"),
            Error::ImageNotPresent => f.write_str("no image in slot"),
            Error::ImageTooLarge => f.write_str("image too large"),
            Error::OffsetMismatch => f.write_str("offset mismatch"),
            Error::Flash(e) => write!(f, "flash: {}", e),
            Error::InvalidState => f.write_str("invalid state"),
            Error::VerificationFailed => f.write_str("verification failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
