//! Audit hooks.
//!
//! The image manager reports upload start and completion, pending requests
//! and confirmations to an [`AuditLog`].  Where and how these are stored is
//! up to the implementation.  A failing hook is logged and otherwise ignored;
//! it never fails the operation being reported.

use core::fmt::Debug;

use crate::{Error, Hash256};

/// Outcome of the operation being reported.
pub type Status = core::result::Result<(), Error>;

pub trait AuditLog {
    type Error: Debug;

    fn upload_start(&mut self, status: Status) -> Result<(), Self::Error> {
        let _ = status;
        Ok(())
    }

    fn upload_done(&mut self, status: Status, digest: Option<&Hash256>) -> Result<(), Self::Error> {
        let _ = (status, digest);
        Ok(())
    }

    fn pending(&mut self, status: Status, digest: Option<&Hash256>) -> Result<(), Self::Error> {
        let _ = (status, digest);
        Ok(())
    }

    fn confirm(&mut self, status: Status, digest: Option<&Hash256>) -> Result<(), Self::Error> {
        let _ = (status, digest);
        Ok(())
    }
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NoAudit;

impl AuditLog for NoAudit {
    type Error = core::convert::Infallible;
}

/// Log a hook that failed.
pub(crate) fn note<E: Debug>(hook: &str, result: Result<(), E>) {
    if let Err(e) = result {
        log::warn!("audit: {} hook failed: {:?}", hook, e);
    }
}
