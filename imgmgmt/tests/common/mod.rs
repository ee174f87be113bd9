// Shared test support.

#![allow(dead_code)]

use imgmgmt::{AuditLog, Hash256, ImgMgmt, Sha256Verifier, Status};
use simflash::SimFlash;

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small sectors, so a few hundred bytes cover several.
pub fn tiny() -> (SimFlash, SimFlash) {
    (
        simflash::styles::TINY_MAIN.build().unwrap(),
        simflash::styles::TINY_UPGRADE.build().unwrap(),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start(Status),
    Done(Status, Option<Hash256>),
    Pending(Status, Option<Hash256>),
    Confirm(Status, Option<Hash256>),
}

/// Keeps every audit event.  With `fail` set, each hook records its event
/// and then reports an error.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Event>,
    pub fail: bool,
}

impl Recorder {
    fn push(&mut self, event: Event) -> Result<(), &'static str> {
        self.events.push(event);
        if self.fail {
            Err("audit log full")
        } else {
            Ok(())
        }
    }
}

impl AuditLog for Recorder {
    type Error = &'static str;

    fn upload_start(&mut self, status: Status) -> Result<(), Self::Error> {
        self.push(Event::Start(status))
    }

    fn upload_done(&mut self, status: Status, digest: Option<&Hash256>) -> Result<(), Self::Error> {
        self.push(Event::Done(status, digest.copied()))
    }

    fn pending(&mut self, status: Status, digest: Option<&Hash256>) -> Result<(), Self::Error> {
        self.push(Event::Pending(status, digest.copied()))
    }

    fn confirm(&mut self, status: Status, digest: Option<&Hash256>) -> Result<(), Self::Error> {
        self.push(Event::Confirm(status, digest.copied()))
    }
}

pub type Mgmt<'a> = ImgMgmt<&'a mut SimFlash, Sha256Verifier, Recorder>;

pub fn mgmt<'a>(main: &'a mut SimFlash, upgrade: &'a mut SimFlash) -> Mgmt<'a> {
    ImgMgmt::with_parts(main, upgrade, Sha256Verifier, Recorder::default()).unwrap()
}
