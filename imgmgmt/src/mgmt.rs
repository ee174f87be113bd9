//! The image manager.

use log::{debug, info, trace, warn};
use storage::Flash;

use crate::audit::{self, AuditLog, NoAudit, Status};
use crate::slot::{check_slot, Slot, SlotFlags, SlotLayout, SwapType, PRIMARY, SECONDARY};
use crate::trailer::{self, TrailerFlag};
use crate::upload::{self, Session, Tail, UploadAction, UploadProgress, UploadRequest, UploadStatus};
use crate::verify::{Sha256Verifier, Verifier};
use crate::{Error, Hash256, Recovery, Result};

/// A chunk that has been approved by inspection and not yet reported.
struct InFlight {
    offset: usize,
    len: usize,
    last: bool,
    digest: Option<Hash256>,
    action: UploadAction,
    /// Something may have been written to the image area.
    written: bool,
    /// The new alignment tail, once the write has been done.
    tail: Option<Tail>,
}

/// Owner of both slots and the upload in progress.
///
/// Every operation that changes anything takes `&mut self`, so there is only
/// ever one writer.  Slot state is read back from flash on each query.
pub struct ImgMgmt<F, V = Sha256Verifier, A = NoAudit> {
    slots: [F; 2],
    layouts: [SlotLayout; 2],
    verifier: V,
    audit: A,
    session: Option<Session>,
    in_flight: Option<InFlight>,
    /// Size of the last upload to finish, until another one starts.
    completed: Option<usize>,
}

impl InFlight {
    fn is_for(&self, req: &UploadRequest<'_>) -> bool {
        self.offset == req.offset
            && self.len == req.data.len()
            && self.last == req.last
            && self.digest == req.digest
    }
}

impl<F: Flash> ImgMgmt<F> {
    /// Manage the given slots with software hashing and no audit log.
    pub fn new(primary: F, secondary: F) -> Result<Self> {
        ImgMgmt::with_parts(primary, secondary, Sha256Verifier, NoAudit)
    }
}

impl<F: Flash, V: Verifier, A: AuditLog> ImgMgmt<F, V, A> {
    pub fn with_parts(primary: F, secondary: F, verifier: V, audit: A) -> Result<Self> {
        let layouts = [
            SlotLayout::from_flash(&primary)?,
            SlotLayout::from_flash(&secondary)?,
        ];
        debug!(
            "imgmgmt: image capacity {} / {} bytes",
            layouts[PRIMARY].image_capacity(),
            layouts[SECONDARY].image_capacity()
        );
        Ok(ImgMgmt {
            slots: [primary, secondary],
            layouts,
            verifier,
            audit,
            session: None,
            in_flight: None,
            completed: None,
        })
    }

    /// Give back the flash devices.  Any upload in progress is dropped.
    pub fn into_parts(self) -> (F, F, V, A) {
        let [primary, secondary] = self.slots;
        (primary, secondary, self.verifier, self.audit)
    }

    pub fn flash(&self, index: usize) -> Result<&F> {
        check_slot(index)?;
        Ok(&self.slots[index])
    }

    /// Direct access to a slot's flash.  Changes made through this are not
    /// seen by an upload in progress.
    pub fn flash_mut(&mut self, index: usize) -> Result<&mut F> {
        check_slot(index)?;
        Ok(&mut self.slots[index])
    }

    pub fn audit(&self) -> &A {
        &self.audit
    }

    pub fn layout(&self, index: usize) -> Result<&SlotLayout> {
        check_slot(index)?;
        Ok(&self.layouts[index])
    }

    pub fn slot(&mut self, index: usize) -> Result<Slot> {
        check_slot(index)?;
        let trailer = trailer::read(&mut self.slots[index], &self.layouts[index])?;
        Ok(Slot::from_trailer(index, &trailer))
    }

    pub fn slot_status(&mut self, index: usize) -> Result<SlotFlags> {
        Ok(self.slot(index)?.flags)
    }

    /// What the bootloader will do on the next boot.
    pub fn swap_type(&mut self) -> Result<SwapType> {
        let primary = self.slot_status(PRIMARY)?;
        let secondary = self.slot_status(SECONDARY)?;
        Ok(SwapType::from_flags(primary, secondary))
    }

    /// Read image data from a slot.
    pub fn read(&mut self, index: usize, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_slot(index)?;
        let fits = offset
            .checked_add(buf.len())
            .map_or(false, |end| end <= self.layouts[index].image_capacity());
        if !fits {
            return Err(Error::Flash(storage::Error::OutOfBounds));
        }
        self.slots[index].read(offset, buf)?;
        Ok(())
    }

    fn busy(&self) -> bool {
        self.session.is_some() || self.in_flight.is_some()
    }

    /// Erase all of slot 1, trailer included.
    pub fn erase_slot(&mut self) -> Result<()> {
        if self.busy() {
            return Err(Error::SlotBusy);
        }
        let layout = self.layouts[SECONDARY];
        let flash = &mut self.slots[SECONDARY];
        let mut pos = 0;
        while pos < layout.capacity {
            flash.erase(pos, pos + layout.erase_size)?;
            pos += layout.erase_size;
        }
        self.completed = None;
        info!("imgmgmt: slot 1 erased");
        Ok(())
    }

    /// Ask the bootloader to swap in the image in slot 1.
    pub fn mark_pending(&mut self, permanent: bool) -> Result<()> {
        self.mark_pending_slot(SECONDARY, permanent)
    }

    pub fn mark_pending_slot(&mut self, index: usize, permanent: bool) -> Result<()> {
        let result = self.write_pending(index, permanent);
        let status = result.map(|_| ());
        let digest = result.ok();
        audit::note("pending", self.audit.pending(status, digest.as_ref()));
        status
    }

    fn write_pending(&mut self, index: usize, permanent: bool) -> Result<Hash256> {
        check_slot(index)?;
        if index == PRIMARY {
            return Err(Error::InvalidState);
        }
        if self.busy() {
            return Err(Error::SlotBusy);
        }

        let layout = self.layouts[index];
        let flash = &mut self.slots[index];
        let state = trailer::read(flash, &layout)?;
        let (_, digest) = state.record.ok_or(Error::ImageNotPresent)?;
        if state.bad {
            return Err(Error::InvalidState);
        }

        // Permanent goes first so that an interrupted request is at worst a
        // test swap.
        if permanent && !state.permanent {
            trailer::set_flag(flash, &layout, TrailerFlag::Permanent)?;
        }
        if !state.pending {
            trailer::set_flag(flash, &layout, TrailerFlag::Pending)?;
        }
        info!("imgmgmt: slot {} pending (permanent: {})", index, permanent || state.permanent);
        Ok(digest)
    }

    /// Accept the running image, so it won't be reverted.
    pub fn mark_confirmed(&mut self) -> Result<()> {
        let result = self.write_confirmed();
        let status = result.map(|_| ());
        let digest = result.ok().flatten();
        audit::note("confirm", self.audit.confirm(status, digest.as_ref()));
        status
    }

    fn write_confirmed(&mut self) -> Result<Option<Hash256>> {
        let layout = self.layouts[PRIMARY];
        let flash = &mut self.slots[PRIMARY];
        let state = trailer::read(flash, &layout)?;
        match state.record {
            // Nothing was swapped in, the image is confirmed already.
            None => Ok(None),
            Some((_, digest)) => {
                if !state.confirmed {
                    trailer::set_flag(flash, &layout, TrailerFlag::Confirmed)?;
                    info!("imgmgmt: running image confirmed");
                }
                Ok(Some(digest))
            }
        }
    }

    /// Where the upload in progress stands, if there is one.
    pub fn upload_state(&self) -> Option<UploadProgress> {
        self.session.as_ref().map(Session::progress)
    }

    /// Decide what to do with a chunk.  Nothing is written.  An accepted chunk
    /// becomes the chunk in flight until it is reported; until then only the
    /// same chunk may be inspected again.
    pub fn inspect_upload(&mut self, req: &UploadRequest<'_>) -> (UploadAction, Option<&'static str>) {
        if let Some(flight) = &self.in_flight {
            if flight.is_for(req) {
                return (flight.action.clone(), None);
            }
            let mut action = flight.action.clone();
            action.erase = false;
            action.write = false;
            action.proceed = false;
            action.error = Some(Error::SlotBusy);
            return (action, Some("another chunk is in flight"));
        }

        let (action, msg) = if req.offset == 0 {
            self.inspect_start(req)
        } else {
            let (action, msg) = upload::inspect(self.session.as_ref(), &self.layouts[SECONDARY], req);
            let msg = self.explain(req, &action, msg);
            (action, msg)
        };

        if req.offset == 0 {
            let status = action.error.map_or(Ok(()), Err);
            audit::note("upload start", self.audit.upload_start(status));
        }

        match action.error {
            Some(err) => {
                debug!("imgmgmt: chunk at {} rejected: {}", req.offset, msg.unwrap_or(""));
                self.in_flight = None;
                if err.recovery() == Recovery::Restart {
                    self.abandon(err);
                }
            }
            None if action.write => {
                trace!(
                    "imgmgmt: chunk at {}: erase {:?}, write {} bytes at {}",
                    req.offset,
                    action.erase_range,
                    action.data_range.len(),
                    action.write_offset
                );
                self.in_flight = Some(InFlight {
                    offset: req.offset,
                    len: req.data.len(),
                    last: req.last,
                    digest: req.digest,
                    action: action.clone(),
                    written: false,
                    tail: None,
                });
            }
            None => trace!("imgmgmt: duplicate chunk at {}", req.offset),
        }
        (action, msg)
    }

    /// A chunk of the upload that just finished is still refused, as there is
    /// no session left to take it, but the peer is told why.
    fn explain(
        &self,
        req: &UploadRequest<'_>,
        action: &UploadAction,
        msg: Option<&'static str>,
    ) -> Option<&'static str> {
        if action.error != Some(Error::OffsetMismatch) || self.session.is_some() {
            return msg;
        }
        let end = req.offset.saturating_add(req.data.len());
        match self.completed {
            Some(size) if end <= size => Some("upload already complete"),
            _ => msg,
        }
    }

    /// A new upload may not replace an image that is waiting to be swapped in.
    fn inspect_start(&mut self, req: &UploadRequest<'_>) -> (UploadAction, Option<&'static str>) {
        let (mut action, msg) = upload::inspect(None, &self.layouts[SECONDARY], req);
        if action.error.is_some() {
            return (action, msg);
        }
        let refusal = match self.slot_status(SECONDARY) {
            Ok(flags) if flags.contains(SlotFlags::PENDING) => {
                (Error::InvalidState, "slot 1 is pending")
            }
            Ok(_) => return (action, msg),
            Err(err) => (err, "unable to read slot 1 state"),
        };
        action.erase = false;
        action.write = false;
        action.proceed = false;
        action.error = Some(refusal.0);
        (action, Some(refusal.1))
    }

    /// Perform the erase and write for the chunk in flight.  `data` is the
    /// chunk's data, as inspected.
    pub fn apply_chunk(&mut self, data: &[u8]) -> Result<()> {
        let flight = self.in_flight.as_mut().ok_or(Error::InvalidState)?;
        if flight.len != data.len() || flight.tail.is_some() {
            return Err(Error::InvalidState);
        }
        let action = &flight.action;
        let layout = &self.layouts[SECONDARY];
        let flash = &mut self.slots[SECONDARY];

        if action.start {
            clear_record(flash, layout)?;
        }

        if action.erase {
            debug!("imgmgmt: erase {:#x}..{:#x}", action.erase_range.start, action.erase_range.end);
            flash.erase(action.erase_range.start, action.erase_range.end)?;
        }

        let empty = Tail::new();
        let tail = match &self.session {
            Some(session) if !action.start => &session.tail,
            _ => &empty,
        };
        flight.written = true;
        let tail = upload::write_aligned(
            flash,
            action.write_offset,
            tail,
            &data[action.data_range.clone()],
            action.complete,
        )?;
        flight.tail = Some(tail);
        Ok(())
    }

    /// Report how the erase and write of the chunk in flight went.  Success
    /// moves the upload forward, and finishes it on the last chunk.  Failure
    /// abandons the upload.
    ///
    /// The erase and write may have been done by [`Self::apply_chunk`] or by
    /// the caller.  A caller doing its own writes must write whole units, so
    /// every chunk but the last has to end on a write boundary.
    pub fn report_chunk_result(&mut self, success: bool) -> Result<UploadStatus> {
        if !success {
            self.in_flight = None;
            let err = Error::Flash(storage::Error::Failed);
            self.abandon(err);
            return Err(err);
        }

        let flight = match self.in_flight.take() {
            Some(flight) => flight,
            // Duplicates have nothing in flight.
            None => return self.status(),
        };
        let action = flight.action;
        let tail = match flight.tail {
            Some(tail) => tail,
            // Erased and written by the caller.
            None => match self.caller_wrote(&action) {
                Ok(()) => Tail::new(),
                Err(err) => {
                    self.abandon(err);
                    return Err(err);
                }
            },
        };
        let mut session = match self.session.take() {
            Some(session) if !action.start => session,
            _ => {
                self.completed = None;
                info!("imgmgmt: upload started, size {:?}", action.total_size);
                Session::new(action.total_size, action.digest)
            }
        };
        session.advance(&action, tail);

        if action.complete {
            self.finish(session)
        } else {
            let offset = session.received();
            self.session = Some(session);
            Ok(UploadStatus::InProgress { offset })
        }
    }

    /// Handle one chunk: inspect it, erase and write as needed, and move the
    /// upload forward.  A failed erase leaves the upload where it was, so the
    /// chunk can be sent again.  A failed write abandons the upload.
    pub fn upload(&mut self, req: &UploadRequest<'_>) -> Result<UploadStatus> {
        let (action, _) = self.inspect_upload(req);
        if let Some(err) = action.error {
            return Err(err);
        }
        if !action.write {
            return self.status();
        }

        match self.apply_chunk(req.data) {
            Ok(()) => self.report_chunk_result(true),
            Err(err) => {
                let written = self.in_flight.as_ref().map_or(false, |f| f.written);
                if written {
                    warn!("imgmgmt: write failed, abandoning upload: {}", err);
                    self.in_flight = None;
                    self.abandon(err);
                } else {
                    warn!("imgmgmt: erase failed at {}: {}", req.offset, err);
                    self.in_flight = None;
                }
                Err(err)
            }
        }
    }

    /// Drop the upload in progress.  Whatever was written stays in slot 1,
    /// but without a record it will never be marked pending.
    pub fn abort_upload(&mut self) {
        self.in_flight = None;
        if self.session.take().is_some() {
            info!("imgmgmt: upload aborted");
        }
    }

    /// A chunk the caller erased and wrote itself can only be taken if it
    /// leaves nothing buffered: it must end on a write boundary, or finish the
    /// image, and follow a chunk that also did.
    fn caller_wrote(&mut self, action: &UploadAction) -> Result<()> {
        let buffered = match &self.session {
            Some(session) if !action.start => !session.tail.is_empty(),
            _ => false,
        };
        let aligned = action.end() % self.layouts[SECONDARY].write_size == 0;
        if buffered || !(aligned || action.complete) {
            warn!("imgmgmt: chunk ending at {} was not written whole", action.end());
            return Err(Error::InvalidState);
        }
        if action.start {
            clear_record(&mut self.slots[SECONDARY], &self.layouts[SECONDARY])?;
        }
        Ok(())
    }

    fn status(&self) -> Result<UploadStatus> {
        match &self.session {
            Some(session) => Ok(UploadStatus::InProgress { offset: session.received() }),
            None => Err(Error::InvalidState),
        }
    }

    /// Give up on the upload in progress after an error.
    fn abandon(&mut self, err: Error) {
        if self.session.take().is_some() {
            warn!("imgmgmt: upload abandoned: {}", err);
            audit::note("upload done", self.audit.upload_done(Err(err), None));
        }
    }

    /// The whole image has been written: check it, and record it in slot 1.
    fn finish(&mut self, session: Session) -> Result<UploadStatus> {
        let size = session.received();
        let result = self.verify_and_record(&session);
        let status: Status = result.map(|_| ());
        audit::note(
            "upload done",
            self.audit.upload_done(status, result.as_ref().ok().or(session.declared_digest())),
        );
        let digest = result?;
        self.completed = Some(size);
        info!("imgmgmt: upload complete, {} bytes", size);
        Ok(UploadStatus::Complete { size, digest })
    }

    fn verify_and_record(&mut self, session: &Session) -> Result<Hash256> {
        let size = session.received();
        let flash = &mut self.slots[SECONDARY];
        let digest = self.verifier.digest(flash, size)?;
        if let Some(expected) = session.declared_digest() {
            if *expected != digest {
                warn!("imgmgmt: uploaded image does not match its digest");
                return Err(Error::VerificationFailed);
            }
        }
        trailer::write_record(flash, &self.layouts[SECONDARY], size, &digest)?;
        Ok(digest)
    }
}

/// The recorded image in slot 1 is about to be overwritten.
fn clear_record<F: Flash>(flash: &mut F, layout: &SlotLayout) -> Result<()> {
    if trailer::read(flash, layout)?.record.is_some() {
        debug!("imgmgmt: clearing slot 1 trailer");
        trailer::erase(flash, layout)?;
    }
    Ok(())
}
