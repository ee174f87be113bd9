//! Upload admission.
//!
//! An upload arrives as a sequence of chunks, each tagged with its offset in
//! the image.  [`inspect`] decides what to do with one chunk: reject it,
//! ignore it as a duplicate, or erase and write.  It never touches flash or
//! the session, so inspecting the same chunk again gives the same answer.
//! The session only moves forward once the erase and write have been done
//! and reported.
//!
//! Erase is tracked with a cursor.  Sectors below `erased_up_to` have been
//! erased during this session and hold only this session's data, so they are
//! never erased again; each chunk asks for the sectors between the cursor and
//! the end of its data.

use core::ops::Range;

use storage::Flash;

use crate::slot::{SlotLayout, MAX_WRITE};
use crate::{Error, Hash256, Result};

/// Bytes received but not yet written, because they don't fill a write unit.
pub(crate) type Tail = heapless::Vec<u8, MAX_WRITE>;

/// One chunk of an upload, already decoded by the transport.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub offset: usize,
    pub data: &'a [u8],
    /// Size of the whole image, usually only given with the first chunk.
    pub total_size: Option<usize>,
    /// Expected SHA-256 of the whole image, given with the first or last chunk.
    pub digest: Option<Hash256>,
    /// The uploader considers this the final chunk.
    pub last: bool,
}

impl<'a> UploadRequest<'a> {
    pub fn new(offset: usize, data: &'a [u8]) -> Self {
        UploadRequest {
            offset,
            data,
            total_size: None,
            digest: None,
            last: false,
        }
    }

    pub fn total_size(mut self, total_size: usize) -> Self {
        self.total_size = Some(total_size);
        self
    }

    pub fn digest(mut self, digest: Hash256) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }
}

/// What to do with a chunk.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UploadAction {
    /// Sectors must be erased before the write.
    pub erase: bool,
    /// Data must be written.
    pub write: bool,
    /// The chunk is accepted.  Without `write`, it is a duplicate.
    pub proceed: bool,
    pub error: Option<Error>,
    /// Sectors to erase.  Empty unless `erase`.
    pub erase_range: Range<usize>,
    /// Where the written data starts in the slot.
    pub write_offset: usize,
    /// The part of the chunk's data to write, skipping anything that was
    /// already received.
    pub data_range: Range<usize>,
    /// The chunk starts a new upload.
    pub start: bool,
    /// The chunk finishes the image.
    pub complete: bool,
    /// Image size known once this chunk is accepted.
    pub total_size: Option<usize>,
    /// Expected digest once this chunk is accepted.
    pub digest: Option<Hash256>,
}

impl UploadAction {
    fn reject(error: Error) -> Self {
        UploadAction {
            erase: false,
            write: false,
            proceed: false,
            error: Some(error),
            erase_range: 0..0,
            write_offset: 0,
            data_range: 0..0,
            start: false,
            complete: false,
            total_size: None,
            digest: None,
        }
    }

    /// The end of the data in the slot, once written.
    pub fn end(&self) -> usize {
        self.write_offset + self.data_range.len()
    }
}

/// The upload in progress.
#[derive(Debug, Clone)]
pub struct Session {
    pub(crate) total_size: Option<usize>,
    pub(crate) received: usize,
    pub(crate) erased_up_to: usize,
    pub(crate) digest: Option<Hash256>,
    pub(crate) tail: Tail,
}

impl Session {
    pub fn new(total_size: Option<usize>, digest: Option<Hash256>) -> Session {
        Session {
            total_size,
            received: 0,
            erased_up_to: 0,
            digest,
            tail: Tail::new(),
        }
    }

    /// Bytes received so far, which is also the next expected offset.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Everything below this has been erased during this upload.
    pub fn erased_up_to(&self) -> usize {
        self.erased_up_to
    }

    pub fn total_size(&self) -> Option<usize> {
        self.total_size
    }

    pub fn declared_digest(&self) -> Option<&Hash256> {
        self.digest.as_ref()
    }

    /// Move the session past a chunk that has been erased and written.
    pub(crate) fn advance(&mut self, action: &UploadAction, tail: Tail) {
        debug_assert!(action.end() >= self.received);
        self.received = action.end();
        if action.erase {
            self.erased_up_to = self.erased_up_to.max(action.erase_range.end);
        }
        self.total_size = action.total_size;
        self.digest = action.digest;
        self.tail = tail;
    }

    pub fn progress(&self) -> UploadProgress {
        UploadProgress {
            offset: self.received,
            total_size: self.total_size,
        }
    }
}

/// Where an upload stands.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UploadProgress {
    /// Next expected offset.
    pub offset: usize,
    pub total_size: Option<usize>,
}

/// Result of handling a chunk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UploadStatus {
    /// More data is expected, starting at `offset`.
    InProgress { offset: usize },
    /// The image is complete, verified and recorded in slot 1.
    Complete { size: usize, digest: Hash256 },
}

/// Decide what to do with a chunk, given the session in progress, if any.
pub fn inspect(
    session: Option<&Session>,
    layout: &SlotLayout,
    req: &UploadRequest<'_>,
) -> (UploadAction, Option<&'static str>) {
    let len = req.data.len();
    if len == 0 {
        return (UploadAction::reject(Error::InvalidState), Some("empty chunk"));
    }

    let capacity = layout.image_capacity();
    let end = match req.offset.checked_add(len) {
        Some(end) if end <= capacity => end,
        _ => {
            return (
                UploadAction::reject(Error::ImageTooLarge),
                Some("chunk exceeds slot capacity"),
            )
        }
    };

    // Offset 0 always begins again, discarding any upload in progress.
    let (start, received, erased, total, digest) = if req.offset == 0 {
        if let Some(total) = req.total_size {
            if total > capacity {
                return (
                    UploadAction::reject(Error::ImageTooLarge),
                    Some("image larger than slot"),
                );
            }
        }
        (true, 0, 0, req.total_size, req.digest)
    } else {
        let session = match session {
            Some(session) => session,
            None => {
                return (
                    UploadAction::reject(Error::OffsetMismatch),
                    Some("no upload in progress"),
                )
            }
        };

        if end <= session.received {
            return (duplicate(session), None);
        }
        if req.offset > session.received {
            return (
                UploadAction::reject(Error::OffsetMismatch),
                Some("chunk out of sequence"),
            );
        }
        (
            false,
            session.received,
            session.erased_up_to,
            session.total_size,
            req.digest.or(session.digest),
        )
    };

    if let Some(total) = total {
        if end > total {
            return (
                UploadAction::reject(Error::ImageTooLarge),
                Some("chunk exceeds declared image size"),
            );
        }
    }

    let complete = match total {
        Some(total) => end == total,
        None => req.last,
    };
    if req.last && !complete {
        return (
            UploadAction::reject(Error::VerificationFailed),
            Some("last chunk short of declared image size"),
        );
    }

    let erase_to = layout.sector_end(end);
    let erase = erase_to > erased;

    let action = UploadAction {
        erase,
        write: true,
        proceed: true,
        error: None,
        erase_range: if erase { erased..erase_to } else { erased..erased },
        write_offset: received,
        data_range: (received - req.offset)..len,
        start,
        complete,
        total_size: if complete { Some(end) } else { total },
        digest,
    };
    (action, None)
}

/// A chunk that was already received in full.
fn duplicate(session: &Session) -> UploadAction {
    UploadAction {
        erase: false,
        write: false,
        proceed: true,
        error: None,
        erase_range: session.erased_up_to..session.erased_up_to,
        write_offset: session.received,
        data_range: 0..0,
        start: false,
        complete: false,
        total_size: session.total_size,
        digest: session.digest,
    }
}

/// Write `data` so that it continues the stream at `offset`, where `tail`
/// holds the bytes before `offset` that have not been written yet.  Only whole
/// write units are written; what is left over is returned as the new tail,
/// unless `flush` is set, in which case it is padded out and written too.
pub(crate) fn write_aligned<F: Flash>(
    flash: &mut F,
    offset: usize,
    tail: &Tail,
    data: &[u8],
    flush: bool,
) -> Result<Tail> {
    let write_size = flash.write_size();
    let mut pos = offset - tail.len();
    debug_assert_eq!(pos % write_size, 0);

    let mut tail = tail.clone();
    let mut rest = data;

    // Complete partial unit
    if !tail.is_empty() {
        let take = (write_size - tail.len()).min(rest.len());
        tail.extend_from_slice(&rest[..take])
            .map_err(|_| Error::InvalidState)?;
        rest = &rest[take..];
        if tail.len() == write_size {
            flash.write(pos, &tail)?;
            pos += write_size;
            tail.clear();
        }
    }

    // Write aligned bulk
    let aligned = storage::align_down(rest.len(), write_size);
    if aligned > 0 {
        flash.write(pos, &rest[..aligned])?;
        pos += aligned;
    }

    // Keep trailing bytes
    tail.extend_from_slice(&rest[aligned..])
        .map_err(|_| Error::InvalidState)?;

    if flush && !tail.is_empty() {
        tail.resize(write_size, 0xff).map_err(|_| Error::InvalidState)?;
        flash.write(pos, &tail)?;
        tail.clear();
    }

    Ok(tail)
}

#[cfg(test)]
mod tests {
    use simflash::SimFlash;
    use storage::ReadFlash;

    use super::*;

    fn tiny() -> (SimFlash, SlotLayout) {
        let flash = simflash::styles::TINY_UPGRADE.build().unwrap();
        let layout = SlotLayout::from_flash(&flash).unwrap();
        (flash, layout)
    }

    /// Apply an accepted action to a session, as the image manager does
    /// after a successful write.
    fn accept(session: Option<Session>, action: &UploadAction) -> Session {
        let mut session = match session {
            Some(s) if !action.start => s,
            _ => Session::new(action.total_size, action.digest),
        };
        session.advance(action, Tail::new());
        session
    }

    #[test]
    fn three_chunks_three_erases() {
        let (_, layout) = tiny();
        let data = [0x11u8; 100];

        let first = UploadRequest::new(0, &data).total_size(300);
        let (a, msg) = inspect(None, &layout, &first);
        assert_eq!(msg, None);
        assert!(a.start && a.erase && a.write && a.proceed);
        assert_eq!(a.erase_range, 0..128);
        let s = accept(None, &a);

        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(100, &data));
        assert_eq!(a.erase_range, 128..256);
        assert_eq!(a.write_offset, 100);
        assert!(!a.complete);
        let s = accept(Some(s), &a);

        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(200, &data).last(true));
        assert_eq!(a.erase_range, 256..384);
        assert!(a.complete);
        assert_eq!(a.total_size, Some(300));
        let s = accept(Some(s), &a);
        assert_eq!(s.received(), 300);
        assert_eq!(s.erased_up_to(), 384);
    }

    #[test]
    fn sectors_erased_once() {
        let (_, layout) = tiny();
        let data = [0u8; 10];
        let mut session: Option<Session> = None;
        let mut erased = Vec::new();
        for offset in (0..500).step_by(10) {
            let (a, msg) = inspect(session.as_ref(), &layout, &UploadRequest::new(offset, &data));
            assert_eq!(msg, None);
            if a.erase {
                erased.push(a.erase_range.clone());
            }
            session = Some(accept(session, &a));
        }
        assert_eq!(erased, vec![0..128, 128..256, 256..384, 384..512]);
    }

    #[test]
    fn duplicate_is_noop() {
        let (_, layout) = tiny();
        let data = [0u8; 100];
        let (a, _) = inspect(None, &layout, &UploadRequest::new(0, &data));
        let s = accept(None, &a);
        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(100, &data));
        let s = accept(Some(s), &a);

        let (a, msg) = inspect(Some(&s), &layout, &UploadRequest::new(100, &data));
        assert_eq!(msg, None);
        assert!(a.proceed);
        assert!(!a.write && !a.erase);
        assert_eq!(a.write_offset, 200);

        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(150, &data[..50]));
        assert!(a.proceed && !a.write && !a.erase);
    }

    #[test]
    fn overlap_normalized() {
        let (_, layout) = tiny();
        let data = [0u8; 100];
        let (a, _) = inspect(None, &layout, &UploadRequest::new(0, &data));
        let s = accept(None, &a);

        let (a, msg) = inspect(Some(&s), &layout, &UploadRequest::new(60, &data));
        assert_eq!(msg, None);
        assert!(a.write);
        assert_eq!(a.write_offset, 100);
        assert_eq!(a.data_range, 40..100);
        assert_eq!(a.end(), 160);
        assert_eq!(a.erase_range, 128..256);
    }

    #[test]
    fn offset_without_session() {
        let (_, layout) = tiny();
        let data = [0u8; 10];
        let (a, msg) = inspect(None, &layout, &UploadRequest::new(50, &data));
        assert_eq!(a.error, Some(Error::OffsetMismatch));
        assert!(!a.proceed && !a.write && !a.erase);
        assert_eq!(msg, Some("no upload in progress"));

        let (a, _) = inspect(None, &layout, &UploadRequest::new(0, &data));
        assert_eq!(a.error, None);
        assert!(a.start);
    }

    #[test]
    fn gap_rejected() {
        let (_, layout) = tiny();
        let data = [0u8; 10];
        let (a, _) = inspect(None, &layout, &UploadRequest::new(0, &data));
        let s = accept(None, &a);
        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(20, &data));
        assert_eq!(a.error, Some(Error::OffsetMismatch));
    }

    #[test]
    fn restart_erases_from_zero() {
        let (_, layout) = tiny();
        let data = [0u8; 100];
        let (a, _) = inspect(None, &layout, &UploadRequest::new(0, &data));
        let s = accept(None, &a);
        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(100, &data));
        let s = accept(Some(s), &a);
        assert_eq!(s.erased_up_to(), 256);

        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(0, &data));
        assert!(a.start);
        assert_eq!(a.erase_range, 0..128);
        assert_eq!(a.write_offset, 0);
    }

    #[test]
    fn size_limits() {
        let (_, layout) = tiny();
        let cap = layout.image_capacity();
        let data = [0u8; 16];

        let (a, _) = inspect(None, &layout, &UploadRequest::new(0, &data).total_size(cap + 1));
        assert_eq!(a.error, Some(Error::ImageTooLarge));

        let (a, _) = inspect(None, &layout, &UploadRequest::new(0, &data).total_size(cap));
        assert_eq!(a.error, None);
        assert_eq!(a.erase_range, 0..128);

        let s = accept(None, &a);
        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(cap - 8, &data));
        assert_eq!(a.error, Some(Error::ImageTooLarge));

        let (a, _) = inspect(None, &layout, &UploadRequest::new(0, &data).total_size(8));
        assert_eq!(a.error, Some(Error::ImageTooLarge));

        let (a, msg) = inspect(None, &layout, &UploadRequest::new(0, &[]));
        assert_eq!(a.error, Some(Error::InvalidState));
        assert_eq!(msg, Some("empty chunk"));
    }

    #[test]
    fn short_last_chunk() {
        let (_, layout) = tiny();
        let data = [0u8; 100];
        let (a, _) = inspect(None, &layout, &UploadRequest::new(0, &data).total_size(300));
        let s = accept(None, &a);
        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(100, &data).last(true));
        assert_eq!(a.error, Some(Error::VerificationFailed));
        assert!(!a.proceed);
    }

    #[test]
    fn unknown_size_last_chunk() {
        let (_, layout) = tiny();
        let data = [0u8; 100];
        let (a, _) = inspect(None, &layout, &UploadRequest::new(0, &data));
        assert!(!a.complete);
        assert_eq!(a.total_size, None);
        let s = accept(None, &a);
        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(100, &data[..30]).last(true));
        assert!(a.complete);
        assert_eq!(a.total_size, Some(130));
    }

    #[test]
    fn reaching_declared_size_completes() {
        let (_, layout) = tiny();
        let data = [0u8; 100];
        let (a, _) = inspect(None, &layout, &UploadRequest::new(0, &data).total_size(100));
        assert!(a.complete);
    }

    #[test]
    fn final_digest_wins() {
        let (_, layout) = tiny();
        let data = [0u8; 100];
        let (a, _) = inspect(
            None,
            &layout,
            &UploadRequest::new(0, &data).total_size(200).digest([1; 32]),
        );
        assert_eq!(a.digest, Some([1; 32]));
        let s = accept(None, &a);

        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(100, &data));
        assert_eq!(a.digest, Some([1; 32]));
        let (a, _) = inspect(Some(&s), &layout, &UploadRequest::new(100, &data).digest([2; 32]));
        assert_eq!(a.digest, Some([2; 32]));
    }

    #[test]
    fn aligned_writes() {
        let mut flash = SimFlash::new(1, 8, 128, 2).unwrap();
        flash.erase(0, 256).unwrap();

        let bytes: Vec<u8> = (0..30).collect();
        let tail = write_aligned(&mut flash, 0, &Tail::new(), &bytes[..13], false).unwrap();
        assert_eq!(&tail[..], &bytes[8..13]);
        let tail = write_aligned(&mut flash, 13, &tail, &bytes[13..15], false).unwrap();
        assert_eq!(tail.len(), 7);
        let tail = write_aligned(&mut flash, 15, &tail, &bytes[15..30], true).unwrap();
        assert!(tail.is_empty());

        let mut back = [0u8; 32];
        flash.read(0, &mut back).unwrap();
        assert_eq!(&back[..30], &bytes[..]);
        assert_eq!(&back[30..], &[0xff, 0xff]);
    }
}
