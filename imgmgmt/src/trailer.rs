//! Slot trailer
//!
//! The persistent state of each slot is kept in a trailer at the end of the
//! slot.  This is the data the bootloader reads to decide what the next boot
//! does, so a bootloader may use this module directly: after executing a
//! test swap it records the image in slot 0 without the confirmed flag,
//! consumes a pending request by erasing slot 1's trailer, and marks a slot 1
//! image that fails validation as bad.
//!
//! The trailer states of a slot:
//!
//! - Blank. No valid magic.  There is no recorded image, and any flag data is
//!   ignored.
//! - Recorded. Size, digest and magic written.  The image is complete and
//!   verified.
//! - Pending. Recorded, and the pending flag written (test swap).
//! - Permanent. Recorded, permanent and pending written.
//! - Confirmed. Recorded, confirmed written.  Only meaningful in slot 0.
//! - Bad. Recorded, bad written.  Only meaningful in slot 1.
//!
//! The layout, high address at the top.  Each flag starts at a write boundary
//! and takes a whole write unit, so that it can be set later with a single
//! write and no erase.
//!
//! +--------------------------------+ end of slot
//! | magic (16 bytes)
//! | image digest (32 bytes)
//! | image size (u32)
//! |   .. pad to write boundary ..
//! +--------------------------------+
//! | flag - pending
//! +--------------------------------+
//! | flag - permanent
//! +--------------------------------+
//! | flag - confirmed
//! +--------------------------------+
//! | flag - bad
//! +--------------------------------+
//! |   .. unused to sector boundary ..
//! +--------------------------------+ trailer_start
//! | image payload
//!
//! The record block is written in one go after the trailer sectors have been
//! erased, so a reset in the middle leaves either the old trailer, a blank
//! one, or the new one.  The record is stored in native byte order: only the
//! device that wrote it reads it back.

use asraw::{AsMutRaw, AsRaw};
use storage::{Flash, ReadFlash};

use crate::slot::{SlotLayout, MAX_WRITE};
use crate::{Error, Hash256, Result};

/// Marks a trailer as holding a record.
pub const MAGIC: [u8; 16] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f,
    0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79, 0x80,
];

/// First byte of a written flag unit.
pub const FLAG_SET: u8 = 0x01;

/// Value of erased flash.
const ERASED: u8 = 0xff;

pub const FLAG_COUNT: usize = 4;

/// The flags stored in the trailer, in order going down from the record.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrailerFlag {
    Pending = 0,
    Permanent = 1,
    Confirmed = 2,
    Bad = 3,
}

/// The decoded trailer of a slot.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Trailer {
    /// Size and digest of the recorded image.
    pub record: Option<(usize, Hash256)>,
    pub pending: bool,
    pub permanent: bool,
    pub confirmed: bool,
    pub bad: bool,
}

/// The record.  This data is placed at the very end of the slot.
#[derive(Debug, Default)]
#[repr(C)]
struct Record {
    /// Size of the image, in bytes.
    image_size: u32,
    /// SHA-256 of the image.
    digest: [u8; 32],
    /// The magic number.  This should land at the end of the slot.
    magic: [u8; 16],
}

impl AsRaw for Record {}
unsafe impl AsMutRaw for Record {}

type Unit = heapless::Vec<u8, MAX_WRITE>;

/// Size of the record block for a given write size.
pub fn block_size(write_size: usize) -> usize {
    storage::align_up(Record::RAW_SIZE, write_size)
}

fn block_pos(layout: &SlotLayout) -> usize {
    layout.capacity - block_size(layout.write_size)
}

/// Offset of a flag unit within the slot.
pub fn flag_pos(layout: &SlotLayout, flag: TrailerFlag) -> usize {
    block_pos(layout) - (flag as usize + 1) * layout.write_size
}

/// A unit of `len` erased bytes.
fn erased_unit(len: usize) -> Result<Unit> {
    let mut unit = Unit::new();
    unit.resize(len, ERASED).map_err(|_| Error::InvalidState)?;
    Ok(unit)
}

/// Read and decode the trailer of a slot.
pub fn read<F: ReadFlash>(flash: &mut F, layout: &SlotLayout) -> Result<Trailer> {
    let mut record = Record::default();
    flash.read(layout.capacity - Record::RAW_SIZE, record.as_mut_raw())?;

    if record.magic != MAGIC {
        return Ok(Trailer::default());
    }

    let size = record.image_size as usize;
    if size == 0 || size > layout.image_capacity() {
        log::warn!("trailer: ignoring record with bad image size {}", size);
        return Ok(Trailer::default());
    }

    Ok(Trailer {
        record: Some((size, record.digest)),
        pending: is_set(flash, layout, TrailerFlag::Pending)?,
        permanent: is_set(flash, layout, TrailerFlag::Permanent)?,
        confirmed: is_set(flash, layout, TrailerFlag::Confirmed)?,
        bad: is_set(flash, layout, TrailerFlag::Bad)?,
    })
}

fn is_set<F: ReadFlash>(flash: &mut F, layout: &SlotLayout, flag: TrailerFlag) -> Result<bool> {
    let mut unit = [0u8; MAX_WRITE];
    let unit = &mut unit[..layout.write_size];
    flash.read(flag_pos(layout, flag), unit)?;
    Ok(unit[0] == FLAG_SET)
}

/// Set a single flag.  The trailer must hold a record, and the flag must not
/// have been set since the trailer was last erased.
pub fn set_flag<F: Flash>(flash: &mut F, layout: &SlotLayout, flag: TrailerFlag) -> Result<()> {
    let mut unit = erased_unit(layout.write_size)?;
    unit[0] = FLAG_SET;
    log::debug!("trailer: set {:?}", flag);
    flash.write(flag_pos(layout, flag), &unit)?;
    Ok(())
}

/// Erase the trailer sectors, leaving the slot blank.
pub fn erase<F: Flash>(flash: &mut F, layout: &SlotLayout) -> Result<()> {
    flash.erase(layout.trailer_start, layout.capacity)?;
    Ok(())
}

/// Replace the trailer with a fresh record of the image in the slot.  All
/// flags start out clear.
pub fn write_record<F: Flash>(
    flash: &mut F,
    layout: &SlotLayout,
    size: usize,
    digest: &Hash256,
) -> Result<()> {
    let record = Record {
        image_size: u32::try_from(size).map_err(|_| Error::ImageTooLarge)?,
        digest: *digest,
        magic: MAGIC,
    };

    erase(flash, layout)?;

    let mut block = erased_unit(block_size(layout.write_size) - Record::RAW_SIZE)?;
    block
        .extend_from_slice(record.as_raw())
        .map_err(|_| Error::InvalidState)?;
    flash.write(block_pos(layout), &block)?;
    Ok(())
}
