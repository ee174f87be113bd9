//! Slot flags and swap decisions.

use bitflags::bitflags;
use storage::Flash;

use crate::{trailer, Error, Hash256, Result};

/// Number of image slots.
pub const SLOT_COUNT: usize = 2;
/// The slot holding the running image.
pub const PRIMARY: usize = 0;
/// The slot new images are uploaded into.
pub const SECONDARY: usize = 1;

bitflags! {
    /// Per slot state, as seen by the image manager.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct SlotFlags: u8 {
        /// The slot holds the running image.  Only ever slot 0.
        const ACTIVE = 1 << 0;
        /// The next boot will swap this slot in.  Only ever slot 1.
        const PENDING = 1 << 1;
        /// The image in the slot has been accepted.
        const CONFIRMED = 1 << 2;
        /// The pending swap will not be reverted.
        const PERMANENT = 1 << 3;
        /// The bootloader rejected the image in this slot.
        const BAD = 1 << 4;
    }
}

impl SlotFlags {
    /// Combinations that can never be observed: the running image cannot be
    /// pending, and permanent only qualifies a pending swap.
    pub fn is_consistent(&self) -> bool {
        if self.contains(SlotFlags::ACTIVE | SlotFlags::PENDING) {
            return false;
        }
        !self.contains(SlotFlags::PERMANENT) || self.contains(SlotFlags::PENDING)
    }
}

/// What the bootloader will do on the next boot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SwapType {
    /// Keep running slot 0.
    None,
    /// Swap in slot 1 once; it must confirm itself or be reverted.
    Test,
    /// Swap in slot 1 for good.
    Permanent,
    /// Slot 0 is an unconfirmed test image; swap back.
    Revert,
    /// Slot 1 failed validation.
    Fail,
}

impl SwapType {
    /// The swap implied by the flags of the two slots.
    pub fn from_flags(primary: SlotFlags, secondary: SlotFlags) -> SwapType {
        if secondary.contains(SlotFlags::PENDING) {
            if secondary.contains(SlotFlags::PERMANENT) {
                SwapType::Permanent
            } else {
                SwapType::Test
            }
        } else if !primary.contains(SlotFlags::CONFIRMED) {
            SwapType::Revert
        } else if secondary.contains(SlotFlags::BAD) {
            SwapType::Fail
        } else {
            SwapType::None
        }
    }
}

/// A slot, as read from its trailer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Slot {
    pub index: usize,
    pub flags: SlotFlags,
    /// Size of the recorded image, 0 when there is none.
    pub image_size: usize,
    pub image_digest: Option<Hash256>,
}

impl Slot {
    pub(crate) fn from_trailer(index: usize, trailer: &trailer::Trailer) -> Slot {
        let mut flags = SlotFlags::empty();
        if index == PRIMARY {
            flags |= SlotFlags::ACTIVE;
            // No trailer on the running image means it was never tested.
            if trailer.record.is_none() || trailer.confirmed {
                flags |= SlotFlags::CONFIRMED;
            }
        } else if trailer.record.is_some() {
            if trailer.pending {
                flags |= SlotFlags::PENDING;
                if trailer.permanent {
                    flags |= SlotFlags::PERMANENT;
                }
            }
            if trailer.bad {
                flags |= SlotFlags::BAD;
            }
        }
        debug_assert!(flags.is_consistent());

        let (image_size, image_digest) = match trailer.record {
            Some((size, digest)) => (size, Some(digest)),
            None => (0, None),
        };
        Slot { index, flags, image_size, image_digest }
    }

    pub fn has_image(&self) -> bool {
        self.image_size > 0 && self.image_digest.is_some()
    }
}

pub(crate) fn check_slot(index: usize) -> Result<()> {
    if index < SLOT_COUNT {
        Ok(())
    } else {
        Err(Error::InvalidSlot)
    }
}

/// Largest write size supported.  Trailer blocks are built in buffers of
/// this size.
pub const MAX_WRITE: usize = 512;

/// Geometry of a slot, and where its trailer lives.
///
/// The trailer occupies the last sectors of the slot.  Going down from the
/// end of the slot there is one block with the image record (its magic lands
/// on the very last bytes), then one write unit for each flag.  Images may
/// use everything below the first trailer sector.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SlotLayout {
    pub write_size: usize,
    pub erase_size: usize,
    pub capacity: usize,
    /// Start of the trailer sectors.
    pub trailer_start: usize,
}

impl SlotLayout {
    /// Compute the layout of the slot on this flash device.
    pub fn from_flash<F: Flash>(flash: &F) -> Result<SlotLayout> {
        let write_size = flash.write_size();
        let erase_size = flash.erase_size();
        let capacity = flash.capacity();

        if !write_size.is_power_of_two()
            || write_size > MAX_WRITE
            || erase_size % write_size != 0
            || capacity % erase_size != 0
        {
            return Err(Error::Flash(storage::Error::NotAligned));
        }

        let used = trailer::block_size(write_size) + trailer::FLAG_COUNT * write_size;
        let reserved = storage::align_up(used, erase_size);
        if reserved >= capacity {
            return Err(Error::Flash(storage::Error::OutOfBounds));
        }

        Ok(SlotLayout {
            write_size,
            erase_size,
            capacity,
            trailer_start: capacity - reserved,
        })
    }

    /// Largest image the slot can hold.
    pub fn image_capacity(&self) -> usize {
        self.trailer_start
    }

    /// End of the sector containing the byte just before `offset`, that is,
    /// how far the erase must reach for data to be written up to `offset`.
    pub fn sector_end(&self, offset: usize) -> usize {
        storage::align_up(offset, self.erase_size)
    }
}
