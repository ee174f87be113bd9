//! Flash styles
//!
//! Various microcontrollers have various types of flash memories available to
//! them.  Each style is a pair of areas: the slot holding the running image,
//! and the slot an upload is staged into.

use crate::SimFlash;
use crate::Result;

/// The configuration of a single flash area.
#[derive(Debug)]
pub struct AreaLayout {
    pub read_size: usize,
    pub write_size: usize,
    pub erase_size: usize,
    pub sectors: usize,
}

impl AreaLayout {
    pub fn build(&self) -> Result<SimFlash> {
        SimFlash::new(
            self.read_size,
            self.write_size,
            self.erase_size,
            self.sectors,
        )
    }

    /// Total size of the area, in bytes.
    pub fn capacity(&self) -> usize {
        self.erase_size * self.sectors
    }
}

/// STM32F4-style.
/// These devices have a fairly small number of relatively large sectors.  The
/// last sector of each slot is given over to the slot trailer, so the image
/// is limited to a single sector here.
pub static STM32F_MAIN: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 8,
    erase_size: 128*1024,
    sectors: 2,
};
pub static STM32F_UPGRADE: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 8,
    erase_size: 128*1024,
    sectors: 2,
};

/// K64-style.
/// These devices have small uniform sectors.
pub static K64_MAIN: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 8,
    erase_size: 4*1024,
    sectors: 128/4 + 1,
};
pub static K64_UPGRADE: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 8,
    erase_size: 4*1024,
    sectors: 128/4 + 1,
};

/// External flash configuration.  The external partition is the same size, so
/// the image needs to have room.  The external flash has a large write alignment.
pub static EXT_MAIN: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 4,
    erase_size: 4*1024,
    sectors: 128/4,
};
pub static EXT_UPGRADE: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 256,
    erase_size: 4*1024,
    sectors: 128/4,
};

/// Page-style devices.  Based on the LPC55S69.  With 512 byte writes the
/// trailer spans several pages.
pub static LPC_MAIN: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 512,
    erase_size: 512,
    sectors: 128*2,
};
pub static LPC_UPGRADE: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 512,
    erase_size: 512,
    sectors: 128*2,
};

/// Another large write, based on the STM32H745
pub static STM32H_MAIN: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 32,
    erase_size: 128*1024,
    sectors: 4,
};
pub static STM32H_UPGRADE: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 32,
    erase_size: 128*1024,
    sectors: 3,
};

/// Tiny sectors, so that small test images cross many of them.
pub static TINY_MAIN: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 4,
    erase_size: 128,
    sectors: 8,
};
pub static TINY_UPGRADE: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 4,
    erase_size: 128,
    sectors: 8,
};

/// All of the flash devices, as pairs.
pub static ALL_FLASHES: [(&'static AreaLayout, &'static AreaLayout); 6] = [
    (&STM32F_MAIN, &STM32F_UPGRADE),
    (&K64_MAIN, &K64_UPGRADE),
    (&EXT_MAIN, &EXT_UPGRADE),
    (&LPC_MAIN, &LPC_UPGRADE),
    (&STM32H_MAIN, &STM32H_UPGRADE),
    (&TINY_MAIN, &TINY_UPGRADE),
];

/// An iterator that returns each of the device pairs on each iteration.
pub fn all_flashes() -> impl Iterator<Item = Result<(SimFlash, SimFlash)>> {
    ALL_FLASHES.iter().map(|(a, b)| Ok((a.build()?, b.build()?)))
}
