//! Simulated flash
//!
//! The NOR-type flashes used in microcontrollers differs quite a bit in terms
//! of capabilities provided.  This simulator attempts to capture the diversity
//! of these devices, closely enough that the image manager can be exercised
//! against each of them on the host.
//!
//! Each device has a read size, a write size and an erase size.  We require
//! that the erase size be a multiple of the write size (they can be the same).
//! At this point in time, the read size is always 1.  There are a couple of
//! different families of devices that are common:
//!
//! - Old style: erase size is 4k-128k, write size is typically 1-8, sometimes
//!   as much as 16 or 32.
//! - Large write: erase size is 128k, write size is 32.  Large to write, but
//!   also large erase sizes.
//! - Paged: erase size is 512, write size is 512.  The write size is much
//!   larger than the others, but the smaller erases allow us to treat the
//!   device more like blocks.
//!
//! The simulator enforces the rules a real part would punish silently: every
//! write unit may be written once between erases, and all accesses must be
//! aligned.  Erased flash reads back as 0xff.  Erase and write calls are
//! counted, and failures can be injected into the next erase or write.

use std::{fs, path::Path};

use anyhow::{anyhow, bail};
use storage::{Error, Flash, ReadFlash};

pub mod gen;
pub mod styles;

pub type Result<T> = anyhow::Result<T>;

/// Value read back from erased flash.
pub const ERASED: u8 = 0xff;

pub struct SimFlash {
    read_size: usize,
    write_size: usize,
    erase_size: usize,
    data: Vec<u8>,
    /// One entry per write unit; true once the unit has been written.
    written: Vec<bool>,
    /// Every successful erase, as `(from, to)`.
    erases: Vec<(usize, usize)>,
    writes: usize,
    fail_erase: bool,
    fail_write: bool,
}

impl SimFlash {
    pub fn new(
        read_size: usize,
        write_size: usize,
        erase_size: usize,
        sectors: usize,
    ) -> Result<SimFlash> {
        if read_size != 1 {
            bail!("Unsupported read size {}", read_size);
        }
        if !write_size.is_power_of_two() || !erase_size.is_power_of_two() {
            bail!("Write and erase sizes must be powers of two");
        }
        if erase_size < write_size {
            bail!("Erase size {} smaller than write size {}", erase_size, write_size);
        }
        if sectors == 0 {
            bail!("Flash must have at least one sector");
        }
        let capacity = erase_size * sectors;
        Ok(SimFlash {
            read_size,
            write_size,
            erase_size,
            data: vec![ERASED; capacity],
            written: vec![false; capacity / write_size],
            erases: Vec::new(),
            writes: 0,
            fail_erase: false,
            fail_write: false,
        })
    }

    /// Place data directly into the flash, erasing the sectors it covers and
    /// padding the final write unit.  This bypasses fault injection and the
    /// erase/write counters, as it stands in for a factory programmer.
    pub fn install(&mut self, data: &[u8], offset: usize) -> Result<()> {
        let end = storage::align_up(offset + data.len(), self.erase_size);
        if offset % self.erase_size != 0 || end > self.capacity() {
            return Err(anyhow!("Image does not fit at 0x{:x}", offset));
        }
        self.raw_erase(offset, end);

        let mut padded = data.to_vec();
        padded.resize(storage::align_up(data.len(), self.write_size), ERASED);
        self.raw_write(offset, &padded)
            .map_err(|e| anyhow!("Install failed: {}", e))
    }

    /// Every erase performed so far.
    pub fn erases(&self) -> &[(usize, usize)] {
        &self.erases
    }

    pub fn erase_count(&self) -> usize {
        self.erases.len()
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    /// Forget the erase and write history.
    pub fn clear_stats(&mut self) {
        self.erases.clear();
        self.writes = 0;
    }

    /// Make the next erase report a device failure.
    pub fn fail_next_erase(&mut self) {
        self.fail_erase = true;
    }

    /// Make the next write report a device failure.  Half of the data is
    /// still programmed, as a write interrupted part way through would be.
    pub fn fail_next_write(&mut self) {
        self.fail_write = true;
    }

    /// Save the flash contents, including which units have been written, so
    /// that a later `load` resumes as if the device had been reset.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = self.data.clone();
        out.extend(self.written.iter().map(|&w| w as u8));
        fs::write(path, out)?;
        Ok(())
    }

    /// Load a flash saved with `save`.  The geometry must match.
    pub fn load<P: AsRef<Path>>(
        write_size: usize,
        erase_size: usize,
        sectors: usize,
        path: P,
    ) -> Result<SimFlash> {
        let mut flash = SimFlash::new(1, write_size, erase_size, sectors)?;
        let saved = fs::read(path)?;
        let capacity = flash.data.len();
        if saved.len() != capacity + flash.written.len() {
            bail!("Saved flash has size {}, expecting geometry to match", saved.len());
        }
        flash.data.copy_from_slice(&saved[..capacity]);
        for (unit, &w) in flash.written.iter_mut().zip(&saved[capacity..]) {
            *unit = w != 0;
        }
        Ok(flash)
    }

    fn raw_erase(&mut self, from: usize, to: usize) {
        self.data[from..to].fill(ERASED);
        self.written[from / self.write_size..to / self.write_size].fill(false);
    }

    fn raw_write(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        let units = offset / self.write_size..(offset + bytes.len()) / self.write_size;
        if self.written[units.clone()].iter().any(|&w| w) {
            return Err(Error::NotErased);
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.written[units].fill(true);
        Ok(())
    }
}

impl ReadFlash for SimFlash {
    fn read_size(&self) -> usize {
        self.read_size
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        storage::check_read(self, offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Flash for SimFlash {
    fn write_size(&self) -> usize {
        self.write_size
    }

    fn erase_size(&self) -> usize {
        self.erase_size
    }

    fn erase(&mut self, from: usize, to: usize) -> storage::Result<()> {
        storage::check_erase(self, from, to)?;
        if self.fail_erase {
            self.fail_erase = false;
            return Err(Error::Failed);
        }
        self.raw_erase(from, to);
        self.erases.push((from, to));
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        storage::check_write(self, offset, bytes.len())?;
        if self.fail_write {
            self.fail_write = false;
            let half = storage::align_down(bytes.len() / 2, self.write_size);
            self.raw_write(offset, &bytes[..half])?;
            return Err(Error::Failed);
        }
        self.raw_write(offset, bytes)?;
        self.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_dir::TempDir;

    fn small() -> SimFlash {
        SimFlash::new(1, 8, 128, 4).unwrap()
    }

    #[test]
    fn erased_reads_ones() {
        let mut flash = small();
        let mut buf = [0u8; 16];
        flash.read(100, &mut buf).unwrap();
        assert_eq!(buf, [ERASED; 16]);
    }

    #[test]
    fn write_once() {
        let mut flash = small();
        flash.write(8, &[1; 8]).unwrap();
        assert_eq!(flash.write(8, &[2; 8]), Err(Error::NotErased));
        flash.erase(0, 128).unwrap();
        flash.write(8, &[2; 8]).unwrap();
        assert_eq!(flash.erase_count(), 1);
        assert_eq!(flash.write_count(), 2);
    }

    #[test]
    fn alignment_enforced() {
        let mut flash = small();
        assert_eq!(flash.write(4, &[0; 8]), Err(Error::NotAligned));
        assert_eq!(flash.write(0, &[0; 5]), Err(Error::NotAligned));
        assert_eq!(flash.erase(0, 64), Err(Error::NotAligned));
        assert_eq!(flash.erase(0, 1024), Err(Error::OutOfBounds));
    }

    #[test]
    fn injected_failures() {
        let mut flash = small();
        flash.fail_next_erase();
        assert_eq!(flash.erase(0, 128), Err(Error::Failed));
        assert_eq!(flash.erase_count(), 0);
        flash.erase(0, 128).unwrap();

        flash.fail_next_write();
        assert_eq!(flash.write(0, &[7; 32]), Err(Error::Failed));
        // The interrupted write left its first half behind.
        assert_eq!(flash.write(0, &[7; 8]), Err(Error::NotErased));
        flash.write(16, &[7; 16]).unwrap();
    }

    #[test]
    fn save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("flash.bin");

        let mut flash = small();
        flash.install(&[0x5a; 20], 128).unwrap();
        flash.save(&path).unwrap();

        let mut back = SimFlash::load(8, 128, 4, &path).unwrap();
        let mut buf = [0u8; 24];
        back.read(128, &mut buf).unwrap();
        assert_eq!(&buf[..20], &[0x5a; 20]);
        assert_eq!(&buf[20..], &[ERASED; 4]);
        // The padded unit is still marked as written.
        assert_eq!(back.write(144, &[0; 8]), Err(Error::NotErased));

        assert!(SimFlash::load(8, 128, 8, &path).is_err());
    }
}
