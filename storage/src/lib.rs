//! Storage types.
//!
//! The flash traits here are what the image manager consumes from the
//! device.  They follow the shape of the NOR flash traits from
//! embedded-storage, but use `usize` offsets and a single error type.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use core::fmt;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    NotAligned,
    OutOfBounds,
    NotWritten,
    NotErased,
    /// The device reported a failure of the operation itself.
    Failed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotAligned => "access not aligned",
            Error::OutOfBounds => "access out of bounds",
            Error::NotWritten => "read of unwritten flash",
            Error::NotErased => "write to flash that is not erased",
            Error::Failed => "flash operation failed",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// Read only interface into flash.
pub trait ReadFlash {
    /// What is the read size (alignment and size multiple).
    fn read_size(&self) -> usize;
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()>;
    fn capacity(&self) -> usize;
}

/// Flash that can be written to.
pub trait Flash: ReadFlash {
    /// Write size (alignment and size multiple).
    fn write_size(&self) -> usize;
    /// Erase size (alignment and size multiple).
    fn erase_size(&self) -> usize;

    /// Erase the sectors in `from..to`.  Both ends must be erase aligned.
    fn erase(&mut self, from: usize, to: usize) -> Result<()>;
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;
}

impl<T: ReadFlash + ?Sized> ReadFlash for &mut T {
    fn read_size(&self) -> usize {
        (**self).read_size()
    }
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()> {
        (**self).read(offset, bytes)
    }
    fn capacity(&self) -> usize {
        (**self).capacity()
    }
}

impl<T: Flash + ?Sized> Flash for &mut T {
    fn write_size(&self) -> usize {
        (**self).write_size()
    }
    fn erase_size(&self) -> usize {
        (**self).erase_size()
    }
    fn erase(&mut self, from: usize, to: usize) -> Result<()> {
        (**self).erase(from, to)
    }
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        (**self).write(offset, bytes)
    }
}

/// Round `value` up to a multiple of `align`.  `align` must be non-zero.
pub fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Round `value` down to a multiple of `align`.  `align` must be non-zero.
pub fn align_down(value: usize, align: usize) -> usize {
    value - value % align
}

// Utilities taken from embedded-storage for validating arguments.
pub fn check_read<T: ReadFlash + ?Sized>(
    flash: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_slice(flash, flash.read_size(), offset, length)
}

pub fn check_erase<T: Flash + ?Sized>(
    flash: &T,
    from: usize,
    to: usize,
) -> Result<()> {
    if from > to || to > flash.capacity() {
        return Err(Error::OutOfBounds);
    }
    if from % flash.erase_size() != 0 || to % flash.erase_size() != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

pub fn check_write<T: Flash + ?Sized>(
    flash: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_slice(flash, flash.write_size(), offset, length)
}

pub fn check_slice<T: ReadFlash + ?Sized>(
    flash: &T,
    align: usize,
    offset: usize,
    length: usize,
) -> Result<()> {
    if length > flash.capacity() || offset > flash.capacity() - length {
        return Err(Error::OutOfBounds);
    }
    if offset % align != 0 || length % align != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Geometry only, enough to drive the checkers.
    struct Geometry {
        write: usize,
        erase: usize,
        capacity: usize,
    }

    impl ReadFlash for Geometry {
        fn read_size(&self) -> usize {
            1
        }
        fn read(&mut self, _offset: usize, _bytes: &mut [u8]) -> Result<()> {
            Ok(())
        }
        fn capacity(&self) -> usize {
            self.capacity
        }
    }

    impl Flash for Geometry {
        fn write_size(&self) -> usize {
            self.write
        }
        fn erase_size(&self) -> usize {
            self.erase
        }
        fn erase(&mut self, _from: usize, _to: usize) -> Result<()> {
            Ok(())
        }
        fn write(&mut self, _offset: usize, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    const DEV: Geometry = Geometry { write: 8, erase: 128, capacity: 1024 };

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(128, 128), 128);
        assert_eq!(align_up(300, 128), 384);
        assert_eq!(align_down(300, 128), 256);
        assert_eq!(align_down(127, 128), 0);
    }

    #[test]
    fn erase_checks() {
        assert_eq!(check_erase(&DEV, 0, 128), Ok(()));
        assert_eq!(check_erase(&DEV, 128, 128), Ok(()));
        assert_eq!(check_erase(&DEV, 0, 100), Err(Error::NotAligned));
        assert_eq!(check_erase(&DEV, 256, 128), Err(Error::OutOfBounds));
        assert_eq!(check_erase(&DEV, 0, 2048), Err(Error::OutOfBounds));
    }

    #[test]
    fn write_checks() {
        assert_eq!(check_write(&DEV, 8, 16), Ok(()));
        assert_eq!(check_write(&DEV, 4, 8), Err(Error::NotAligned));
        assert_eq!(check_write(&DEV, 1016, 16), Err(Error::OutOfBounds));
        assert_eq!(check_read(&DEV, 3, 5), Ok(()));
    }
}
