//! AsRaw provides a safe way to view a structure as its bytes, and an unsafe
//! way to have this as a mutable view.  Generally, this is safe and meaningful
//! for structures that are repr(C).  `as_mut_raw` is only safe in this case.
//!
//! The image manager uses these views to move its slot trailer records
//! to and from flash without an intermediate encoding step.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use core::{mem, slice};

pub trait AsRaw : Sized {
    /// Size of the raw view, in bytes.
    const RAW_SIZE: usize = mem::size_of::<Self>();

    fn as_raw(&self) -> &[u8] {
        unsafe {
            slice::from_raw_parts(self as *const _ as *const u8,
                                  mem::size_of::<Self>())
        }
    }
}

/// Provide a view into a structure.  This is an unsafe trait, because, in
/// general, it isn't safe to interpret arbitrary bytes as another type.
/// However, if the struct is `repr(C)`, and all types used are valid for all
/// possible values, this will be safe.
pub unsafe trait AsMutRaw : Sized {
    fn as_mut_raw(&mut self) -> &mut [u8] {
        unsafe {
            slice::from_raw_parts_mut(self as *mut _ as *mut u8,
                                      mem::size_of::<Self>())
        }
    }
}
