//! Image digests.
//!
//! Finishing an upload needs the digest of what actually landed in flash.
//! Computing it is left to a [`Verifier`], so that a device with a hash
//! engine can use it instead of the software implementation here.

use sha2::{Digest, Sha256};
use storage::ReadFlash;

use crate::{Hash256, Result};

pub trait Verifier {
    /// Compute the digest of the first `len` bytes of the flash.
    fn digest<F: ReadFlash>(&mut self, flash: &mut F, len: usize) -> Result<Hash256>;
}

/// Software SHA-256.
#[derive(Debug, Default)]
pub struct Sha256Verifier;

impl Verifier for Sha256Verifier {
    fn digest<F: ReadFlash>(&mut self, flash: &mut F, len: usize) -> Result<Hash256> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 128];
        let mut pos = 0;
        while pos < len {
            let todo = (len - pos).min(buffer.len());
            let buf = &mut buffer[0..todo];
            flash.read(pos, buf)?;
            hasher.update(&*buf);
            pos += todo;
        }
        let mut result = [0u8; 32];
        result.copy_from_slice(hasher.finalize().as_slice());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_generated() {
        let img = simflash::gen::GenBuilder::default().size(1000).build().unwrap();
        let mut flash = simflash::styles::TINY_UPGRADE.build().unwrap();
        flash.install(&img.data, 0).unwrap();

        let digest = Sha256Verifier.digest(&mut flash, img.data.len()).unwrap();
        assert_eq!(digest, img.digest);

        // The padding past the image is not part of the digest.
        let longer = Sha256Verifier.digest(&mut flash, img.data.len() + 4).unwrap();
        assert_ne!(longer, img.digest);
    }
}
