//! Image generation.
//!
//! Produces deterministic pseudo-random images for upload tests, along with
//! the SHA-256 digest an uploader would declare for them.

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use sha2::{Digest, Sha256};

use anyhow::{bail, Result};

pub struct GeneratedImage {
    pub data: Vec<u8>,
    pub digest: [u8; 32],
}

impl GeneratedImage {
    /// Split the image the way an uploader would send it: `(offset, data,
    /// last)` for each chunk of at most `size` bytes.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = (usize, &[u8], bool)> {
        let total = self.data.len();
        self.data
            .chunks(size)
            .enumerate()
            .map(move |(i, chunk)| {
                let offset = i * size;
                (offset, chunk, offset + chunk.len() == total)
            })
    }
}

pub struct GenBuilder {
    /// Size of the zeroed header.
    header_size: usize,
    /// Total size of the image, in bytes.
    size: usize,
    /// Seed for the PRNG
    seed: usize,
}

impl Default for GenBuilder {
    fn default() -> Self {
        GenBuilder {
            header_size: 32,
            size: 76_137,
            seed: 1,
        }
    }
}

impl GenBuilder {
    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = size;
        self
    }

    pub fn seed(&mut self, seed: usize) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn header_size(&mut self, header_size: usize) -> &mut Self {
        self.header_size = header_size;
        self
    }

    pub fn build(&self) -> Result<GeneratedImage> {
        if self.size == 0 {
            bail!("Image must not be empty");
        }

        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed as u64);
        let mut data = vec![0u8; self.size];
        rng.fill_bytes(&mut data);

        // The header is required to be zeros, so just fill that in.
        let header = self.header_size.min(self.size);
        data[..header].fill(0);

        let mut digest = [0u8; 32];
        digest.copy_from_slice(Sha256::digest(&data).as_slice());

        Ok(GeneratedImage { data, digest })
    }
}
