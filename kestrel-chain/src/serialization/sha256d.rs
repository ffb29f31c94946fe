//! SHA256d, the doubled SHA-256 hash that Bitcoin uses for block hashes,
//! transaction ids, and message checksums.

use std::fmt;
use std::io;

use sha2::{Digest, Sha256};

/// An `io::Write` sink that computes the sha256d digest of everything
/// written to it.
#[derive(Default)]
pub struct Writer {
    hash: Sha256,
}

impl Writer {
    /// Consume the writer and produce the doubled hash.
    pub fn finish(self) -> [u8; 32] {
        let result1 = self.hash.finalize();
        let result2 = Sha256::digest(&result1);
        let mut buffer = [0u8; 32];
        buffer[0..32].copy_from_slice(&result2[0..32]);
        buffer
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hash.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Compute the sha256d digest of `data` in one call.
pub fn digest(data: &[u8]) -> [u8; 32] {
    let result = Sha256::digest(&Sha256::digest(data));
    let mut buffer = [0u8; 32];
    buffer[0..32].copy_from_slice(&result[0..32]);
    buffer
}

/// The first four bytes of a sha256d digest, used as a message checksum.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Checksum(pub [u8; 4]);

impl<'a> From<&'a [u8]> for Checksum {
    fn from(bytes: &'a [u8]) -> Self {
        let digest = digest(bytes);
        let mut checksum = [0u8; 4];
        checksum[0..4].copy_from_slice(&digest[0..4]);
        Self(checksum)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Checksum")
            .field(&hex::encode(&self.0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_empty_payload() {
        // sha256d("") starts with 5df6e0e2
        assert_eq!(Checksum::from(&b""[..]).0, [0x5d, 0xf6, 0xe0, 0xe2]);
    }
}
