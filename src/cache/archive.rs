//! Buffered engine archives and their content digests.

use std::io::{self, Read};

use sha2::{Digest, Sha256};

/// Prefix of every content-addressed extraction directory.
const DIRECTORY_PREFIX: &str = "PG-";

/// An engine archive held in memory together with the SHA-256 digest of its
/// bytes.
#[derive(Debug, Clone)]
pub(crate) struct EngineArchive {
    bytes: Vec<u8>,
    digest: String,
}

impl EngineArchive {
    /// Copies `reader` to exhaustion, digesting the bytes as they stream past.
    pub(crate) fn read_from(reader: impl Read) -> io::Result<Self> {
        let mut digesting = DigestReader::new(reader);
        let mut bytes = Vec::new();
        digesting.read_to_end(&mut bytes)?;
        Ok(Self {
            bytes,
            digest: digesting.finish(),
        })
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex-encoded SHA-256 of the archive bytes.
    pub(crate) fn digest(&self) -> &str {
        &self.digest
    }

    /// Name of the extraction directory for this archive.
    pub(crate) fn directory_name(&self) -> String {
        format!("{DIRECTORY_PREFIX}{}", self.digest)
    }
}

/// Reader adapter that feeds every byte it yields into a hasher.
struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> DigestReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if let Some(chunk) = buf.get(..read) {
            self.hasher.update(chunk);
        }
        Ok(read)
    }
}
