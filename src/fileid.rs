use std::fmt;

use rand::RngCore;

use crate::io::{Decodeable, Encodeable};

pub const FILEID_BYTES: usize = 20;

/// The 20-byte identifier that names a backing file across renames,
/// crashes and reboots. Identity is the fileid, never the path: see
/// [`crate::buffer_pool::mfp::MPoolFile`] and the "Fileid discipline"
/// rule the buffer pool enforces on rename/remove.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct FileId(pub [u8; FILEID_BYTES]);

impl FileId {
    /// Generate a fresh random fileid, the way a new database file is
    /// stamped the first time it is created.
    pub fn generate() -> Self {
        let mut bytes = [0u8; FILEID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FILEID_BYTES] {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "fileid({})", self)
    }
}

impl Encodeable for FileId {
    fn encode(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Decodeable for FileId {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        let bytes = crate::io::read_exact(reader, FILEID_BYTES);
        let mut arr = [0u8; FILEID_BYTES];
        arr.copy_from_slice(&bytes);
        Self(arr)
    }
}
