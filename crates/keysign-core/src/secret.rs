//! Secret byte buffers

use std::fmt;

use zeroize::Zeroizing;

/// Bytes that must not outlive their use: private keys, passphrases,
/// anything piped into a child process on their behalf.
///
/// The buffer is zeroed when dropped and `Debug` only reports its length.
#[derive(Clone, Default)]
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    /// Take ownership of `bytes` without copying them
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Concatenate several secrets into one freshly allocated buffer
    pub fn concat(parts: &[&SecretBytes]) -> Self {
        let total = parts.iter().map(|part| part.len()).sum();
        let mut buffer = Vec::with_capacity(total);
        for part in parts {
            buffer.extend_from_slice(part.expose());
        }
        Self::new(buffer)
    }

    /// Borrow the raw bytes
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drop trailing `\n` / `\r` in place, the way tools terminate a value
    pub fn trim_end_newlines(mut self) -> Self {
        while matches!(self.0.last(), Some(b'\n' | b'\r')) {
            self.0.pop();
        }
        self
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for SecretBytes {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes(<redacted {} bytes>)", self.len())
    }
}
