//! String storage.

/// Byte string body.
///
/// `epoch` advances whenever the length changes. Buffer views compare it
/// against the value recorded at checkout to detect resizes.
#[derive(Debug, Clone, Default)]
pub struct StringBody {
    bytes: Vec<u8>,
    epoch: u32,
}

impl StringBody {
    /// Create from bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, epoch: 0 }
    }

    /// Contents.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Contents for in-place edits that keep the length.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for the empty string.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Resize epoch.
    #[inline]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Contents as UTF-8, lossily.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Replace the contents.
    pub fn replace(&mut self, bytes: &[u8]) {
        if bytes.len() != self.bytes.len() {
            self.bump();
        }
        self.bytes.clear();
        self.bytes.extend_from_slice(bytes);
    }

    /// Append bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.bump();
            self.bytes.extend_from_slice(bytes);
        }
    }

    /// Truncate or NUL-extend to `len`.
    pub fn resize(&mut self, len: usize) {
        if len != self.bytes.len() {
            self.bump();
            self.bytes.resize(len, 0);
        }
    }

    #[inline]
    fn bump(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_length_replace_keeps_epoch() {
        let mut s = StringBody::new(b"abc".to_vec());
        s.replace(b"xyz");
        assert_eq!(s.epoch(), 0);
        assert_eq!(s.bytes(), b"xyz");
    }

    #[test]
    fn test_resizing_operations_bump_epoch() {
        let mut s = StringBody::new(b"abc".to_vec());
        s.append(b"d");
        assert_eq!(s.epoch(), 1);
        s.append(b"");
        assert_eq!(s.epoch(), 1);
        s.resize(2);
        assert_eq!(s.epoch(), 2);
        assert_eq!(s.bytes(), b"ab");
        s.resize(4);
        assert_eq!(s.bytes(), b"ab\0\0");
        s.replace(b"z");
        assert_eq!(s.epoch(), 4);
    }
}
