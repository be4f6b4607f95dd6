use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};

/// Calc lowercase-hex digest using SHA-256 algorithm
pub fn sha256_hex(buf: &[u8]) -> String {
    let hash = Sha256::digest(buf);
    base16ct::lower::encode_string(&hash)
}

/// Writer tee which hashes and counts every byte passed through to `inner`.
///
/// Wrapping the payload encoder in this lets the image writer learn the
/// digest and length of the uncompressed tar stream while it is produced,
/// without buffering it.
pub struct HashWriter<W> {
    inner: W,
    hasher: Sha256,
    len: u64,
}

impl<W: Write> HashWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            len: 0,
        }
    }

    /// Returns the inner writer, the hex digest and the byte count.
    pub fn finish(self) -> (W, String, u64) {
        let hash = self.hasher.finalize();
        (self.inner, base16ct::lower::encode_string(&hash), self.len)
    }
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// [`HashWriter`] turned around: hashes and counts everything read from `inner`.
#[derive(Debug)]
pub struct HashReader<R> {
    inner: R,
    hasher: Sha256,
    len: u64,
}

impl<R: Read> HashReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            len: 0,
        }
    }

    pub fn finish(self) -> (String, u64) {
        let hash = self.hasher.finalize();
        (base16ct::lower::encode_string(&hash), self.len)
    }
}

impl<R: Read> Read for HashReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.len += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `echo -n "" | sha256sum`
    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn empty_digest() {
        assert_eq!(sha256_hex(b""), EMPTY);
    }

    #[test]
    fn writer_and_reader_agree() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);

        let mut w = HashWriter::new(Vec::new());
        w.write_all(&data).unwrap();
        let (written, w_hash, w_len) = w.finish();
        assert_eq!(written, data);
        assert_eq!(w_len, data.len() as u64);

        let mut r = HashReader::new(&data[..]);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        let (r_hash, r_len) = r.finish();
        assert_eq!(out, data);
        assert_eq!(r_len, w_len);
        assert_eq!(r_hash, w_hash);
        assert_eq!(w_hash, sha256_hex(&data));
    }
}
