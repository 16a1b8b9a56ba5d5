//! Byte search in files

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::Path;

const CHUNK_SIZE: usize = 64 * 1024;

/// Byte offset of the first occurrence of `key` in the file at `path`.
///
/// The file is streamed in chunks; matches spanning a chunk boundary are
/// found. An empty key matches at offset 0.
pub fn find_offset_in_file<P: AsRef<Path>>(path: P, key: &[u8]) -> io::Result<Option<u64>> {
    let file = File::open(path)?;
    find_offset(file, key, CHUNK_SIZE)
}

fn find_offset<R: Read>(mut reader: R, key: &[u8], chunk_size: usize) -> io::Result<Option<u64>> {
    if key.is_empty() {
        return Ok(Some(0));
    }

    let mut chunk = vec![0u8; chunk_size.max(1)];
    // Carries the last key.len() - 1 bytes over into the next search
    let mut window: Vec<u8> = Vec::with_capacity(chunk.len() + key.len());
    let mut window_start: u64 = 0;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        window.extend_from_slice(&chunk[..n]);

        if let Some(pos) = window.windows(key.len()).position(|w| w == key) {
            return Ok(Some(window_start + pos as u64));
        }

        let keep = (key.len() - 1).min(window.len());
        let consumed = window.len() - keep;
        window.drain(..consumed);
        window_start += consumed as u64;
    }
}
