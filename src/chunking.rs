//! Pure mapping between a serialized buffer and an ordered sequence of
//! fixed-size chunks. Both peers in a connection must agree on [`CHUNK_SIZE`]
//! for the wire protocol to line up; it is exposed here as a compile-time
//! constant so client and server binaries built from this crate share it by
//! construction.

/// Maximum chunk size: 64 KiB.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks needed to cover `n` bytes, `0` for an empty buffer.
pub fn num_chunks(n: u64) -> u32 {
    if n == 0 {
        0
    } else {
        ((n + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64) as u32
    }
}

/// The `index`-th chunk of `buf`, or an empty slice if `index` is out of
/// range for `buf`'s length.
pub fn chunk(buf: &[u8], index: u32) -> &[u8] {
    let start = index as usize * CHUNK_SIZE;
    if start >= buf.len() {
        return &[];
    }
    let end = (start + CHUNK_SIZE).min(buf.len());
    &buf[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_chunks_of_empty_buffer_is_zero() {
        assert_eq!(num_chunks(0), 0);
    }

    #[test]
    fn num_chunks_rounds_up() {
        assert_eq!(num_chunks(1), 1);
        assert_eq!(num_chunks(CHUNK_SIZE as u64), 1);
        assert_eq!(num_chunks(CHUNK_SIZE as u64 + 1), 2);
    }

    #[test]
    fn chunk_boundaries_match_200kib_example() {
        let buf = vec![0u8; 200 * 1024];
        assert_eq!(num_chunks(buf.len() as u64), 4);
        assert_eq!(chunk(&buf, 0).len(), CHUNK_SIZE);
        assert_eq!(chunk(&buf, 1).len(), CHUNK_SIZE);
        assert_eq!(chunk(&buf, 2).len(), CHUNK_SIZE);
        assert_eq!(chunk(&buf, 3).len(), 8 * 1024);
    }

    #[test]
    fn chunk_beyond_range_is_empty() {
        let buf = vec![0u8; 10];
        assert!(chunk(&buf, 5).is_empty());
    }

    #[test]
    fn reassembly_round_trips() {
        let buf: Vec<u8> = (0..250_000u32).map(|i| (i % 251) as u8).collect();
        let n = num_chunks(buf.len() as u64);
        let mut reassembled = Vec::new();
        for i in 0..n {
            reassembled.extend_from_slice(chunk(&buf, i));
        }
        assert_eq!(reassembled, buf);
    }
}
