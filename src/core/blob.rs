//! Blob: chained, reference-counted byte segments
//!
//! Setiap segment adalah `Bytes` (shared ownership), jadi slicing dan
//! forwarding antar channel tidak pernah copy payload.
//! `ReadArena` memotong segment ber-ukuran tetap dari satu alokasi
//! per worker; storage di-reclaim otomatis saat semua referensi di-drop.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::ops::Range;

use bytes::{Buf, Bytes, BytesMut};

/// Rangkaian segment dengan panjang logis total.
///
/// `len` selalu sama dengan jumlah panjang segment yang masih hidup;
/// segment kosong tidak pernah disimpan.
#[derive(Clone, Default)]
pub struct Blob {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl Blob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total byte yang belum dikonsumsi
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Tambah segment di belakang (zero-copy)
    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push_back(segment);
    }

    /// Pindahkan semua segment dari `other` ke belakang blob ini
    pub fn append(&mut self, mut other: Blob) {
        self.len += other.len;
        self.segments.append(&mut other.segments);
    }

    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }

    /// Potong `[..at]` menjadi blob baru, sisanya tetap di sini.
    ///
    /// # Panics
    /// Panic jika `at > len`.
    pub fn split_to(&mut self, at: usize) -> Blob {
        assert!(at <= self.len, "split_to out of bounds: {} > {}", at, self.len);

        let mut head = Blob::new();
        let mut need = at;
        while need > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= need {
                need -= front.len();
                if let Some(seg) = self.segments.pop_front() {
                    head.push(seg);
                }
            } else {
                head.push(front.split_to(need));
                need = 0;
            }
        }
        self.len -= at;
        head
    }

    /// Zero-copy view atas `range`.
    ///
    /// # Panics
    /// Panic jika range di luar `0..len`.
    pub fn slice(&self, range: Range<usize>) -> Blob {
        assert!(
            range.start <= range.end && range.end <= self.len,
            "slice {:?} out of bounds for blob of length {}",
            range,
            self.len
        );

        let mut out = Blob::new();
        let mut offset = 0;
        for seg in &self.segments {
            let seg_start = offset;
            let seg_end = offset + seg.len();
            offset = seg_end;

            if seg_end <= range.start {
                continue;
            }
            if seg_start >= range.end {
                break;
            }

            let from = range.start.saturating_sub(seg_start);
            let to = (range.end - seg_start).min(seg.len());
            out.push(seg.slice(from..to));
        }
        out
    }

    /// Copy semua segment ke satu Vec (untuk test dan debugging)
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }
}

impl Buf for Blob {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        self.segments.front().map(|s| s.as_ref()).unwrap_or(&[])
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.len, "advance past end of blob");
        self.len -= cnt;

        while cnt > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= cnt {
                cnt -= front.len();
                self.segments.pop_front();
            } else {
                front.advance(cnt);
                cnt = 0;
            }
        }
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut n = 0;
        for (slot, seg) in dst.iter_mut().zip(self.segments.iter()) {
            *slot = IoSlice::new(seg);
            n += 1;
        }
        n
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("len", &self.len)
            .field("segments", &self.segments.len())
            .finish()
    }
}

impl From<Bytes> for Blob {
    fn from(segment: Bytes) -> Self {
        let mut blob = Blob::new();
        blob.push(segment);
        blob
    }
}

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self {
        Blob::from(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Blob {
    fn from(s: &'static [u8]) -> Self {
        Blob::from(Bytes::from_static(s))
    }
}

impl FromIterator<Bytes> for Blob {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        let mut blob = Blob::new();
        for seg in iter {
            blob.push(seg);
        }
        blob
    }
}

/// Arena untuk read segment ber-ukuran tetap.
///
/// Satu arena per worker thread; tidak `Sync` dan tidak perlu.
pub struct ReadArena {
    buf: BytesMut,
    segment_size: usize,
}

impl ReadArena {
    pub fn new(segment_size: usize) -> Self {
        assert!(segment_size > 0, "segment size must be non-zero");
        Self {
            buf: BytesMut::with_capacity(segment_size),
            segment_size,
        }
    }

    #[inline(always)]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Isi satu segment lewat `fill` lalu freeze hasilnya.
    ///
    /// `fill` menerima slice sebesar `segment_size` dan mengembalikan jumlah
    /// byte yang ditulis. Segment kosong dikembalikan apa adanya (EOF).
    pub fn read_segment<F>(&mut self, fill: F) -> io::Result<Bytes>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        self.buf.clear();
        self.buf.reserve(self.segment_size);
        self.buf.resize(self.segment_size, 0);

        let n = fill(&mut self.buf[..])?;
        self.buf.truncate(n.min(self.segment_size));
        Ok(self.buf.split().freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_of(parts: &[&'static [u8]]) -> Blob {
        parts.iter().map(|p| Bytes::from_static(*p)).collect()
    }

    #[test]
    fn test_push_tracks_len() {
        let mut blob = Blob::new();
        assert!(blob.is_empty());

        blob.push(Bytes::from_static(b"hello"));
        blob.push(Bytes::new()); // diabaikan
        blob.push(Bytes::from_static(b" world"));

        assert_eq!(blob.len(), 11);
        assert_eq!(blob.segment_count(), 2);
        assert_eq!(blob.to_vec(), b"hello world");
    }

    #[test]
    fn test_advance_across_segments() {
        let mut blob = blob_of(&[b"abc", b"def", b"gh"]);

        blob.advance(4);
        assert_eq!(blob.len(), 4);
        assert_eq!(blob.chunk(), b"ef");
        assert_eq!(blob.segment_count(), 2);

        blob.advance(4);
        assert!(blob.is_empty());
        assert_eq!(blob.chunk(), b"");
    }

    #[test]
    fn test_split_to() {
        let mut blob = blob_of(&[b"abc", b"def"]);
        let head = blob.split_to(4);

        assert_eq!(head.to_vec(), b"abcd");
        assert_eq!(blob.to_vec(), b"ef");
        assert_eq!(head.len() + blob.len(), 6);
    }

    #[test]
    fn test_slice_is_zero_copy() {
        let seg = Bytes::from(vec![7u8; 64]);
        let base_ptr = seg.as_ptr();
        let blob = Blob::from(seg);

        let view = blob.slice(8..16);
        let first = view.segments().next().unwrap();
        assert_eq!(first.len(), 8);
        // Pointer menunjuk ke alokasi yang sama
        assert_eq!(first.as_ptr(), unsafe { base_ptr.add(8) });
    }

    #[test]
    fn test_slice_spans_segments() {
        let blob = blob_of(&[b"0123", b"4567", b"89"]);
        assert_eq!(blob.slice(2..9).to_vec(), b"2345678");
        assert_eq!(blob.slice(4..8).segment_count(), 1);
        assert!(blob.slice(3..3).is_empty());
    }

    #[test]
    fn test_chunks_vectored() {
        let blob = blob_of(&[b"ab", b"cd", b"ef"]);
        let mut slots = [IoSlice::new(&[]); 2];
        let n = blob.chunks_vectored(&mut slots);

        assert_eq!(n, 2);
        assert_eq!(&*slots[0], b"ab");
        assert_eq!(&*slots[1], b"cd");
    }

    #[test]
    fn test_append_moves_segments() {
        let mut a = blob_of(&[b"ab"]);
        a.append(blob_of(&[b"cd", b"e"]));
        assert_eq!(a.len(), 5);
        assert_eq!(a.segment_count(), 3);
    }

    #[test]
    fn test_arena_read_segment() {
        let mut arena = ReadArena::new(8);

        let seg = arena
            .read_segment(|buf| {
                assert_eq!(buf.len(), 8);
                buf[..3].copy_from_slice(b"xyz");
                Ok(3)
            })
            .unwrap();
        assert_eq!(&seg[..], b"xyz");

        // Segment sebelumnya tetap valid setelah arena dipakai lagi
        let seg2 = arena.read_segment(|buf| {
            buf[..2].copy_from_slice(b"qq");
            Ok(2)
        });
        assert_eq!(&seg2.unwrap()[..], b"qq");
        assert_eq!(&seg[..], b"xyz");
    }

    #[test]
    fn test_arena_propagates_error() {
        let mut arena = ReadArena::new(4);
        let err = arena
            .read_segment(|_| Err(io::Error::from(io::ErrorKind::WouldBlock)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
