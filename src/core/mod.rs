//! Core module: buffer primitives
//!
//! Prinsip desain:
//! - Zero-Copy: segment di-share lewat reference counting, bukan di-copy
//! - Fixed-size segments: read path memotong segment dari arena per worker

mod blob;

pub use blob::{Blob, ReadArena};
