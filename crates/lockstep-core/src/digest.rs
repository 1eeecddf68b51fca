//! Running segment digests.
//!
//! Both sides of a segment pack their operation stream into 512-bit chunks
//! of eight 64-bit words: one `(addr << 8) | size` word per record, followed
//! by the written bytes for stores and swaps of at most 32 bytes. A record
//! that does not fit in the current chunk pads it out. The last chunk gets
//! a `1 << 63` terminator and the message length in word 7.
//!
//! The digest is an equality oracle only. Snapshot comparison decides the
//! verdict; the chunk compressor is swappable through [`ChunkCompressor`].

use std::fmt;

use lockstep_types::AccessKind;
use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::Xxh3;

use crate::config::DigestKind;
use crate::record::MemAccess;

/// Words per chunk.
pub const CHUNK_WORDS: usize = 8;

/// Records with more written bytes than this contribute only their header.
pub const MAX_HASHED_DATA: usize = 32;

const SHA256_IV: [u32; 8] = [
    0x6a09_e667, 0xbb67_ae85, 0x3c6e_f372, 0xa54f_f53a, 0x510e_527f, 0x9b05_688c, 0x1f83_d9ab,
    0x5be0_cd19,
];

const SHA256_K: [u32; 64] = [
    0x428a_2f98, 0x7137_4491, 0xb5c0_fbcf, 0xe9b5_dba5, 0x3956_c25b, 0x59f1_11f1, 0x923f_82a4,
    0xab1c_5ed5, 0xd807_aa98, 0x1283_5b01, 0x2431_85be, 0x550c_7dc3, 0x72be_5d74, 0x80de_b1fe,
    0x9bdc_06a7, 0xc19b_f174, 0xe49b_69c1, 0xefbe_4786, 0x0fc1_9dc6, 0x240c_a1cc, 0x2de9_2c6f,
    0x4a74_84aa, 0x5cb0_a9dc, 0x76f9_88da, 0x983e_5152, 0xa831_c66d, 0xb003_27c8, 0xbf59_7fc7,
    0xc6e0_0bf3, 0xd5a7_9147, 0x06ca_6351, 0x1429_2967, 0x27b7_0a85, 0x2e1b_2138, 0x4d2c_6dfc,
    0x5338_0d13, 0x650a_7354, 0x766a_0abb, 0x81c2_c92e, 0x9272_2c85, 0xa2bf_e8a1, 0xa81a_664b,
    0xc24b_8b70, 0xc76c_51a3, 0xd192_e819, 0xd699_0624, 0xf40e_3585, 0x106a_a070, 0x19a4_c116,
    0x1e37_6c08, 0x2748_774c, 0x34b0_bcb5, 0x391c_0cb3, 0x4ed8_aa4a, 0x5b9c_ca4f, 0x682e_6ff3,
    0x748f_82ee, 0x78a5_636f, 0x84c8_7814, 0x8cc7_0208, 0x90be_fffa, 0xa450_6ceb, 0xbef9_a3f7,
    0xc671_78f2,
];

/// Final value of a segment digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestValue {
    Sha256Compat([u32; 8]),
    Sha256([u8; 32]),
    Xxh3(u64),
}

impl fmt::Display for DigestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256Compat(words) => {
                for word in words {
                    write!(f, "{word:08x}")?;
                }
                Ok(())
            }
            Self::Sha256(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Self::Xxh3(value) => write!(f, "{value:016x}"),
        }
    }
}

/// Compression step applied to every finished chunk.
pub trait ChunkCompressor: Send {
    fn compress(&mut self, chunk: &[u64; CHUNK_WORDS]);
    fn value(&self) -> DigestValue;
    fn reset(&mut self);
}

/// SHA-256 compression over the chunk's 32-bit halves, high half first.
#[derive(Debug, Clone)]
pub struct Sha256Compat {
    state: [u32; 8],
}

impl Sha256Compat {
    pub fn new() -> Self {
        Self { state: SHA256_IV }
    }
}

impl Default for Sha256Compat {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkCompressor for Sha256Compat {
    #[allow(clippy::cast_possible_truncation, clippy::many_single_char_names)]
    fn compress(&mut self, chunk: &[u64; CHUNK_WORDS]) {
        let mut w = [0_u32; 64];
        for (i, slot) in w.iter_mut().take(16).enumerate() {
            let word = chunk[i / 2];
            *slot = if i % 2 == 1 { word as u32 } else { (word >> 32) as u32 };
        }
        for i in 16..64 {
            let s0 = w[i - 15].rotate_right(7) ^ w[i - 15].rotate_right(18) ^ (w[i - 15] >> 3);
            let s1 = w[i - 2].rotate_right(17) ^ w[i - 2].rotate_right(19) ^ (w[i - 2] >> 10);
            w[i] = w[i - 16]
                .wrapping_add(s0)
                .wrapping_add(w[i - 7])
                .wrapping_add(s1);
        }
        let [mut a, mut b, mut c, mut d, mut e, mut f, mut g, mut h] = self.state;
        for i in 0..64 {
            let big_s1 = e.rotate_right(6) ^ e.rotate_right(11) ^ e.rotate_right(25);
            let ch = (e & f) ^ (!e & g);
            let temp1 = h
                .wrapping_add(big_s1)
                .wrapping_add(ch)
                .wrapping_add(SHA256_K[i])
                .wrapping_add(w[i]);
            let big_s0 = a.rotate_right(2) ^ a.rotate_right(13) ^ a.rotate_right(22);
            let maj = (a & b) ^ (a & c) ^ (b & c);
            let temp2 = big_s0.wrapping_add(maj);
            h = g;
            g = f;
            f = e;
            e = d.wrapping_add(temp1);
            d = c;
            c = b;
            b = a;
            a = temp1.wrapping_add(temp2);
        }
        for (slot, value) in self.state.iter_mut().zip([a, b, c, d, e, f, g, h]) {
            *slot = slot.wrapping_add(value);
        }
    }

    fn value(&self) -> DigestValue {
        DigestValue::Sha256Compat(self.state)
    }

    fn reset(&mut self) {
        self.state = SHA256_IV;
    }
}

/// Standard SHA-256 over the big-endian bytes of each chunk.
#[derive(Debug, Clone, Default)]
pub struct Sha256Chunks {
    hasher: Sha256,
}

impl Sha256Chunks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkCompressor for Sha256Chunks {
    fn compress(&mut self, chunk: &[u64; CHUNK_WORDS]) {
        for word in chunk {
            self.hasher.update(word.to_be_bytes());
        }
    }

    fn value(&self) -> DigestValue {
        let mut bytes = [0_u8; 32];
        bytes.copy_from_slice(&self.hasher.clone().finalize());
        DigestValue::Sha256(bytes)
    }

    fn reset(&mut self) {
        self.hasher = Sha256::new();
    }
}

/// xxh3-64 over the little-endian bytes of each chunk.
pub struct Xxh3Chunks {
    hasher: Xxh3,
}

impl Xxh3Chunks {
    pub fn new() -> Self {
        Self {
            hasher: Xxh3::new(),
        }
    }
}

impl Default for Xxh3Chunks {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkCompressor for Xxh3Chunks {
    fn compress(&mut self, chunk: &[u64; CHUNK_WORDS]) {
        for word in chunk {
            self.hasher.update(&word.to_le_bytes());
        }
    }

    fn value(&self) -> DigestValue {
        DigestValue::Xxh3(self.hasher.digest())
    }

    fn reset(&mut self) {
        self.hasher.reset();
    }
}

// ---------------------------------------------------------------------------
// RunningDigest
// ---------------------------------------------------------------------------

/// One record as seen by the digest, after micro-step merging.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRecord {
    kind: AccessKind,
    addr: u64,
    size: usize,
    /// Written bytes; empty for loads.
    data: Vec<u8>,
    pc: u64,
    micro_pc: u16,
}

impl PendingRecord {
    fn absorbs(&self, access: &MemAccess) -> bool {
        access.micro_pc > 0
            && self.pc == access.pc
            && self.micro_pc < access.micro_pc
            && self.kind == access.kind
            && self.addr.wrapping_add(self.size as u64) == access.addr
    }
}

/// Incremental digest of one side of a segment.
///
/// A record is packed only when the next non-merging access arrives (or at
/// [`RunningDigest::finish`]), so micro-steps of one instruction collapse
/// into one record exactly as they do in the log.
pub struct RunningDigest {
    compressor: Box<dyn ChunkCompressor>,
    chunk: [u64; CHUNK_WORDS],
    index: usize,
    message_bits: u64,
    pending: Option<PendingRecord>,
    records: u64,
}

impl fmt::Debug for RunningDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningDigest")
            .field("index", &self.index)
            .field("message_bits", &self.message_bits)
            .field("records", &self.records)
            .field("pending", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

impl RunningDigest {
    pub fn new(kind: DigestKind) -> Self {
        let compressor: Box<dyn ChunkCompressor> = match kind {
            DigestKind::Sha256Compat => Box::new(Sha256Compat::new()),
            DigestKind::Sha256 => Box::new(Sha256Chunks::new()),
            DigestKind::Xxh3 => Box::new(Xxh3Chunks::new()),
        };
        Self::with_compressor(compressor)
    }

    pub fn with_compressor(compressor: Box<dyn ChunkCompressor>) -> Self {
        Self {
            compressor,
            chunk: [0; CHUNK_WORDS],
            index: 0,
            message_bits: 0,
            pending: None,
            records: 0,
        }
    }

    pub fn reset(&mut self) {
        self.compressor.reset();
        self.chunk = [0; CHUNK_WORDS];
        self.index = 0;
        self.message_bits = 0;
        self.pending = None;
        self.records = 0;
    }

    /// Records packed so far, not counting the pending one.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Feed one committed access.
    pub fn feed(&mut self, access: &MemAccess) {
        if let Some(pending) = self.pending.as_mut() {
            if pending.absorbs(access) {
                pending.size += access.len();
                if !access.kind.is_load() {
                    pending.data.extend_from_slice(&access.payload);
                }
                pending.micro_pc = access.micro_pc;
                return;
            }
        }
        let next = PendingRecord {
            kind: access.kind,
            addr: access.addr,
            size: access.len(),
            data: if access.kind.is_load() {
                Vec::new()
            } else {
                access.payload.clone()
            },
            pc: access.pc,
            micro_pc: access.micro_pc,
        };
        if let Some(done) = self.pending.replace(next) {
            self.pack(&done);
        }
    }

    /// Pack the pending record, pad, and return the final value.
    pub fn finish(&mut self) -> DigestValue {
        if let Some(done) = self.pending.take() {
            self.pack(&done);
        }
        if self.index >= CHUNK_WORDS - 1 {
            self.pad_and_compress();
        }
        self.chunk[self.index] = 1 << 63;
        self.chunk[CHUNK_WORDS - 1] = self.message_bits;
        self.compress_chunk();
        self.compressor.value()
    }

    fn pack(&mut self, record: &PendingRecord) {
        let size = record.data.len();
        let data_words = if size > MAX_HASHED_DATA {
            0
        } else {
            size.div_ceil(8)
        };
        if self.index + data_words + 1 > CHUNK_WORDS {
            self.pad_and_compress();
        }
        self.chunk[self.index] = (record.addr << 8) | (record.size as u64 & 0xff);
        self.index += 1;
        self.message_bits += 64;
        if data_words > 0 {
            for (word, bytes) in self.chunk[self.index..self.index + data_words]
                .iter_mut()
                .zip(record.data.chunks(8))
            {
                let mut le = [0_u8; 8];
                le[..bytes.len()].copy_from_slice(bytes);
                *word = u64::from_le_bytes(le);
            }
            self.index += data_words;
            self.message_bits += data_words as u64 * 64;
        }
        self.records += 1;
    }

    fn pad_and_compress(&mut self) {
        self.message_bits += (CHUNK_WORDS - self.index) as u64 * 8;
        self.compress_chunk();
    }

    fn compress_chunk(&mut self) {
        self.compressor.compress(&self.chunk);
        self.chunk = [0; CHUNK_WORDS];
        self.index = 0;
    }
}
