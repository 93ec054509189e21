// Brute-force digest search
//
// Enumerates every fixed-length suffix over a charset, packs each
// `prefix + suffix` message into a padded single SHA-256 block, hashes the
// blocks in fixed-size batches and keeps the smallest digest seen so far.

use crate::backend::{self, Buffer, Device, Program};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

pub const BASE64_CHARSET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Longest message that still fits one padded SHA-256 block
pub const MAX_MESSAGE_LEN: usize = 55;

pub const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// One 512-bit message block as sixteen 32-bit words
pub type Block = [u32; 16];

/// Workgroup size of `sha256_miner.comp`
pub const MINER_LOCAL_SIZE: u32 = 256;

/// Workgroups needed for one invocation per block
pub fn miner_workgroups(blocks: usize) -> u32 {
    (blocks as u32).div_ceil(MINER_LOCAL_SIZE)
}

/// All strings of a fixed length over an alphabet, last position fastest.
///
/// Candidates are distinct only when the alphabet bytes are.
pub struct Candidates<'c> {
    alphabet: &'c [u8],
    digits: Vec<usize>,
    current: Vec<u8>,
    started: bool,
    done: bool,
}

impl<'c> Candidates<'c> {
    pub fn new(alphabet: &'c [u8], len: usize) -> Self {
        Self {
            alphabet,
            digits: vec![0; len],
            current: Vec::with_capacity(len),
            started: false,
            done: alphabet.is_empty() && len > 0,
        }
    }

    /// Number of candidates, `None` on overflow
    pub fn total(alphabet_len: usize, len: usize) -> Option<u64> {
        (alphabet_len as u64).checked_pow(u32::try_from(len).ok()?)
    }

    /// Advance and borrow the next candidate without allocating
    pub fn next_candidate(&mut self) -> Option<&[u8]> {
        if self.done {
            return None;
        }

        if self.started {
            // Odometer increment from the last position
            let mut pos = self.digits.len();
            loop {
                if pos == 0 {
                    self.done = true;
                    return None;
                }
                pos -= 1;
                self.digits[pos] += 1;
                if self.digits[pos] < self.alphabet.len() {
                    break;
                }
                self.digits[pos] = 0;
            }
        }
        self.started = true;

        self.current.clear();
        self.current
            .extend(self.digits.iter().map(|&digit| self.alphabet[digit]));
        Some(&self.current)
    }
}

impl Iterator for Candidates<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.next_candidate().map(<[u8]>::to_vec)
    }
}

fn padded_bytes(message: &[u8]) -> Option<[u8; 64]> {
    if message.len() > MAX_MESSAGE_LEN {
        return None;
    }
    let mut bytes = [0u8; 64];
    bytes[..message.len()].copy_from_slice(message);
    bytes[message.len()] = 0x80;
    Some(bytes)
}

/// Pack `message` the way the batch kernel reads it: bytes in memory order,
/// with the big-endian bit length stored in the last word.
pub fn pack_block(message: &[u8]) -> Option<Block> {
    let bytes = padded_bytes(message)?;
    let mut block = [0u32; 16];
    for (word, chunk) in block.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    block[15] = ((message.len() * 8) as u32).swap_bytes();
    Some(block)
}

/// Pack `message` as big-endian message words, ready for the compression loop
pub fn pack_block_be(message: &[u8]) -> Option<Block> {
    let bytes = padded_bytes(message)?;
    let mut block = [0u32; 16];
    for (word, chunk) in block.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    block[15] = (message.len() * 8) as u32;
    Some(block)
}

/// Recover the first `len` message bytes from a block built by [`pack_block`]
pub fn unpack_message(block: &Block, len: usize) -> Vec<u8> {
    block
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .take(len.min(MAX_MESSAGE_LEN))
        .collect()
}

/// SHA-256 state words; ordering is word-by-word, most significant first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u32; 8]);

impl Digest {
    pub const MAX: Digest = Digest([u32::MAX; 8]);

    pub fn from_words(words: &[u32]) -> Self {
        let mut digest = [0u32; 8];
        digest.copy_from_slice(&words[..8]);
        Digest(digest)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.0) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for word in self.0 {
            write!(f, "{:08x}", word)?;
        }
        Ok(())
    }
}

/// Hashes batches of packed blocks
pub trait BatchHasher {
    /// Largest batch `hash_batch` accepts
    fn capacity(&self) -> usize;

    /// One digest per block, in order
    fn hash_batch(&mut self, blocks: &[Block]) -> Result<Vec<Digest>>;
}

/// Best message found so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Found {
    pub message: String,
    pub digest: Digest,
}

#[derive(Debug, Default)]
pub struct SearchReport {
    pub best: Option<Found>,
    pub hashes: u64,
    pub batches: usize,
    /// Best digest after each batch
    pub running_best: Vec<Digest>,
    pub elapsed: Duration,
}

impl SearchReport {
    pub fn mhashes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.hashes as f64 / secs / 1_000_000.0
    }
}

/// Batched best-digest search over every suffix of a given length
pub struct Miner<H> {
    hasher: H,
    alphabet: Vec<u8>,
}

impl<H: BatchHasher> Miner<H> {
    /// Repeated alphabet bytes are dropped, keeping first occurrences
    pub fn new(hasher: H, alphabet: impl Into<Vec<u8>>) -> Self {
        let alphabet = alphabet.into();
        let mut seen = [false; 256];
        let unique: Vec<u8> = alphabet
            .iter()
            .copied()
            .filter(|&byte| !std::mem::replace(&mut seen[byte as usize], true))
            .collect();
        if unique.len() != alphabet.len() {
            log::warn!(
                "Alphabet has {} repeated character(s), searching {} distinct",
                alphabet.len() - unique.len(),
                unique.len()
            );
        }

        Self {
            hasher,
            alphabet: unique,
        }
    }

    pub fn alphabet(&self) -> &[u8] {
        &self.alphabet
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    pub fn search(&mut self, prefix: &[u8], nonce_len: usize) -> Result<SearchReport> {
        let message_len = prefix.len() + nonce_len;
        if message_len > MAX_MESSAGE_LEN {
            bail!(
                "message of {} bytes does not fit one block (max {})",
                message_len,
                MAX_MESSAGE_LEN
            );
        }
        let capacity = self.hasher.capacity();
        if capacity == 0 {
            bail!("hasher has no batch capacity");
        }

        log::info!(
            "Searching {} candidates ({} chars, suffix length {}, batch {})",
            Candidates::total(self.alphabet.len(), nonce_len).unwrap_or(u64::MAX),
            self.alphabet.len(),
            nonce_len,
            capacity
        );

        let start = Instant::now();
        let mut report = SearchReport::default();
        let mut blocks = Vec::with_capacity(capacity);
        let mut message = prefix.to_vec();

        let hasher = &mut self.hasher;
        let mut candidates = Candidates::new(&self.alphabet, nonce_len);
        while let Some(suffix) = candidates.next_candidate() {
            message.truncate(prefix.len());
            message.extend_from_slice(suffix);
            blocks.push(pack_block(&message).context("message does not fit one block")?);

            if blocks.len() == capacity {
                flush(hasher, &mut blocks, message_len, &mut report)?;
            }
        }
        flush(hasher, &mut blocks, message_len, &mut report)?;

        report.elapsed = start.elapsed();
        Ok(report)
    }
}

fn flush<H: BatchHasher>(
    hasher: &mut H,
    blocks: &mut Vec<Block>,
    message_len: usize,
    report: &mut SearchReport,
) -> Result<()> {
    if blocks.is_empty() {
        return Ok(());
    }

    let digests = hasher.hash_batch(blocks)?;
    if digests.len() < blocks.len() {
        bail!(
            "hasher returned {} digests for {} blocks",
            digests.len(),
            blocks.len()
        );
    }

    for (block, digest) in blocks.iter().zip(&digests) {
        let improves = report
            .best
            .as_ref()
            .map_or(true, |best| *digest < best.digest);
        if improves {
            let message = String::from_utf8_lossy(&unpack_message(block, message_len)).into_owned();
            log::info!("{}: {}", message, digest);
            report.best = Some(Found {
                message,
                digest: *digest,
            });
        }
    }

    report.hashes += blocks.len() as u64;
    report.batches += 1;
    if let Some(best) = &report.best {
        report.running_best.push(best.digest);
    }
    blocks.clear();
    Ok(())
}

/// Storage for one batch: 16 input words and 8 digest words per candidate
pub struct MinerBuffers<'d> {
    pub state: Buffer<'d>,
    pub data: Buffer<'d>,
    capacity: usize,
}

impl<'d> MinerBuffers<'d> {
    pub fn new(device: &'d Device<'d>, capacity: usize) -> backend::Result<Self> {
        let capacity_bytes = capacity as u64;
        Ok(Self {
            state: Buffer::new(device, capacity_bytes * std::mem::size_of::<Digest>() as u64)?,
            data: Buffer::new(device, capacity_bytes * std::mem::size_of::<Block>() as u64)?,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// [`BatchHasher`] running the batch SHA-256 kernel on a device
pub struct GpuHasher<'a> {
    program: Program<'a>,
    buffers: &'a MinerBuffers<'a>,
}

impl<'a> GpuHasher<'a> {
    pub fn new(
        device: &'a Device<'a>,
        shader: impl AsRef<Path>,
        buffers: &'a MinerBuffers<'a>,
    ) -> backend::Result<Self> {
        let mut program = Program::new(device, shader)?;
        program.bind(&[&buffers.state, &buffers.data])?;

        Ok(Self { program, buffers })
    }
}

impl BatchHasher for GpuHasher<'_> {
    fn capacity(&self) -> usize {
        self.buffers.capacity()
    }

    fn hash_batch(&mut self, blocks: &[Block]) -> Result<Vec<Digest>> {
        if blocks.len() > self.capacity() {
            bail!(
                "batch of {} exceeds capacity {}",
                blocks.len(),
                self.capacity()
            );
        }

        {
            let mut data = self.buffers.data.map()?;
            let words: &[u32] = bytemuck::cast_slice(blocks);
            data.as_mut_slice::<u32>()[..words.len()].copy_from_slice(words);
        }

        self.program.dispatch(miner_workgroups(blocks.len()), 1, 1)?;

        let state = self.buffers.state.map()?;
        let words = &state.as_slice::<u32>()[..blocks.len() * 8];
        Ok(words.chunks_exact(8).map(Digest::from_words).collect())
    }
}
