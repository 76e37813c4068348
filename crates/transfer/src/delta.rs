//! Binary delta patches.
//!
//! Wire format (integers little-endian):
//!
//! ```text
//! "RSDP" | version u8 | target_len u64 | sha256(target) [32]
//! op*:  0x01 offset u64 len u64      copy from baseline
//!       0x02 len u64 bytes[len]      insert literal bytes
//! ```
//!
//! Producers build patches with [`compute_delta`]; receivers apply them to
//! their existing copy of the file during finalization.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::TransferError;

const MAGIC: &[u8; 4] = b"RSDP";
const VERSION: u8 = 1;
const OP_COPY: u8 = 0x01;
const OP_INSERT: u8 = 0x02;
const HEADER_LEN: usize = 4 + 1 + 8 + 32;

/// One instruction of a [`DeltaPatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOp {
    Copy { offset: u64, len: u64 },
    Insert(Vec<u8>),
}

/// Parsed patch turning a baseline into a target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPatch {
    target_len: u64,
    digest: [u8; 32],
    ops: Vec<DeltaOp>,
}

impl DeltaPatch {
    pub fn target_len(&self) -> u64 {
        self.target_len
    }

    pub fn ops(&self) -> &[DeltaOp] {
        &self.ops
    }

    /// Hex SHA-256 of the expected output.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, TransferError> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(TransferError::InvalidDelta("missing RSDP header".into()));
        }
        if bytes[4] != VERSION {
            return Err(TransferError::InvalidDelta(format!(
                "unsupported version {}",
                bytes[4]
            )));
        }
        let mut cursor = Reader {
            bytes,
            pos: 5,
        };
        let target_len = cursor.u64()?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(cursor.take(32)?);

        let mut ops = Vec::new();
        while !cursor.is_empty() {
            match cursor.u8()? {
                OP_COPY => {
                    let offset = cursor.u64()?;
                    let len = cursor.u64()?;
                    ops.push(DeltaOp::Copy { offset, len });
                }
                OP_INSERT => {
                    let len = usize::try_from(cursor.u64()?)
                        .map_err(|_| TransferError::InvalidDelta("insert too large".into()))?;
                    ops.push(DeltaOp::Insert(cursor.take(len)?.to_vec()));
                }
                other => {
                    return Err(TransferError::InvalidDelta(format!(
                        "unknown op 0x{other:02x}"
                    )));
                }
            }
        }

        Ok(Self {
            target_len,
            digest,
            ops,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.ops.len() * 17);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&self.target_len.to_le_bytes());
        out.extend_from_slice(&self.digest);
        for op in &self.ops {
            match op {
                DeltaOp::Copy { offset, len } => {
                    out.push(OP_COPY);
                    out.extend_from_slice(&offset.to_le_bytes());
                    out.extend_from_slice(&len.to_le_bytes());
                }
                DeltaOp::Insert(data) => {
                    out.push(OP_INSERT);
                    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
                    out.extend_from_slice(data);
                }
            }
        }
        out
    }

    /// Rebuilds the target from `baseline`, checking bounds, length and
    /// digest.
    ///
    /// Every op is resolved before any output is allocated, so the header's
    /// declared length is only trusted once the ops add up to it.
    pub fn apply(&self, baseline: &[u8]) -> Result<Vec<u8>, TransferError> {
        let mut pieces = Vec::with_capacity(self.ops.len());
        let mut total: u64 = 0;
        for op in &self.ops {
            let piece = match op {
                DeltaOp::Copy { offset, len } => {
                    let start = usize::try_from(*offset).ok();
                    let end = start
                        .zip(usize::try_from(*len).ok())
                        .and_then(|(s, l)| s.checked_add(l));
                    match (start, end) {
                        (Some(s), Some(e)) if e <= baseline.len() => &baseline[s..e],
                        _ => {
                            return Err(TransferError::InvalidDelta(format!(
                                "copy {offset}+{len} outside baseline of {} bytes",
                                baseline.len()
                            )));
                        }
                    }
                }
                DeltaOp::Insert(data) => data.as_slice(),
            };
            total = total
                .checked_add(piece.len() as u64)
                .filter(|&t| t <= self.target_len)
                .ok_or_else(|| TransferError::InvalidDelta("output exceeds target length".into()))?;
            pieces.push(piece);
        }
        if total != self.target_len {
            return Err(TransferError::InvalidDelta(format!(
                "ops produce {total} bytes, header declares {}",
                self.target_len
            )));
        }

        let mut out = Vec::new();
        let capacity = usize::try_from(total)
            .map_err(|_| TransferError::InvalidDelta("target too large".into()))?;
        out.try_reserve_exact(capacity)
            .map_err(|e| TransferError::InvalidDelta(format!("cannot allocate target: {e}")))?;
        for piece in pieces {
            out.extend_from_slice(piece);
        }

        let digest: [u8; 32] = Sha256::digest(&out).into();
        if digest != self.digest {
            return Err(TransferError::InvalidDelta(format!(
                "digest mismatch: expected {}, got {}",
                self.digest_hex(),
                hex::encode(digest)
            )));
        }
        Ok(out)
    }
}

/// Convenience wrapper: parses `patch` and applies it to `baseline`.
pub fn apply_delta(baseline: &[u8], patch: &[u8]) -> Result<Vec<u8>, TransferError> {
    DeltaPatch::parse(patch)?.apply(baseline)
}

/// Builds a patch turning `baseline` into `target`, matching baseline
/// blocks of `block_size` bytes anywhere in the target.
pub fn compute_delta(baseline: &[u8], target: &[u8], block_size: usize) -> DeltaPatch {
    let bs = block_size.max(1);
    let mut index: HashMap<u32, Vec<usize>> = HashMap::new();
    if baseline.len() >= bs {
        for offset in (0..=baseline.len() - bs).step_by(bs) {
            let weak = Rolling::new(&baseline[offset..offset + bs]).digest();
            index.entry(weak).or_default().push(offset);
        }
    }

    let mut ops = Vec::new();
    let mut literal = Vec::new();
    let mut i = 0;
    let mut rolling = (target.len() >= bs).then(|| Rolling::new(&target[..bs]));

    while i + bs <= target.len() {
        let Some(window) = rolling.as_mut() else {
            break;
        };
        let found = index.get(&window.digest()).and_then(|candidates| {
            candidates
                .iter()
                .copied()
                .find(|&off| baseline[off..off + bs] == target[i..i + bs])
        });

        match found {
            Some(offset) => {
                let mut len = bs;
                while i + len < target.len()
                    && offset + len < baseline.len()
                    && target[i + len] == baseline[offset + len]
                {
                    len += 1;
                }
                flush_literal(&mut ops, &mut literal);
                push_copy(&mut ops, offset as u64, len as u64);
                i += len;
                rolling = (i + bs <= target.len()).then(|| Rolling::new(&target[i..i + bs]));
            }
            None => {
                literal.push(target[i]);
                if i + bs < target.len() {
                    window.roll(target[i], target[i + bs]);
                }
                i += 1;
            }
        }
    }
    literal.extend_from_slice(&target[i.min(target.len())..]);
    flush_literal(&mut ops, &mut literal);

    DeltaPatch {
        target_len: target.len() as u64,
        digest: Sha256::digest(target).into(),
        ops,
    }
}

fn flush_literal(ops: &mut Vec<DeltaOp>, literal: &mut Vec<u8>) {
    if !literal.is_empty() {
        ops.push(DeltaOp::Insert(std::mem::take(literal)));
    }
}

/// Appends a copy, merging it into the previous one when contiguous.
fn push_copy(ops: &mut Vec<DeltaOp>, offset: u64, len: u64) {
    if let Some(DeltaOp::Copy {
        offset: prev_offset,
        len: prev_len,
    }) = ops.last_mut()
    {
        if *prev_offset + *prev_len == offset {
            *prev_len += len;
            return;
        }
    }
    ops.push(DeltaOp::Copy { offset, len });
}

/// rsync-style weak rolling checksum.
struct Rolling {
    a: u32,
    b: u32,
    len: u32,
}

impl Rolling {
    fn new(block: &[u8]) -> Self {
        let len = block.len() as u32;
        let mut a = 0u32;
        let mut b = 0u32;
        for (i, &byte) in block.iter().enumerate() {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add((len - i as u32).wrapping_mul(byte as u32));
        }
        Self { a, b, len }
    }

    fn roll(&mut self, out: u8, inn: u8) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(inn as u32);
        self.b = self
            .b
            .wrapping_sub(self.len.wrapping_mul(out as u32))
            .wrapping_add(self.a);
    }

    fn digest(&self) -> u32 {
        (self.a & 0xffff) | (self.b << 16)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TransferError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| TransferError::InvalidDelta("truncated patch".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, TransferError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, TransferError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    fn random(len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut v);
        v
    }

    #[test]
    fn rolling_matches_fresh_checksum() {
        let data = random(64);
        let mut r = Rolling::new(&data[0..16]);
        for i in 0..48 {
            r.roll(data[i], data[i + 16]);
            assert_eq!(r.digest(), Rolling::new(&data[i + 1..i + 17]).digest());
        }
    }

    #[test]
    fn small_edit_reuses_baseline() {
        let baseline = random(64 * 1024);
        let mut target = baseline.clone();
        target[30_000..30_010].copy_from_slice(b"0123456789");
        target.extend_from_slice(b"appended tail");

        let patch = compute_delta(&baseline, &target, 512);
        assert_eq!(patch.apply(&baseline).unwrap(), target);
        let inserted: usize = patch
            .ops()
            .iter()
            .map(|op| match op {
                DeltaOp::Insert(d) => d.len(),
                DeltaOp::Copy { .. } => 0,
            })
            .sum();
        assert!(inserted < 2048, "inserted {inserted} literal bytes");
    }

    #[test]
    fn shifted_content_is_found() {
        let baseline = random(8 * 1024);
        let mut target = random(100);
        target.extend_from_slice(&baseline);
        let patch = compute_delta(&baseline, &target, 256);
        assert_eq!(patch.apply(&baseline).unwrap(), target);
        assert!(patch.ops().len() <= 3);
    }

    #[test]
    fn degenerate_inputs() {
        for (baseline, target) in [
            (Vec::new(), Vec::new()),
            (Vec::new(), random(100)),
            (random(100), Vec::new()),
            (random(10), random(3)),
        ] {
            let patch = compute_delta(&baseline, &target, 16);
            assert_eq!(patch.apply(&baseline).unwrap(), target);
        }
    }

    #[test]
    fn random_mutations_roundtrip_through_wire_format() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let baseline = random(rng.gen_range(0..5000));
            let mut target = baseline.clone();
            for _ in 0..rng.gen_range(0..5) {
                if target.is_empty() {
                    break;
                }
                let at = rng.gen_range(0..target.len());
                target[at] = target[at].wrapping_add(1);
            }
            let block = rng.gen_range(1..128);
            let bytes = compute_delta(&baseline, &target, block).encode();
            assert_eq!(apply_delta(&baseline, &bytes).unwrap(), target);
        }
    }

    #[test]
    fn wrong_baseline_fails_digest() {
        let baseline = random(4096);
        let mut target = baseline.clone();
        target[0] ^= 1;
        let patch = compute_delta(&baseline, &target, 64);
        let mut other = baseline.clone();
        other[2000] ^= 1;
        let err = patch.apply(&other).unwrap_err();
        assert!(matches!(err, TransferError::InvalidDelta(ref m) if m.contains("digest")));
    }

    #[test]
    fn copy_outside_baseline_is_rejected() {
        let patch = DeltaPatch {
            target_len: 10,
            digest: [0; 32],
            ops: vec![DeltaOp::Copy { offset: 5, len: 10 }],
        };
        assert!(matches!(
            patch.apply(&[0u8; 8]),
            Err(TransferError::InvalidDelta(_))
        ));
        let patch = DeltaPatch {
            target_len: 1,
            digest: [0; 32],
            ops: vec![DeltaOp::Copy { offset: u64::MAX, len: 2 }],
        };
        assert!(patch.apply(&[0u8; 8]).is_err());
    }

    #[test]
    fn huge_declared_length_is_rejected_without_allocating() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.push(VERSION);
        bytes.extend_from_slice(&(1u64 << 40).to_le_bytes());
        bytes.extend_from_slice(&[0u8; 32]);
        let err = apply_delta(b"base", &bytes).unwrap_err();
        assert!(matches!(err, TransferError::InvalidDelta(ref m) if m.contains("header declares")));

        bytes.push(OP_COPY);
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&4u64.to_le_bytes());
        assert!(matches!(
            apply_delta(b"base", &bytes),
            Err(TransferError::InvalidDelta(_))
        ));
    }

    #[test]
    fn ops_longer_than_header_are_rejected() {
        let patch = DeltaPatch {
            target_len: 2,
            digest: [0; 32],
            ops: vec![DeltaOp::Insert(b"abc".to_vec())],
        };
        let err = patch.apply(b"").unwrap_err();
        assert!(matches!(err, TransferError::InvalidDelta(ref m) if m.contains("exceeds")));
    }

    #[test]
    fn malformed_patches_are_rejected() {
        assert!(DeltaPatch::parse(b"nope").is_err());
        let mut bytes = compute_delta(b"abc", b"abcd", 2).encode();
        bytes[4] = 9;
        assert!(DeltaPatch::parse(&bytes).is_err());

        let bytes = compute_delta(b"", b"hello", 2).encode();
        assert!(DeltaPatch::parse(&bytes[..bytes.len() - 1]).is_err());

        let mut bytes = compute_delta(b"", b"", 2).encode();
        bytes.push(0x7f);
        assert!(matches!(
            DeltaPatch::parse(&bytes),
            Err(TransferError::InvalidDelta(ref m)) if m.contains("0x7f")
        ));
    }
}
