//! Binary codec for mutation delta payloads.
//!
//! A delta is the opaque blob a mutated extent contributes to its commit
//! record: the byte runs that changed between the committed instance and
//! its shadow. The journal stores the blob verbatim; replay decodes it and
//! patches the on-disk image forward.
//!
//! # Format
//!
//! ```text
//! +------------------+---------+
//! | magic            | 4 bytes | = 0x5344_4C54 ("SDLT")
//! | version          | 2 bytes | = 1
//! | run_count        | 2 bytes |
//! | target_len       | 4 bytes | length of the buffer being patched
//! +------------------+---------+
//! | For each run:              |
//! |   offset         | 4 bytes |
//! |   len            | 4 bytes |
//! |   bytes          | N bytes |
//! +------------------+---------+
//! | payload_crc      | 4 bytes | CRC32c of everything before this field
//! +------------------+---------+
//! ```
//!
//! # Invariants
//!
//! - Runs are ascending by offset and non-overlapping.
//! - Applying a delta to the buffer it was computed against yields the
//!   shadow's bytes exactly.
//! - A flipped bit anywhere in the blob is detected by the trailing CRC.

use silt_error::{Result, SiltError};
use silt_types::{read_le_u16, read_le_u32, usize_to_u32, WireError};

const DELTA_MAGIC: u32 = 0x5344_4C54;
const DELTA_VERSION: u16 = 1;
const DELTA_HEADER_SIZE: usize = 12;

/// Differing runs separated by no more than this many equal bytes are
/// merged into one run; the per-run header would cost more than the padding.
const RUN_MERGE_GAP: usize = 8;

/// A contiguous patched range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRun {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// Decoded mutation delta.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeltaPayload {
    target_len: u32,
    runs: Vec<PatchRun>,
}

impl DeltaPayload {
    /// Diff `prev` against `next`, producing the runs that advance `prev`
    /// to `next`. Both buffers must be the same length; copy-on-write
    /// shadows never change an extent's length.
    #[must_use]
    pub fn compute(prev: &[u8], next: &[u8]) -> Self {
        assert_eq!(
            prev.len(),
            next.len(),
            "delta computed across different lengths"
        );
        let mut runs: Vec<PatchRun> = Vec::new();
        let mut pos = 0_usize;
        while pos < next.len() {
            if prev[pos] == next[pos] {
                pos += 1;
                continue;
            }
            let start = pos;
            let mut end = pos + 1;
            let mut gap = 0_usize;
            while end < next.len() && gap <= RUN_MERGE_GAP {
                if prev[end] == next[end] {
                    gap += 1;
                } else {
                    gap = 0;
                }
                end += 1;
            }
            let end = end - gap;
            runs.push(PatchRun {
                offset: u32::try_from(start).expect("extent offsets fit u32"),
                bytes: next[start..end].to_vec(),
            });
            pos = end;
        }
        Self {
            target_len: u32::try_from(next.len()).expect("extent lengths fit u32"),
            runs,
        }
    }

    #[must_use]
    pub fn runs(&self) -> &[PatchRun] {
        &self.runs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Patch `buf` forward. The buffer length must match the length the
    /// delta was computed for.
    pub fn apply(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.target_len as usize {
            return Err(SiltError::Format(format!(
                "delta target length mismatch: buf={} delta={}",
                buf.len(),
                self.target_len
            )));
        }
        for run in &self.runs {
            let start = run.offset as usize;
            let end = start
                .checked_add(run.bytes.len())
                .ok_or_else(|| SiltError::Format("delta run overflows usize".to_owned()))?;
            if end > buf.len() {
                return Err(SiltError::Format(format!(
                    "delta run out of bounds: offset={} len={} target={}",
                    run.offset,
                    run.bytes.len(),
                    buf.len()
                )));
            }
            buf[start..end].copy_from_slice(&run.bytes);
        }
        Ok(())
    }

    /// Encode to the wire format, including the trailing CRC.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body_len = DELTA_HEADER_SIZE;
        for run in &self.runs {
            body_len = body_len
                .checked_add(8)
                .and_then(|len| len.checked_add(run.bytes.len()))
                .ok_or_else(|| SiltError::Format("delta payload size overflow".to_owned()))?;
        }
        let total = body_len
            .checked_add(4)
            .ok_or_else(|| SiltError::Format("delta payload size overflow".to_owned()))?;

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&DELTA_MAGIC.to_le_bytes());
        buf.extend_from_slice(&DELTA_VERSION.to_le_bytes());
        let run_count = u16::try_from(self.runs.len())
            .map_err(|_| SiltError::Format("too many runs in delta".to_owned()))?;
        buf.extend_from_slice(&run_count.to_le_bytes());
        buf.extend_from_slice(&self.target_len.to_le_bytes());
        for run in &self.runs {
            buf.extend_from_slice(&run.offset.to_le_bytes());
            let len = usize_to_u32(run.bytes.len(), "run_len")
                .map_err(|err| SiltError::Format(err.to_string()))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&run.bytes);
        }
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decode from the wire format, verifying the trailing CRC.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire = |err: WireError| SiltError::Format(format!("delta decode: {err}"));

        if bytes.len() < DELTA_HEADER_SIZE + 4 {
            return Err(SiltError::Format(format!(
                "delta blob too short: {} bytes",
                bytes.len()
            )));
        }
        let body = &bytes[..bytes.len() - 4];
        let stored_crc = read_le_u32(bytes, bytes.len() - 4).map_err(wire)?;
        let computed = crc32c::crc32c(body);
        if stored_crc != computed {
            return Err(SiltError::Format(format!(
                "delta CRC mismatch: stored={stored_crc:#010x} computed={computed:#010x}"
            )));
        }

        let magic = read_le_u32(body, 0).map_err(wire)?;
        if magic != DELTA_MAGIC {
            return Err(SiltError::Format(format!(
                "delta magic mismatch: {magic:#010x}"
            )));
        }
        let version = read_le_u16(body, 4).map_err(wire)?;
        if version != DELTA_VERSION {
            return Err(SiltError::Format(format!(
                "unsupported delta version: {version}"
            )));
        }
        let run_count = read_le_u16(body, 6).map_err(wire)?;
        let target_len = read_le_u32(body, 8).map_err(wire)?;

        let mut runs = Vec::with_capacity(usize::from(run_count));
        let mut offset = DELTA_HEADER_SIZE;
        let mut last_end = 0_u64;
        for _ in 0..run_count {
            let run_offset = read_le_u32(body, offset).map_err(wire)?;
            let run_len = read_le_u32(body, offset + 4).map_err(wire)?;
            offset += 8;
            let end = offset
                .checked_add(run_len as usize)
                .ok_or_else(|| SiltError::Format("delta run length overflow".to_owned()))?;
            if end > body.len() {
                return Err(SiltError::Format(
                    "delta run extends past payload".to_owned(),
                ));
            }
            if u64::from(run_offset) < last_end {
                return Err(SiltError::Format(
                    "delta runs not ascending".to_owned(),
                ));
            }
            last_end = u64::from(run_offset) + u64::from(run_len);
            runs.push(PatchRun {
                offset: run_offset,
                bytes: body[offset..end].to_vec(),
            });
            offset = end;
        }
        if offset != body.len() {
            return Err(SiltError::Format(
                "trailing bytes after final delta run".to_owned(),
            ));
        }
        Ok(Self { target_len, runs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_then_apply_advances_prev_to_next() {
        let prev = vec![0_u8; 4096];
        let mut next = prev.clone();
        next[10] = 1;
        next[11] = 2;
        next[4000] = 0xFF;

        let delta = DeltaPayload::compute(&prev, &next);
        assert_eq!(delta.runs().len(), 2);

        let mut buf = prev;
        delta.apply(&mut buf).expect("apply");
        assert_eq!(buf, next);
    }

    #[test]
    fn nearby_changes_merge_into_one_run() {
        let prev = vec![0_u8; 64];
        let mut next = prev.clone();
        next[10] = 1;
        next[14] = 2; // 3 equal bytes between: below the merge gap

        let delta = DeltaPayload::compute(&prev, &next);
        assert_eq!(delta.runs().len(), 1);
        let mut buf = prev;
        delta.apply(&mut buf).expect("apply");
        assert_eq!(buf, next);
    }

    #[test]
    fn identical_buffers_produce_empty_delta() {
        let data = vec![7_u8; 1024];
        let delta = DeltaPayload::compute(&data, &data);
        assert!(delta.is_empty());
    }

    #[test]
    fn encode_decode_round_trip() {
        let prev = vec![0_u8; 4096];
        let mut next = prev.clone();
        for i in (0..4096).step_by(97) {
            next[i] = (i % 251) as u8;
        }
        let delta = DeltaPayload::compute(&prev, &next);
        let blob = delta.encode().expect("encode");
        let decoded = DeltaPayload::decode(&blob).expect("decode");
        assert_eq!(decoded, delta);
    }

    #[test]
    fn corruption_is_detected() {
        let prev = vec![0_u8; 128];
        let mut next = prev.clone();
        next[5] = 9;
        let mut blob = DeltaPayload::compute(&prev, &next).encode().expect("encode");
        let mid = blob.len() / 2;
        blob[mid] ^= 0x40;
        assert!(DeltaPayload::decode(&blob).is_err());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let prev = vec![0_u8; 128];
        let mut next = prev.clone();
        next[5] = 9;
        let blob = DeltaPayload::compute(&prev, &next).encode().expect("encode");
        assert!(DeltaPayload::decode(&blob[..blob.len() - 6]).is_err());
        assert!(DeltaPayload::decode(&[]).is_err());
    }

    #[test]
    fn apply_rejects_length_mismatch() {
        let prev = vec![0_u8; 64];
        let mut next = prev.clone();
        next[0] = 1;
        let delta = DeltaPayload::compute(&prev, &next);
        let mut wrong = vec![0_u8; 32];
        assert!(delta.apply(&mut wrong).is_err());
    }

    #[test]
    #[should_panic(expected = "different lengths")]
    fn compute_rejects_length_mismatch() {
        let _ = DeltaPayload::compute(&[0; 8], &[0; 16]);
    }
}
