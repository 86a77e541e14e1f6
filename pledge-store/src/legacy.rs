//! Legacy hash-file coherence check
//!
//! Older hosts still carry databases in the legacy hash-file format: a
//! 256-byte header, a bucket array of record offsets, then a record
//! section of data and free blocks. Diagnosis sweeps the bucket list
//! recording every declared offset, then sweeps the record section
//! verifying that every live record is referenced by exactly one bucket
//! and that no bucket points into a freed region. The two asymmetric
//! counts are the report.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use pledge_core::StoreError;
use tracing::{debug, warn};

/// Magic byte opening a live data block.
const MAGIC_DATA_BLOCK: u8 = 0xc8;
/// Magic byte opening a free block.
const MAGIC_FREE_BLOCK: u8 = 0xb0;

const HEADER_SIZE: usize = 256;
const OFF_ALIGNMENT_POW: usize = 34;
const OFF_OPTIONS: usize = 36;
const OFF_BUCKET_COUNT: usize = 40;
const OFF_RECORD_COUNT: usize = 48;
const OFF_RECORD_OFFSET: usize = 64;

/// Environment knob for the legacy backend's compaction probability,
/// retained for backward compatibility of on-disk side effects. Modern
/// backends ignore it; only the value parsing is kept so the knob keeps
/// meaning what it always meant.
pub const ENV_OPTIMIZE_PERCENT: &str = "TCDB_OPTIMIZE_PERCENT";

/// Read the legacy compaction probability: clamped to 0..=100, defaulting
/// to 1 percent when unset or unparseable.
pub fn legacy_optimize_percent() -> u32 {
    match std::env::var(ENV_OPTIMIZE_PERCENT) {
        Ok(v) => v.trim().parse::<i64>().map(|n| n.clamp(0, 100) as u32).unwrap_or(1),
        Err(_) => 1,
    }
}

/// Asymmetry report of a legacy-file sweep. A coherent file reports zero
/// on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegacyReport {
    /// Offsets listed in buckets with no record at them.
    pub buckets_without_records: u64,
    /// Live records no bucket points to.
    pub records_without_buckets: u64,
}

impl LegacyReport {
    pub fn is_coherent(&self) -> bool {
        self.buckets_without_records == 0 && self.records_without_buckets == 0
    }
}

struct LegacyHeader {
    bucket_count: u64,
    record_offset: u64,
    alignment_pow: u32,
    bytes_per: usize,
}

fn read_header(file: &mut std::fs::File) -> Result<LegacyHeader, StoreError> {
    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)?;

    let alignment_pow = header[OFF_ALIGNMENT_POW] as u32;
    let opts = header[OFF_OPTIONS];
    let bytes_per = if opts & 1 != 0 { 8 } else { 4 };

    let bucket_count = u64::from_le_bytes(
        header[OFF_BUCKET_COUNT..OFF_BUCKET_COUNT + 8]
            .try_into()
            .expect("slice length is eight"),
    );
    let record_count = u64::from_le_bytes(
        header[OFF_RECORD_COUNT..OFF_RECORD_COUNT + 8]
            .try_into()
            .expect("slice length is eight"),
    );
    let record_offset = u64::from_le_bytes(
        header[OFF_RECORD_OFFSET..OFF_RECORD_OFFSET + 8]
            .try_into()
            .expect("slice length is eight"),
    );

    debug!(
        bucket_count,
        record_count, record_offset, alignment_pow, bytes_per, "legacy header"
    );

    Ok(LegacyHeader {
        bucket_count,
        record_offset,
        alignment_pow,
        bytes_per,
    })
}

/// Read the variable-width integer encoding used for key and value sizes.
/// Returns `(value, bytes_consumed)`.
fn read_varint(file: &mut std::fs::File) -> Result<(u32, u64), StoreError> {
    let mut num: u64 = 0;
    let mut base: u64 = 1;
    let mut consumed = 0u64;

    loop {
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte)?;
        consumed += 1;
        let c = byte[0] as i8;
        if c >= 0 {
            num += c as u64 * base;
            break;
        }
        num += base * (-(c as i64 + 1)) as u64;
        base <<= 7;
    }

    Ok((num as u32, consumed))
}

fn read_offset_pointer(
    file: &mut std::fs::File,
    bytes_per: usize,
) -> Result<u64, StoreError> {
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf[..bytes_per])?;
    Ok(u64::from_le_bytes(buf))
}

/// Sweep the bucket list, collecting every declared record offset.
fn collect_bucket_offsets(
    file: &mut std::fs::File,
    header: &LegacyHeader,
) -> Result<HashSet<u64>, StoreError> {
    file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

    let mut declared = HashSet::new();
    for index in 0..header.bucket_count {
        let raw = read_offset_pointer(file, header.bytes_per)?;
        if raw > 0 {
            let offset = raw << header.alignment_pow;
            if !declared.insert(offset) {
                warn!(offset, index, "duplicate bucket offset");
            }
        }
    }
    debug!(count = declared.len(), "bucket offsets declared");
    Ok(declared)
}

/// Sweep the record section, removing matched offsets from `declared` and
/// counting records no bucket points to. Collision-chain pointers inside
/// data blocks declare further offsets, like buckets do.
fn sweep_records(
    file: &mut std::fs::File,
    header: &LegacyHeader,
    declared: &mut HashSet<u64>,
) -> Result<u64, StoreError> {
    let file_size = file.metadata()?.len();
    let mut offset = header.record_offset;
    let mut orphans = 0u64;
    let mut data_blocks = 0u64;
    let mut free_blocks = 0u64;

    while offset < file_size {
        file.seek(SeekFrom::Start(offset))?;
        let mut magic = [0u8; 1];
        if file.read_exact(&mut magic).is_err() {
            break;
        }

        match magic[0] {
            MAGIC_DATA_BLOCK => {
                let mut hash = [0u8; 1];
                file.read_exact(&mut hash)?;
                let left = read_offset_pointer(file, header.bytes_per)? << header.alignment_pow;
                let right = read_offset_pointer(file, header.bytes_per)? << header.alignment_pow;
                let mut pad = [0u8; 2];
                file.read_exact(&mut pad)?;
                let pad_size = u16::from_le_bytes(pad) as u64;
                let (key_size, key_varint_len) = read_varint(file)?;
                let (rec_size, rec_varint_len) = read_varint(file)?;

                let length = 1
                    + 1
                    + 2 * header.bytes_per as u64
                    + 2
                    + pad_size
                    + key_varint_len
                    + rec_varint_len
                    + key_size as u64
                    + rec_size as u64;

                if !declared.remove(&offset) {
                    orphans += 1;
                }
                if left > 0 {
                    declared.insert(left);
                }
                if right > 0 {
                    declared.insert(right);
                }

                data_blocks += 1;
                offset += length;
            }
            MAGIC_FREE_BLOCK => {
                let mut len_buf = [0u8; 4];
                file.read_exact(&mut len_buf)?;
                let length = 1 + 4 + u32::from_le_bytes(len_buf) as u64;
                free_blocks += 1;
                offset += length;
            }
            _ => {
                // Tolerate stray bytes between records the way the
                // original sweep does.
                offset += 1;
            }
        }
    }

    debug!(data_blocks, free_blocks, "record sweep complete");
    Ok(orphans)
}

/// Run the full coherence check against one legacy-format file.
pub fn check_legacy_file(path: &Path) -> Result<LegacyReport, StoreError> {
    let mut file = std::fs::File::open(path)?;
    let header = read_header(&mut file)?;
    let mut declared = collect_bucket_offsets(&mut file, &header)?;
    let records_without_buckets = sweep_records(&mut file, &header, &mut declared)?;

    let report = LegacyReport {
        buckets_without_records: declared.len() as u64,
        records_without_buckets,
    };
    if !report.is_coherent() {
        warn!(
            path = %path.display(),
            buckets_without_records = report.buckets_without_records,
            records_without_buckets = report.records_without_buckets,
            "legacy database incoherent"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Build a minimal legacy file: header + bucket array + records.
    /// `alignment_pow` is zero so offsets are literal.
    fn build_legacy_file(
        dir: &Path,
        buckets: &[u64],
        records: &[(u8, Vec<u8>)],
    ) -> std::path::PathBuf {
        let path = dir.join("legacy.tcdb");
        let mut header = vec![0u8; HEADER_SIZE];
        header[OFF_ALIGNMENT_POW] = 0;
        header[OFF_OPTIONS] = 1; // 8-byte bucket pointers
        header[OFF_BUCKET_COUNT..OFF_BUCKET_COUNT + 8]
            .copy_from_slice(&(buckets.len() as u64).to_le_bytes());
        let record_offset = (HEADER_SIZE + buckets.len() * 8) as u64;
        header[OFF_RECORD_COUNT..OFF_RECORD_COUNT + 8]
            .copy_from_slice(&(records.len() as u64).to_le_bytes());
        header[OFF_RECORD_OFFSET..OFF_RECORD_OFFSET + 8]
            .copy_from_slice(&record_offset.to_le_bytes());

        let mut out = header;
        for b in buckets {
            out.extend_from_slice(&b.to_le_bytes());
        }
        for (magic, body) in records {
            out.push(*magic);
            out.extend_from_slice(body);
        }

        let mut f = std::fs::File::create(&path).expect("create should succeed");
        f.write_all(&out).expect("write should succeed");
        path
    }

    /// A data block with empty key and value: hash byte, two 8-byte chain
    /// pointers, two pad bytes, two zero varints.
    fn empty_data_block() -> Vec<u8> {
        let mut body = vec![0u8; 1 + 8 + 8 + 2];
        body.extend_from_slice(&[0, 0]); // key_size = 0, rec_size = 0
        body
    }

    #[test]
    fn test_coherent_file() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let record_offset = (HEADER_SIZE + 8) as u64;
        let path = build_legacy_file(
            dir.path(),
            &[record_offset],
            &[(MAGIC_DATA_BLOCK, empty_data_block())],
        );
        let report = check_legacy_file(&path).expect("check should succeed");
        assert!(report.is_coherent(), "report: {report:?}");
    }

    #[test]
    fn test_bucket_without_record() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        // One bucket pointing past the end of the file.
        let path = build_legacy_file(dir.path(), &[0xffff], &[]);
        let report = check_legacy_file(&path).expect("check should succeed");
        assert_eq!(report.buckets_without_records, 1);
        assert_eq!(report.records_without_buckets, 0);
    }

    #[test]
    fn test_record_without_bucket() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        // No buckets, one live record.
        let path =
            build_legacy_file(dir.path(), &[], &[(MAGIC_DATA_BLOCK, empty_data_block())]);
        let report = check_legacy_file(&path).expect("check should succeed");
        assert_eq!(report.buckets_without_records, 0);
        assert_eq!(report.records_without_buckets, 1);
    }

    #[test]
    fn test_free_blocks_are_not_orphans() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        // A free block of four payload bytes.
        let mut free_body = 4u32.to_le_bytes().to_vec();
        free_body.extend_from_slice(&[0u8; 4]);
        let path = build_legacy_file(dir.path(), &[], &[(MAGIC_FREE_BLOCK, free_body)]);
        let report = check_legacy_file(&path).expect("check should succeed");
        assert!(report.is_coherent());
    }

    #[test]
    fn test_truncated_header() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let path = dir.path().join("short.tcdb");
        std::fs::write(&path, [0u8; 16]).expect("write should succeed");
        assert!(check_legacy_file(&path).is_err());
    }

    #[test]
    fn test_optimize_percent_default() {
        // Unset in the test environment.
        std::env::remove_var(ENV_OPTIMIZE_PERCENT);
        assert_eq!(legacy_optimize_percent(), 1);
    }
}
