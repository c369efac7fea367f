//! Progress computation.
//!
//! Progress is a pure function of what the store holds at evaluation time.
//! Nothing here keeps a running counter.

use crate::manifest::{FileDescriptor, TransferManifest};

/// Percentage of `file` held, given `received` distinct chunks.
///
/// A zero-chunk file is 100% complete. `received` past the total clamps.
#[must_use]
pub fn file_progress(file: &FileDescriptor, received: u32) -> f64 {
    let total = file.total_chunks();
    if total == 0 {
        return 100.0;
    }

    f64::from(received.min(total)) / f64::from(total) * 100.0
}

/// Arithmetic mean of per-file progress over the whole manifest.
///
/// `received(file_index)` returns the chunks held for that file.
pub fn aggregate_progress(
    manifest: &TransferManifest,
    mut received: impl FnMut(u32) -> u32,
) -> f64 {
    if manifest.is_empty() {
        return 0.0;
    }

    let sum: f64 = manifest.files().iter().map(|f| file_progress(f, received(f.index))).sum();
    sum / manifest.len() as f64
}

/// Whether `received` covers every chunk of `file`.
#[must_use]
pub fn is_complete(file: &FileDescriptor, received: u32) -> bool {
    received >= file.total_chunks()
}

#[cfg(test)]
mod tests {
    use relaydrop_proto::payloads::room::FileSpec;

    use super::*;
    use crate::manifest::CHUNK_SIZE;

    fn manifest(sizes: &[u64]) -> TransferManifest {
        let specs: Vec<_> = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| FileSpec { name: format!("f{i}"), size: *size })
            .collect();
        TransferManifest::from_specs(&specs).unwrap()
    }

    #[test]
    fn per_file_percentage() {
        let m = manifest(&[CHUNK_SIZE * 4]);
        let file = m.file(0).unwrap();

        assert!((file_progress(file, 0) - 0.0).abs() < f64::EPSILON);
        assert!((file_progress(file, 1) - 25.0).abs() < f64::EPSILON);
        assert!((file_progress(file, 4) - 100.0).abs() < f64::EPSILON);
        assert!((file_progress(file, 9) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_file_is_complete() {
        let m = manifest(&[0]);
        let file = m.file(0).unwrap();

        assert!(is_complete(file, 0));
        assert!((file_progress(file, 0) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn aggregate_is_mean_over_files() {
        let m = manifest(&[CHUNK_SIZE * 2, CHUNK_SIZE * 4]);

        // 50% and 25%
        let progress = aggregate_progress(&m, |_| 1);
        assert!((progress - 37.5).abs() < 1e-9);
    }
}
