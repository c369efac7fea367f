//! Writing received files to disk.
//!
//! File names come from the relay and are untrusted: only a plain final path
//! component is accepted. Files are written to `<name>.part` and renamed once
//! every chunk is on disk, so a finished name is never a partial file.

use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use relaydrop_client::{ChunkStore, RoomCode, write_stored_file};
use relaydrop_core::FileDescriptor;

use crate::CliError;

/// `name` if it is a single, normal path component.
pub fn safe_file_name(name: &str) -> Result<&str, CliError> {
    let path = Path::new(name);
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && path.file_name().is_some_and(|f| f == name);

    if plain { Ok(name) } else { Err(CliError::UnsafeFileName(name.to_string())) }
}

/// Assemble `file` from `store` into `dir`. Returns the final path.
pub fn write_file<S: ChunkStore>(
    store: &S,
    room: &RoomCode,
    file: &FileDescriptor,
    dir: &Path,
) -> Result<PathBuf, CliError> {
    let name = safe_file_name(&file.name)?;
    let target = dir.join(name);
    let partial = dir.join(format!("{name}.part"));

    let mut out = BufWriter::new(File::create(&partial)?);
    let written = match write_stored_file(store, room, file, &mut out) {
        Ok(written) => written,
        Err(e) => {
            drop(out);
            let _ = fs::remove_file(&partial);
            return Err(e.into());
        },
    };
    drop(out);
    fs::rename(&partial, &target)?;

    tracing::info!(file_index = file.index, bytes = written, path = %target.display(), "file written");
    Ok(target)
}
