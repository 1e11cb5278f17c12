//! Extra files: the JSON object of annotations stored next to each minidump.

use crate::{AnnotationTable, Error, dump};
use std::{
    io::Write as _,
    path::{Path, PathBuf},
};

/// Where to find the extra file to append to
#[derive(Clone, Debug)]
pub enum ExtraTarget {
    /// The extra file belonging to minidump `id` in `directory`
    ForId { directory: PathBuf, id: String },
    /// An extra file that has already been located
    File(PathBuf),
}

impl ExtraTarget {
    fn resolve(&self) -> PathBuf {
        match self {
            Self::ForId { directory, id } => dump::extra_file_for_id(directory, id),
            Self::File(path) => path.clone(),
        }
    }
}

/// Writes the annotations as the extra file at `path`, replacing any
/// previous contents
pub fn write_extra_file(path: &Path, annotations: &AnnotationTable) -> Result<(), Error> {
    // Write to the side and rename so readers never see a partial file
    let tmp = path.with_extension("extra.tmp");
    {
        let mut file = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
        serde_json::to_writer(&mut file, annotations)?;
        file.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads the annotations of an extra file
pub fn read_extra_file(path: &Path) -> Result<AnnotationTable, Error> {
    let contents = std::fs::read(path)?;
    Ok(serde_json::from_slice(&contents)?)
}

/// Merges `annotations` into an existing extra file, new values winning.
///
/// An extra file is only ever written for a minidump that exists, so the
/// target's minidump must be present. A missing extra file is created.
pub fn append_extra_data(target: &ExtraTarget, annotations: &AnnotationTable) -> Result<(), Error> {
    let path = target.resolve();
    let minidump = path.with_extension(dump::MINIDUMP_EXTENSION);
    if !minidump.exists() {
        return Err(Error::MissingDump(minidump));
    }

    let mut table = match read_extra_file(&path) {
        Ok(table) => table,
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => AnnotationTable::new(),
        Err(err) => return Err(err),
    };

    table.merge(annotations);
    write_extra_file(&path, &table)
}

/// Appends `name` to the comma separated `additional_minidumps` annotation of
/// the extra file
pub(crate) fn add_additional_minidump(extra: &Path, name: &str) -> Result<(), Error> {
    let mut table = if extra.exists() {
        read_extra_file(extra)?
    } else {
        AnnotationTable::new()
    };

    let names = match table.get(crate::keys::ADDITIONAL_MINIDUMPS) {
        Some(existing) if !existing.is_empty() => {
            if existing.split(',').any(|n| n == name) {
                return Ok(());
            }
            format!("{existing},{name}")
        }
        _ => name.to_owned(),
    };

    table.insert(crate::keys::ADDITIONAL_MINIDUMPS, names);
    write_extra_file(extra, &table)
}
