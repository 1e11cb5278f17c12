use crate::Error;
use std::{
    fs::File,
    path::{Path, PathBuf},
    time::SystemTime,
};

pub(crate) const MINIDUMP_EXTENSION: &str = "dmp";
pub(crate) const EXTRA_EXTENSION: &str = "extra";

/// A minidump that has been persisted to disk.
///
/// The id is the file stem, and is shared with the extra file that holds the
/// annotations captured alongside the minidump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dump {
    id: String,
    path: PathBuf,
    pid: u32,
    created: SystemTime,
}

impl Dump {
    /// Describes an existing minidump file written for process `pid`
    ///
    /// # Errors
    ///
    /// The file doesn't exist, or its name is not a valid minidump name
    pub fn from_path(path: impl Into<PathBuf>, pid: u32) -> Result<Self, Error> {
        let path = path.into();
        let metadata = std::fs::metadata(&path).map_err(|_err| Error::MissingDump(path.clone()))?;
        let id = id_from_minidump(&path).ok_or_else(|| {
            Error::Configuration(format!("'{}' is not a minidump file name", path.display()))
        })?;
        let created = metadata.modified().unwrap_or_else(|_err| SystemTime::now());

        Ok(Self {
            id,
            path,
            pid,
            created,
        })
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The process the minidump describes
    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[inline]
    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// The extra file that belongs to this minidump
    #[inline]
    pub fn extra_path(&self) -> PathBuf {
        extra_file_for_minidump(&self.path)
    }

    #[inline]
    pub fn open(&self) -> std::io::Result<File> {
        File::open(&self.path)
    }

    /// Moves the minidump, and its extra file if there is one, to `id` in
    /// `dir`
    pub(crate) fn rename_to(&mut self, dir: &Path, id: &str) -> Result<(), Error> {
        let new_path = minidump_for_id(dir, id);
        let old_extra = self.extra_path();

        std::fs::rename(&self.path, &new_path)?;
        if old_extra.exists() {
            std::fs::rename(&old_extra, extra_file_for_minidump(&new_path))?;
        }

        self.id = id.to_owned();
        self.path = new_path;
        Ok(())
    }
}

/// `<dir>/<id>.dmp`
#[inline]
pub fn minidump_for_id(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.{MINIDUMP_EXTENSION}"))
}

/// `<dir>/<id>.extra`
#[inline]
pub fn extra_file_for_id(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.{EXTRA_EXTENSION}"))
}

/// The extra file next to a minidump
#[inline]
pub fn extra_file_for_minidump(minidump: &Path) -> PathBuf {
    minidump.with_extension(EXTRA_EXTENSION)
}

/// The id of a minidump, taken from its file name
pub fn id_from_minidump(minidump: &Path) -> Option<String> {
    if minidump.extension()? != MINIDUMP_EXTENSION {
        return None;
    }

    let stem = minidump.file_stem()?.to_str()?;
    (!stem.is_empty()).then(|| stem.to_owned())
}

/// Deletes the minidump and extra file for the id, ignoring files that don't
/// exist
pub fn delete_minidump_files_for_id(dir: &Path, id: &str) -> Result<(), Error> {
    for path in [minidump_for_id(dir, id), extra_file_for_id(dir, id)] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

/// Moves the minidump and its extra file into the pending directory, where
/// they wait to be submitted
pub fn move_to_pending(dump: &Dump, pending_dir: &Path) -> Result<Dump, Error> {
    std::fs::create_dir_all(pending_dir)?;

    let dest = minidump_for_id(pending_dir, dump.id());
    std::fs::rename(dump.path(), &dest)?;

    let extra = dump.extra_path();
    if extra.exists() {
        std::fs::rename(&extra, extra_file_for_id(pending_dir, dump.id()))?;
    }

    Ok(Dump {
        id: dump.id.clone(),
        path: dest,
        pid: dump.pid,
        created: dump.created,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn naming() {
        let dir = Path::new("/crashes");
        let md = minidump_for_id(dir, "abc");
        assert_eq!(md, Path::new("/crashes/abc.dmp"));
        assert_eq!(extra_file_for_id(dir, "abc"), Path::new("/crashes/abc.extra"));
        assert_eq!(extra_file_for_minidump(&md), Path::new("/crashes/abc.extra"));
        assert_eq!(id_from_minidump(&md).as_deref(), Some("abc"));
        assert_eq!(id_from_minidump(Path::new("/crashes/abc.extra")), None);
        assert_eq!(
            id_from_minidump(Path::new("/crashes/abc-browser.dmp")).as_deref(),
            Some("abc-browser")
        );
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Dump::from_path(dir.path().join("nope.dmp"), 1),
            Err(Error::MissingDump(_))
        ));
    }

    #[test]
    fn rename_and_move() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(minidump_for_id(dir.path(), "one"), b"MDMP").unwrap();
        std::fs::write(extra_file_for_id(dir.path(), "one"), b"{}").unwrap();

        let mut dump = Dump::from_path(minidump_for_id(dir.path(), "one"), 7).unwrap();
        assert_eq!(dump.id(), "one");
        assert_eq!(dump.pid(), 7);

        dump.rename_to(dir.path(), "two").unwrap();
        assert_eq!(dump.path(), minidump_for_id(dir.path(), "two"));
        assert!(extra_file_for_id(dir.path(), "two").exists());
        assert!(!extra_file_for_id(dir.path(), "one").exists());

        let pending = dir.path().join("pending");
        let moved = move_to_pending(&dump, &pending).unwrap();
        assert_eq!(moved.path(), minidump_for_id(&pending, "two"));
        assert!(extra_file_for_id(&pending, "two").exists());
        assert!(!dump.path().exists());

        delete_minidump_files_for_id(&pending, "two").unwrap();
        assert!(!moved.path().exists());
        // Already gone
        delete_minidump_files_for_id(&pending, "two").unwrap();
    }
}
