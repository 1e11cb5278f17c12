//! Building blocks that are usable from within the crash hook: no heap
//! allocation, no locks, nothing but plain syscalls on already prepared
//! buffers.

#![allow(unsafe_code)]

use serde_json::ser::{CharEscape, CompactFormatter, Formatter};
use std::{
    ffi::OsStr,
    io,
    os::{fd::AsRawFd, unix::ffi::OsStrExt},
    path::Path,
};

/// A pre-opened channel for logging from the crash hook.
///
/// Normal logging goes through [`log`], which may allocate or take locks, so
/// the crash path writes plain strings and integers here instead.
pub struct CrashLog {
    fd: i32,
    _file: Option<std::fs::File>,
}

impl CrashLog {
    /// Logs to stderr
    #[inline]
    pub fn stderr() -> Self {
        Self { fd: 2, _file: None }
    }

    /// Opens (appending to) the log file up front so the crash path only
    /// needs `write(2)`
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        Ok(Self {
            fd: file.as_raw_fd(),
            _file: Some(file),
        })
    }

    /// Writes each piece, then a newline
    #[inline]
    pub fn line(&self, pieces: &[&str]) {
        for piece in pieces {
            crashreporter_hook::write_fd(self.fd, piece.as_bytes());
        }
        crashreporter_hook::write_fd(self.fd, b"\n");
    }

    #[inline]
    pub fn line_with_code(&self, msg: &str, code: i64) {
        let mut digits = Decimal::new();
        self.line(&[msg, " (", digits.signed(code), ")"]);
    }
}

/// Formats integers into a fixed buffer
pub(crate) struct Decimal {
    buf: [u8; 20],
}

impl Decimal {
    #[inline]
    pub(crate) fn new() -> Self {
        Self { buf: [0; 20] }
    }

    pub(crate) fn unsigned(&mut self, mut value: u64) -> &str {
        let mut pos = self.buf.len();
        loop {
            pos -= 1;
            self.buf[pos] = b'0' + (value % 10) as u8;
            value /= 10;
            if value == 0 {
                break;
            }
        }

        // Only ascii digits were written
        std::str::from_utf8(&self.buf[pos..]).unwrap_or_default()
    }

    pub(crate) fn signed(&mut self, value: i64) -> &str {
        if value >= 0 {
            return self.unsigned(value as u64);
        }

        let len = self.unsigned(value.unsigned_abs()).len();
        let start = self.buf.len() - len - 1;
        self.buf[start] = b'-';
        std::str::from_utf8(&self.buf[start..]).unwrap_or_default()
    }
}

/// `PATH_MAX` on Linux
pub(crate) const PATH_CAPACITY: usize = 4096;

/// A nul terminated path built in a fixed buffer
pub(crate) struct PathBuffer {
    buf: [u8; PATH_CAPACITY],
    len: usize,
}

impl PathBuffer {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [0; PATH_CAPACITY],
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    /// Appends the bytes, returning false if they don't fit
    pub(crate) fn push(&mut self, bytes: &[u8]) -> bool {
        // Always leave room for the terminator
        if self.len + bytes.len() >= self.buf.len() {
            return false;
        }

        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    /// Builds `<dir>/<name><ext>`
    pub(crate) fn set(&mut self, dir: &[u8], name: &[u8], ext: &[u8]) -> bool {
        self.clear();
        self.push(dir) && self.push(b"/") && self.push(name) && self.push(ext)
    }

    #[inline]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[inline]
    pub(crate) fn as_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(self.as_bytes()))
    }

    #[inline]
    fn as_c_ptr(&mut self) -> *const libc::c_char {
        self.buf[self.len] = 0;
        self.buf.as_ptr().cast()
    }
}

/// A file descriptor opened with `open(2)`, closed on drop
pub(crate) struct RawFile {
    fd: i32,
}

impl RawFile {
    /// Creates or truncates the file for writing
    pub(crate) fn create(path: &mut PathBuffer) -> Result<Self, i32> {
        // SAFETY: syscall on a nul terminated path
        let fd = unsafe {
            libc::open(
                path.as_c_ptr(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
                0o600,
            )
        };

        if fd < 0 { Err(errno()) } else { Ok(Self { fd }) }
    }

    pub(crate) fn open_read(path: &mut PathBuffer) -> Result<Self, i32> {
        // SAFETY: syscall on a nul terminated path
        let fd = unsafe { libc::open(path.as_c_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };

        if fd < 0 { Err(errno()) } else { Ok(Self { fd }) }
    }

    /// Writes the whole buffer, retrying on short writes and `EINTR`
    pub(crate) fn write_all(&self, mut bytes: &[u8]) -> Result<(), i32> {
        while !bytes.is_empty() {
            // SAFETY: syscall, the buffer is valid for its length
            let written = unsafe { libc::write(self.fd, bytes.as_ptr().cast(), bytes.len()) };
            if written < 0 {
                let err = errno();
                if err == libc::EINTR {
                    continue;
                }
                return Err(err);
            }
            if written == 0 {
                return Err(libc::EIO);
            }
            bytes = &bytes[written as usize..];
        }

        Ok(())
    }

    /// Writes the whole buffer at the offset without moving the file position
    pub(crate) fn write_all_at(&self, mut bytes: &[u8], mut offset: u64) -> Result<(), i32> {
        while !bytes.is_empty() {
            // SAFETY: syscall, the buffer is valid for its length
            let written = unsafe {
                libc::pwrite(
                    self.fd,
                    bytes.as_ptr().cast(),
                    bytes.len(),
                    offset as libc::off_t,
                )
            };
            if written < 0 {
                let err = errno();
                if err == libc::EINTR {
                    continue;
                }
                return Err(err);
            }
            if written == 0 {
                return Err(libc::EIO);
            }
            bytes = &bytes[written as usize..];
            offset += written as u64;
        }

        Ok(())
    }

    /// Reads into the buffer, 0 meaning end of file
    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize, i32> {
        loop {
            // SAFETY: syscall, the buffer is valid for its length
            let read = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if read < 0 {
                let err = errno();
                if err == libc::EINTR {
                    continue;
                }
                return Err(err);
            }
            return Ok(read as usize);
        }
    }
}

impl Drop for RawFile {
    fn drop(&mut self) {
        // SAFETY: syscall, we own the descriptor
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Removes the file, ignoring errors
pub(crate) fn unlink(path: &mut PathBuffer) {
    // SAFETY: syscall on a nul terminated path
    unsafe {
        libc::unlink(path.as_c_ptr());
    }
}

#[inline]
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Seconds since the epoch, read without touching the allocator
#[inline]
pub(crate) fn unix_time() -> u64 {
    // SAFETY: syscall
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    now.max(0) as u64
}

/// Buffers writes to a [`RawFile`] in a slice provided by the caller
pub(crate) struct BufferedFile<'file, 'buf> {
    file: &'file RawFile,
    buf: &'buf mut [u8],
    len: usize,
}

impl<'file, 'buf> BufferedFile<'file, 'buf> {
    #[inline]
    pub(crate) fn new(file: &'file RawFile, buf: &'buf mut [u8]) -> Self {
        Self { file, buf, len: 0 }
    }
}

impl io::Write for BufferedFile<'_, '_> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.len == self.buf.len() {
            self.flush()?;
        }

        let n = bytes.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.len > 0 {
            self.file
                .write_all(&self.buf[..self.len])
                .map_err(io::Error::from_raw_os_error)?;
            self.len = 0;
        }
        Ok(())
    }
}

/// Streams a JSON object of string values through serde_json's
/// [`CompactFormatter`].
///
/// Nothing is built in memory, values can be written as a series of
/// fragments, so with a writer like [`BufferedFile`] or an
/// `io::Cursor<&mut [u8]>` this is usable from the crash hook.
pub(crate) struct JsonObject<W: io::Write> {
    out: W,
    fmt: CompactFormatter,
    first: bool,
}

impl<W: io::Write> JsonObject<W> {
    pub(crate) fn begin(mut out: W) -> io::Result<Self> {
        let mut fmt = CompactFormatter;
        fmt.begin_object(&mut out)?;
        Ok(Self {
            out,
            fmt,
            first: true,
        })
    }

    /// Starts a `"key":"` entry, the value is written with
    /// [`Self::fragment`] and closed with [`Self::end_value`]
    pub(crate) fn begin_value(&mut self, key: &str) -> io::Result<()> {
        self.fmt.begin_object_key(&mut self.out, self.first)?;
        self.first = false;
        self.fmt.begin_string(&mut self.out)?;
        self.fragment(key)?;
        self.fmt.end_string(&mut self.out)?;
        self.fmt.end_object_key(&mut self.out)?;
        self.fmt.begin_object_value(&mut self.out)?;
        self.fmt.begin_string(&mut self.out)
    }

    /// Writes part of a string, escaped
    pub(crate) fn fragment(&mut self, s: &str) -> io::Result<()> {
        let mut start = 0;
        for (i, &b) in s.as_bytes().iter().enumerate() {
            let escape = match b {
                b'"' => CharEscape::Quote,
                b'\\' => CharEscape::ReverseSolidus,
                b'\n' => CharEscape::LineFeed,
                b'\r' => CharEscape::CarriageReturn,
                b'\t' => CharEscape::Tab,
                0x08 => CharEscape::Backspace,
                0x0c => CharEscape::FormFeed,
                0..=0x1f => CharEscape::AsciiControl(b),
                _ => continue,
            };

            // Only ascii bytes are escaped, so these are char boundaries
            if start < i {
                self.fmt.write_string_fragment(&mut self.out, &s[start..i])?;
            }
            self.fmt.write_char_escape(&mut self.out, escape)?;
            start = i + 1;
        }

        if start < s.len() {
            self.fmt.write_string_fragment(&mut self.out, &s[start..])?;
        }
        Ok(())
    }

    pub(crate) fn end_value(&mut self) -> io::Result<()> {
        self.fmt.end_string(&mut self.out)?;
        self.fmt.end_object_value(&mut self.out)
    }

    pub(crate) fn entry(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.begin_value(key)?;
        self.fragment(value)?;
        self.end_value()
    }

    /// Closes the object and flushes the writer, handing it back
    pub(crate) fn finish(mut self) -> io::Result<W> {
        self.fmt.end_object(&mut self.out)?;
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decimals() {
        let mut d = Decimal::new();
        assert_eq!(d.unsigned(0), "0");
        assert_eq!(d.unsigned(1234), "1234");
        assert_eq!(d.unsigned(u64::MAX), "18446744073709551615");
        assert_eq!(d.signed(-11), "-11");
        assert_eq!(d.signed(i64::MIN), "-9223372036854775808");
    }

    #[test]
    fn paths_reject_overflow() {
        let mut path = PathBuffer::new();
        assert!(path.set(b"/tmp", b"abc", b".dmp"));
        assert_eq!(path.as_path(), Path::new("/tmp/abc.dmp"));

        let long = [b'a'; PATH_CAPACITY];
        assert!(!path.set(b"/tmp", &long, b".dmp"));
    }

    #[test]
    fn json_escaping() {
        let dir = tempfile::tempdir().unwrap();
        let mut path = PathBuffer::new();
        assert!(path.set(dir.path().as_os_str().as_bytes(), b"out", b".json"));

        // A tiny buffer forces flushes in the middle of values
        let mut buf = [0u8; 7];
        {
            let file = RawFile::create(&mut path).unwrap();
            let mut json = JsonObject::begin(BufferedFile::new(&file, &mut buf)).unwrap();
            json.entry("plain", "value").unwrap();
            json.entry("quote\"d", "line\nbreak\ttab\\slash\u{1}\u{8}").unwrap();
            json.begin_value("pieces").unwrap();
            json.fragment("a").unwrap();
            json.fragment("").unwrap();
            json.fragment("b\u{e9}").unwrap();
            json.end_value().unwrap();
            json.finish().unwrap();
        }

        let written = std::fs::read_to_string(path.as_path()).unwrap();
        let parsed: std::collections::BTreeMap<String, String> =
            serde_json::from_str(&written).unwrap();

        assert_eq!(parsed["plain"], "value");
        assert_eq!(parsed["quote\"d"], "line\nbreak\ttab\\slash\u{1}\u{8}");
        assert_eq!(parsed["pieces"], "ab\u{e9}");
    }

    #[test]
    fn json_into_a_full_slice_fails() {
        let mut buf = [0u8; 16];
        let mut json = JsonObject::begin(io::Cursor::new(&mut buf[..])).unwrap();
        assert!(json.entry("key", "a value that does not fit").is_err());

        let mut buf = [0u8; 16];
        let mut json = JsonObject::begin(io::Cursor::new(&mut buf[..])).unwrap();
        json.entry("k", "v").unwrap();
        let cursor = json.finish().unwrap();
        let len = cursor.position() as usize;
        assert_eq!(&buf[..len], br#"{"k":"v"}"#);
    }
}
