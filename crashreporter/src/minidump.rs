//! Writes a minidump of the current process from within the crash hook.
//!
//! Everything the writer needs, the output paths and every scratch buffer, is
//! prepared ahead of time in [`CaptureBuffers`]. Writing only performs
//! syscalls on those buffers, reads the crashing thread's stack with
//! `process_vm_readv` so unreadable memory is reported instead of faulting
//! again, and records anything it could not capture in the dump itself.

#![allow(unsafe_code)]

use crate::{
    AnnotationTable, ThreadAnnotations, keys,
    raw::{self, BufferedFile, CrashLog, Decimal, JsonObject, PathBuffer, RawFile},
    thread_annotations,
};
use crash_context::CrashContext;
use minidump_common::format::{
    self, MINIDUMP_DIRECTORY, MINIDUMP_EXCEPTION, MINIDUMP_EXCEPTION_STREAM, MINIDUMP_HEADER,
    MINIDUMP_LOCATION_DESCRIPTOR, MINIDUMP_MEMORY_DESCRIPTOR, MINIDUMP_STREAM_TYPE,
    MINIDUMP_SYSTEM_INFO, MINIDUMP_THREAD, PlatformId, ProcessorArchitecture,
};
use scroll::Pwrite;
use std::{
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

/// Our own stream of `key=value` lines describing the capture itself
const CAPTURE_NOTES_STREAM: u32 = 0x4352_0001;

const STREAM_COUNT: u32 = 6;

/// How much of the crashing thread's stack, from the stack pointer up, is
/// copied into the dump
const STACK_CAPTURE: usize = 32 * 1024;
const PAGE: u64 = 4096;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        type RawContext = format::CONTEXT_AMD64;
    } else if #[cfg(target_arch = "aarch64")] {
        type RawContext = format::CONTEXT_ARM64;
    }
}

/// Fixed layout of everything that precedes the stack memory
mod layout {
    pub const DIRECTORY: usize = 32;
    pub const SYSTEM_INFO: usize = DIRECTORY + 12 * super::STREAM_COUNT as usize;
    pub const CSD_VERSION: usize = SYSTEM_INFO + 56;
    pub const EXCEPTION: usize = CSD_VERSION + 8;
    pub const THREAD_LIST: usize = EXCEPTION + 168;
    pub const MEMORY_LIST: usize = THREAD_LIST + 56;
    /// Register state of the crashing thread, `CONTEXT_AMD64` is the largest
    pub const CONTEXT: usize = MEMORY_LIST + 24;
    pub const CONTEXT_CAPACITY: usize = 1232;
    pub const NOTES: usize = CONTEXT + CONTEXT_CAPACITY;
    pub const NOTES_CAPACITY: usize = 128;
    pub const STACK: usize = NOTES + NOTES_CAPACITY;
}

/// Facts about the machine gathered when the writer is created
struct SystemFacts {
    architecture: ProcessorArchitecture,
    processors: u8,
    kernel: (u32, u32, u32),
}

impl SystemFacts {
    fn gather() -> Self {
        let architecture = {
            cfg_if::cfg_if! {
                if #[cfg(target_arch = "x86_64")] {
                    ProcessorArchitecture::PROCESSOR_ARCHITECTURE_AMD64
                } else if #[cfg(target_arch = "aarch64")] {
                    ProcessorArchitecture::PROCESSOR_ARCHITECTURE_ARM64
                } else if #[cfg(target_arch = "x86")] {
                    ProcessorArchitecture::PROCESSOR_ARCHITECTURE_INTEL
                } else if #[cfg(target_arch = "arm")] {
                    ProcessorArchitecture::PROCESSOR_ARCHITECTURE_ARM
                } else {
                    ProcessorArchitecture::PROCESSOR_ARCHITECTURE_UNKNOWN
                }
            }
        };

        let processors = std::thread::available_parallelism()
            .map_or(1, |n| n.get().min(u8::MAX as usize) as u8);

        Self {
            architecture,
            processors,
            kernel: kernel_version().unwrap_or_default(),
        }
    }
}

/// Parses `major.minor.patch` out of the kernel release
fn kernel_version() -> Option<(u32, u32, u32)> {
    // SAFETY: uname fills the zeroed struct with nul terminated strings
    let release = unsafe {
        let mut uts: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut uts) != 0 {
            return None;
        }
        std::ffi::CStr::from_ptr(uts.release.as_ptr())
            .to_string_lossy()
            .into_owned()
    };

    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}

/// The stack pointer of the thread described by the context
fn stack_pointer(cc: &CrashContext) -> Option<u64> {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            Some(cc.context.uc_mcontext.gregs[libc::REG_RSP as usize] as u64)
        } else if #[cfg(target_arch = "x86")] {
            Some(cc.context.uc_mcontext.gregs[libc::REG_ESP as usize] as u64)
        } else if #[cfg(target_arch = "aarch64")] {
            Some(cc.context.uc_mcontext.sp)
        } else {
            let _ = cc;
            None
        }
    }
}

/// Serializes the crashing thread's registers at [`layout::CONTEXT`],
/// returning the size of the record, or 0 if there is none for this
/// architecture
fn write_context(prefix: &mut [u8], cc: &CrashContext) -> Result<usize, scroll::Error> {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            use libc::{
                REG_CSGSFS, REG_EFL, REG_R8, REG_R9, REG_R10, REG_R11, REG_R12, REG_R13, REG_R14,
                REG_R15, REG_RAX, REG_RBP, REG_RBX, REG_RCX, REG_RDI, REG_RDX, REG_RIP, REG_RSI,
                REG_RSP,
            };

            let gregs = &cc.context.uc_mcontext.gregs;
            let reg = |index: libc::c_int| gregs[index as usize] as u64;
            let segments = reg(REG_CSGSFS);
            let fp = &cc.float_state;

            let mut context = RawContext {
                context_flags: format::ContextFlagsAmd64::CONTEXT_AMD64_FULL.bits(),
                mx_csr: fp.mxcsr,
                cs: (segments & 0xffff) as u16,
                gs: ((segments >> 16) & 0xffff) as u16,
                fs: ((segments >> 32) & 0xffff) as u16,
                eflags: reg(REG_EFL) as u32,
                rax: reg(REG_RAX),
                rcx: reg(REG_RCX),
                rdx: reg(REG_RDX),
                rbx: reg(REG_RBX),
                rsp: reg(REG_RSP),
                rbp: reg(REG_RBP),
                rsi: reg(REG_RSI),
                rdi: reg(REG_RDI),
                r8: reg(REG_R8),
                r9: reg(REG_R9),
                r10: reg(REG_R10),
                r11: reg(REG_R11),
                r12: reg(REG_R12),
                r13: reg(REG_R13),
                r14: reg(REG_R14),
                r15: reg(REG_R15),
                rip: reg(REG_RIP),
                ..Default::default()
            };

            let mut float_save = format::XMM_SAVE_AREA32 {
                control_word: fp.cwd,
                status_word: fp.swd,
                tag_word: fp.ftw as u8,
                error_opcode: fp.fop,
                error_offset: fp.rip as u32,
                data_offset: fp.rdp as u32,
                mx_csr: fp.mxcsr,
                mx_csr_mask: fp.mxcr_mask,
                ..Default::default()
            };
            pack_words(&mut float_save.float_registers, &fp.st_space);
            pack_words(&mut float_save.xmm_registers, &fp.xmm_space);
            context.float_save.pwrite_with(float_save, 0, scroll::LE)?;

            prefix.pwrite_with(context, layout::CONTEXT, scroll::LE)
        } else if #[cfg(target_arch = "aarch64")] {
            let mc = &cc.context.uc_mcontext;
            let fp = &cc.float_state;

            let mut context = RawContext {
                context_flags: format::ContextFlagsArm64::CONTEXT_ARM64_FULL.bits(),
                cpsr: mc.pstate as u32,
                sp: mc.sp,
                pc: mc.pc,
                fpsr: fp.fpsr,
                fpcr: fp.fpcr,
                ..Default::default()
            };
            context.iregs.copy_from_slice(&mc.regs);
            context.float_regs.copy_from_slice(&fp.vregs);

            prefix.pwrite_with(context, layout::CONTEXT, scroll::LE)
        } else {
            let _ = (prefix, cc);
            Ok(0)
        }
    }
}

/// Packs little-endian 32-bit words into 128-bit registers
#[cfg(target_arch = "x86_64")]
fn pack_words(registers: &mut [u128], words: &[u32]) {
    for (register, words) in registers.iter_mut().zip(words.chunks_exact(4)) {
        *register = words
            .iter()
            .rev()
            .fold(0, |acc, &word| (acc << 32) | u128::from(word));
    }
}

/// Copies memory starting at `start` into `out`, a page at a time so a fault
/// part way through still returns everything before it
fn read_own_memory(start: u64, out: &mut [u8]) -> usize {
    if start == 0 || out.is_empty() {
        return 0;
    }

    const MAX_IOV: usize = STACK_CAPTURE / PAGE as usize + 1;
    let mut remote = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; MAX_IOV];

    let mut addr = start;
    let mut left = out.len() as u64;
    let mut count = 0;
    while left > 0 && count < MAX_IOV {
        let page_end = (addr / PAGE + 1) * PAGE;
        let len = (page_end - addr).min(left);
        remote[count] = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: len as usize,
        };
        addr += len;
        left -= len;
        count += 1;
    }

    let local = libc::iovec {
        iov_base: out.as_mut_ptr().cast(),
        iov_len: out.len(),
    };

    // SAFETY: syscall, the local buffer is valid for its length and the
    // kernel validates the remote ranges
    let read = unsafe {
        libc::process_vm_readv(
            libc::getpid(),
            &local,
            1,
            remote.as_ptr(),
            count as libc::c_ulong,
            0,
        )
    };

    read.max(0) as usize
}

/// Scratch space for writing a minidump without allocating
pub(crate) struct CaptureBuffers {
    dir: Vec<u8>,
    id: [u8; 36],
    path: PathBuffer,
    extra_path: PathBuffer,
    maps_path: PathBuffer,
    prefix: [u8; layout::STACK],
    stack: [u8; STACK_CAPTURE],
    chunk: [u8; 4096],
    json: [u8; 1024],
}

impl CaptureBuffers {
    fn new(dir: &Path) -> Box<Self> {
        let mut buffers = Box::new(Self {
            dir: dir.as_os_str().as_bytes().to_vec(),
            id: [0; 36],
            path: PathBuffer::new(),
            extra_path: PathBuffer::new(),
            maps_path: PathBuffer::new(),
            prefix: [0; layout::STACK],
            stack: [0; STACK_CAPTURE],
            chunk: [0; 4096],
            json: [0; 1024],
        });
        buffers.maps_path.push(b"/proc/self/maps");
        buffers.reserve_id();
        buffers
    }

    fn reserve_id(&mut self) {
        uuid::Uuid::new_v4().hyphenated().encode_lower(&mut self.id);
    }

    fn id(&self) -> &str {
        std::str::from_utf8(&self.id).unwrap_or_default()
    }
}

/// What the writer managed to capture
struct Capture {
    degraded: bool,
}

/// Writes minidumps of the current process into a directory
pub(crate) struct SelfDumpWriter {
    buffers: parking_lot::Mutex<Box<CaptureBuffers>>,
    system: SystemFacts,
    capture_stack: bool,
    completed: AtomicBool,
}

impl SelfDumpWriter {
    pub(crate) fn new(dir: &Path, capture_stack: bool) -> Self {
        Self {
            buffers: parking_lot::Mutex::new(CaptureBuffers::new(dir)),
            system: SystemFacts::gather(),
            capture_stack,
            completed: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_directory(&self, dir: &Path) {
        self.buffers.lock().dir = dir.as_os_str().as_bytes().to_vec();
    }

    pub(crate) fn directory(&self) -> PathBuf {
        PathBuf::from(std::ffi::OsStr::from_bytes(&self.buffers.lock().dir))
    }

    /// If a dump was written since the last call, returns its id and reserves
    /// a fresh id for the next one
    pub(crate) fn take_completed(&self) -> Option<String> {
        if !self.completed.swap(false, Ordering::AcqRel) {
            return None;
        }

        let mut buffers = self.buffers.lock();
        let id = buffers.id().to_owned();
        buffers.reserve_id();
        Some(id)
    }

    /// The buffers may be held by a thread writing a non-fatal dump, give it
    /// a moment to finish rather than blocking forever
    fn lock_buffers(&self) -> Option<parking_lot::MutexGuard<'_, Box<CaptureBuffers>>> {
        for _ in 0..1000 {
            if let Some(guard) = self.buffers.try_lock() {
                return Some(guard);
            }
            // SAFETY: syscall
            unsafe {
                libc::sched_yield();
            }
        }
        None
    }

    /// Writes the minidump and then its extra file.
    ///
    /// Safe to call from the crash hook. On failure the partial minidump is
    /// removed and the errno is returned.
    pub(crate) fn write(
        &self,
        cc: &CrashContext,
        annotations: &AnnotationTable,
        threads: &ThreadAnnotations,
        log: &CrashLog,
    ) -> Result<(), i32> {
        let Some(mut guard) = self.lock_buffers() else {
            log.line(&["crashreporter: capture buffers are busy, no minidump written"]);
            return Err(libc::EBUSY);
        };

        let CaptureBuffers {
            dir,
            id,
            path,
            extra_path,
            maps_path,
            prefix,
            stack,
            chunk,
            json,
        } = &mut **guard;

        if !path.set(dir, id, b".dmp") || !extra_path.set(dir, id, b".extra") {
            log.line(&["crashreporter: minidump path is too long"]);
            return Err(libc::ENAMETOOLONG);
        }

        let capture = {
            let file = match RawFile::create(path) {
                Ok(file) => file,
                Err(err) => {
                    log.line_with_code("crashreporter: failed to create minidump", err.into());
                    return Err(err);
                }
            };

            let result = self.write_minidump(&file, cc, prefix, stack, chunk, maps_path);
            drop(file);

            match result {
                Ok(capture) => capture,
                Err(err) => {
                    log.line_with_code("crashreporter: failed to write minidump", err.into());
                    raw::unlink(path);
                    return Err(err);
                }
            }
        };

        if capture.degraded {
            log.line(&["crashreporter: minidump written with unreadable memory omitted"]);
        }

        // The extra file only ever follows a complete minidump
        let extra = RawFile::create(extra_path).and_then(|file| {
            let written = JsonObject::begin(BufferedFile::new(&file, json)).and_then(|mut obj| {
                write_extra(&mut obj, annotations, threads, capture.degraded)?;
                obj.finish()
            });
            written
                .map(drop)
                .map_err(|err| err.raw_os_error().unwrap_or(libc::EIO))
        });

        if let Err(err) = extra {
            log.line_with_code("crashreporter: failed to write extra file", err.into());
            raw::unlink(extra_path);
        }

        self.completed.store(true, Ordering::Release);
        Ok(())
    }

    fn write_minidump(
        &self,
        file: &RawFile,
        cc: &CrashContext,
        prefix: &mut [u8; layout::STACK],
        stack: &mut [u8; STACK_CAPTURE],
        chunk: &mut [u8; 4096],
        maps_path: &mut PathBuffer,
    ) -> Result<Capture, i32> {
        let mut degraded = false;

        let sp = if self.capture_stack { stack_pointer(cc) } else { None };
        let stack_len = match sp {
            Some(sp) => {
                let len = read_own_memory(sp, stack);
                // Running off the top of the stack mapping is expected, not
                // being able to read where the stack pointer points is not
                degraded |= len == 0;
                len
            }
            None => {
                degraded |= self.capture_stack;
                0
            }
        };

        if stack_len > 0 {
            file.write_all_at(&stack[..stack_len], layout::STACK as u64)?;
        }

        // Linux maps, copied straight from procfs
        let maps_offset = (layout::STACK + stack_len).next_multiple_of(8);
        let mut maps_len = 0;
        match RawFile::open_read(maps_path) {
            Ok(maps) => loop {
                match maps.read(chunk) {
                    Ok(0) => break,
                    Ok(read) => {
                        file.write_all_at(&chunk[..read], (maps_offset + maps_len) as u64)?;
                        maps_len += read;
                    }
                    Err(_) => {
                        degraded = true;
                        break;
                    }
                }
            },
            Err(_) => degraded = true,
        }

        // Capture notes
        let notes: &[u8] = if degraded {
            b"CaptureDegraded=1\n"
        } else {
            b"CaptureDegraded=0\n"
        };
        prefix[layout::NOTES..layout::NOTES + notes.len()].copy_from_slice(notes);

        let stack_memory = MINIDUMP_MEMORY_DESCRIPTOR {
            start_of_memory_range: if stack_len > 0 { sp.unwrap_or_default() } else { 0 },
            memory: MINIDUMP_LOCATION_DESCRIPTOR {
                data_size: stack_len as u32,
                rva: if stack_len > 0 { layout::STACK as u32 } else { 0 },
            },
        };

        self.write_prefix(prefix, cc, stack_memory, notes.len(), maps_offset, maps_len)
            .map_err(|_err| libc::EIO)?;

        file.write_all_at(prefix, 0)?;

        Ok(Capture { degraded })
    }

    fn write_prefix(
        &self,
        prefix: &mut [u8; layout::STACK],
        cc: &CrashContext,
        stack: MINIDUMP_MEMORY_DESCRIPTOR,
        notes_len: usize,
        maps_offset: usize,
        maps_len: usize,
    ) -> Result<(), scroll::Error> {
        let le = scroll::LE;

        prefix.pwrite_with(
            MINIDUMP_HEADER {
                signature: format::MINIDUMP_SIGNATURE,
                version: format::MINIDUMP_VERSION,
                stream_count: STREAM_COUNT,
                stream_directory_rva: layout::DIRECTORY as u32,
                checksum: 0,
                time_date_stamp: raw::unix_time() as u32,
                flags: 0,
            },
            0,
            le,
        )?;

        let thread_list_len = 4 + 48;
        let memory_list_len = if stack.memory.data_size > 0 { 4 + 16 } else { 4 };

        let directory = [
            (MINIDUMP_STREAM_TYPE::SystemInfoStream as u32, layout::SYSTEM_INFO, 56),
            (MINIDUMP_STREAM_TYPE::ExceptionStream as u32, layout::EXCEPTION, 168),
            (MINIDUMP_STREAM_TYPE::ThreadListStream as u32, layout::THREAD_LIST, thread_list_len),
            (MINIDUMP_STREAM_TYPE::MemoryListStream as u32, layout::MEMORY_LIST, memory_list_len),
            (CAPTURE_NOTES_STREAM, layout::NOTES, notes_len),
            (MINIDUMP_STREAM_TYPE::LinuxMaps as u32, maps_offset, maps_len),
        ];

        for (i, (stream_type, rva, size)) in directory.into_iter().enumerate() {
            prefix.pwrite_with(
                MINIDUMP_DIRECTORY {
                    stream_type,
                    location: MINIDUMP_LOCATION_DESCRIPTOR {
                        data_size: size as u32,
                        rva: rva as u32,
                    },
                },
                layout::DIRECTORY + i * 12,
                le,
            )?;
        }

        let (major_version, minor_version, build_number) = self.system.kernel;
        prefix.pwrite_with(
            MINIDUMP_SYSTEM_INFO {
                processor_architecture: self.system.architecture as u16,
                processor_level: 0,
                processor_revision: 0,
                number_of_processors: self.system.processors,
                product_type: 0,
                major_version,
                minor_version,
                build_number,
                platform_id: if cfg!(target_os = "android") {
                    PlatformId::Android as u32
                } else {
                    PlatformId::Linux as u32
                },
                csd_version_rva: layout::CSD_VERSION as u32,
                suite_mask: 0,
                reserved2: 0,
                cpu: format::CPU_INFORMATION { data: [0; 24] },
            },
            layout::SYSTEM_INFO,
            le,
        )?;

        // Empty utf-16 string, length then terminator
        prefix.pwrite_with(0u32, layout::CSD_VERSION, le)?;
        prefix.pwrite_with(0u16, layout::CSD_VERSION + 4, le)?;

        let context_len = write_context(prefix, cc)?;
        let thread_context = if context_len > 0 {
            MINIDUMP_LOCATION_DESCRIPTOR {
                data_size: context_len as u32,
                rva: layout::CONTEXT as u32,
            }
        } else {
            MINIDUMP_LOCATION_DESCRIPTOR::default()
        };

        prefix.pwrite_with(
            MINIDUMP_EXCEPTION_STREAM {
                thread_id: cc.tid as u32,
                __align: 0,
                exception_record: MINIDUMP_EXCEPTION {
                    exception_code: cc.siginfo.ssi_signo,
                    exception_flags: cc.siginfo.ssi_code as u32,
                    exception_record: 0,
                    exception_address: cc.siginfo.ssi_addr,
                    number_parameters: 0,
                    __align: 0,
                    exception_information: [0; 15],
                },
                thread_context,
            },
            layout::EXCEPTION,
            le,
        )?;

        prefix.pwrite_with(1u32, layout::THREAD_LIST, le)?;
        prefix.pwrite_with(
            MINIDUMP_THREAD {
                thread_id: cc.tid as u32,
                suspend_count: 0,
                priority_class: 0,
                priority: 0,
                teb: 0,
                stack,
                thread_context,
            },
            layout::THREAD_LIST + 4,
            le,
        )?;

        if stack.memory.data_size > 0 {
            prefix.pwrite_with(1u32, layout::MEMORY_LIST, le)?;
            prefix.pwrite_with(stack, layout::MEMORY_LIST + 4, le)?;
        } else {
            prefix.pwrite_with(0u32, layout::MEMORY_LIST, le)?;
        }

        Ok(())
    }
}

/// Writes the annotations, minus the ones the reporter fills in itself, and
/// the flattened thread annotations
pub(crate) fn write_annotations<W: io::Write>(
    json: &mut JsonObject<W>,
    annotations: &AnnotationTable,
    threads: &ThreadAnnotations,
) -> io::Result<()> {
    for (key, value) in annotations.iter() {
        if matches!(
            key,
            keys::CRASH_TIME | keys::THREAD_ID_NAME_MAPPING | keys::CAPTURE_DEGRADED
        ) {
            continue;
        }
        json.entry(key, value)?;
    }

    if let Some(records) = threads.crash_records() {
        if !records.is_empty() {
            json.begin_value(keys::THREAD_ID_NAME_MAPPING)?;
            thread_annotations::write_flat(&records, &mut |piece| json.fragment(piece))?;
            json.end_value()?;
        }
    }

    Ok(())
}

fn write_extra<W: io::Write>(
    json: &mut JsonObject<W>,
    annotations: &AnnotationTable,
    threads: &ThreadAnnotations,
    degraded: bool,
) -> io::Result<()> {
    write_annotations(json, annotations, threads)?;

    let mut digits = Decimal::new();
    json.entry(keys::CRASH_TIME, digits.unsigned(raw::unix_time()))?;

    if degraded {
        json.entry(keys::CAPTURE_DEGRADED, "1")?;
    }
    Ok(())
}

/// Captures the calling thread's context, for dumps taken outside of a crash
pub(crate) fn current_context() -> Box<CrashContext> {
    // SAFETY: the context is plain old data, getcontext fills it in
    unsafe {
        let mut cc: Box<CrashContext> = Box::new(std::mem::zeroed());
        crash_context::crash_context_getcontext(&mut cc.context);
        cc.pid = std::process::id() as i32;
        cc.tid = crate::current_thread_id();
        cc
    }
}
