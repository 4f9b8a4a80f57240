//! Positioned file I/O and range cloning.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

/// Write `buf` at `offset` without disturbing other writers.
///
/// Workers write disjoint ranges of the same output file; on Unix this
/// goes through `pwrite` so a single handle never needs a seek cursor.
pub(crate) fn write_all_at(file: &mut File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::FileExt::write_all_at(&*file, buf, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::Write;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }
}

/// Copy `length` bytes from `src` at `src_offset` into `dst` at
/// `dst_offset`.
///
/// On Linux this first attempts `copy_file_range`, which the kernel
/// services as a reflink on filesystems that support it; everywhere
/// else (and whenever the syscall declines) it falls back to a
/// buffered copy.
pub(crate) fn copy_range(
    src: &mut File,
    src_offset: u64,
    dst: &mut File,
    dst_offset: u64,
    length: u64,
) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    if try_copy_file_range(src, src_offset, dst, dst_offset, length)? {
        return Ok(());
    }
    buffered_copy(src, src_offset, dst, dst_offset, length)
}

fn buffered_copy(
    src: &mut File,
    src_offset: u64,
    dst: &mut File,
    dst_offset: u64,
    length: u64,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    src.seek(SeekFrom::Start(src_offset))?;
    while copied < length {
        let want = buf.len().min((length - copied) as usize);
        src.read_exact(&mut buf[..want])?;
        write_all_at(dst, &buf[..want], dst_offset + copied)?;
        copied += want as u64;
    }
    Ok(())
}

/// Ask the kernel to clone a byte range. `Ok(false)` means the
/// filesystem or kernel declined and the caller should copy by hand.
#[cfg(target_os = "linux")]
fn try_copy_file_range(
    src: &File,
    src_offset: u64,
    dst: &File,
    dst_offset: u64,
    length: u64,
) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let mut off_in = src_offset as i64;
    let mut off_out = dst_offset as i64;
    let mut remaining = length;
    while remaining > 0 {
        // SAFETY: both fds are open files owned by the caller for the
        // duration of the call; the offset pointers are valid stack
        // locations the kernel only reads and advances.
        let n = unsafe {
            libc::copy_file_range(
                src.as_raw_fd(),
                &mut off_in,
                dst.as_raw_fd(),
                &mut off_out,
                remaining as usize,
                0,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EXDEV | libc::EINVAL | libc::ENOSYS | libc::EOPNOTSUPP) => Ok(false),
                _ => Err(err),
            };
        }
        if n == 0 {
            // Source ended early; let the buffered path report it.
            return Ok(false);
        }
        remaining -= n as u64;
    }
    Ok(true)
}
