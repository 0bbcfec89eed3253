use libc::{c_void, STDERR_FILENO};

/// `write(2)` to stderr... but safe (doesn't use the allocator, so it works
/// before the real allocator has been resolved)
pub fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is valid for reads of `bytes.len()` bytes
        let n = unsafe { libc::write(STDERR_FILENO, bytes.as_ptr() as *const c_void, bytes.len()) };
        if n < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Like [`write_stderr()`], for several pieces followed by a newline
pub fn write_stderr_line(parts: &[&[u8]]) {
    for part in parts {
        write_stderr(part);
    }
    write_stderr(b"\n");
}
