//! Platform knobs: socket priority, worker ionice, page-cache hints.
//!
//! Everything here degrades to a no-op off Linux; the engine's correctness never depends on
//! these calls succeeding.

use std::fs::File;

#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;

/// Applies `SO_PRIORITY` to a connected socket; 0 leaves the kernel default.
#[cfg(target_os = "linux")]
pub fn set_socket_priority(socket: &impl AsRawFd, priority: i32) {
    if priority == 0 {
        return;
    }
    // Best effort: the socket works without the QoS mark.
    unsafe {
        let _ = libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PRIORITY,
            std::ptr::addr_of!(priority).cast(),
            std::mem::size_of::<i32>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_socket_priority<T>(_socket: &T, _priority: i32) {}

/// Sets the calling thread's I/O scheduling class and priority (`ioprio_set`).
#[cfg(target_os = "linux")]
pub fn set_io_priority(class: i32, priority: i32) {
    if class == 0 {
        return;
    }
    const IOPRIO_WHO_PROCESS: libc::c_int = 1;
    const IOPRIO_CLASS_SHIFT: i32 = 13;
    let ioprio = (class << IOPRIO_CLASS_SHIFT) | (priority & 0xff);
    unsafe {
        let _ = libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, ioprio);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_io_priority(_class: i32, _priority: i32) {}

/// Hints the kernel that the file's cached pages will not be needed again.
#[cfg(target_os = "linux")]
pub fn drop_page_cache(file: &File) {
    unsafe {
        let _ = libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn drop_page_cache(_file: &File) {}
