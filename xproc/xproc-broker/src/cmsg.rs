// SPDX-License-Identifier: Apache-2.0

//! `SCM_RIGHTS` ancillary-data helpers (§6 "Socket rendezvous": "descriptors
//! travel as SOL_SOCKET / SCM_RIGHTS ancillary data, exactly one descriptor
//! per carrier when required").
//!
//! `libc` does not expose the `CMSG_*` macros directly (they're C macros,
//! not functions), so the alignment arithmetic they perform is reproduced
//! here by hand, following the same layout every `sendmsg`/`recvmsg` caller
//! on these platforms relies on: a `cmsghdr` immediately followed by its
//! payload, both aligned to `size_of::<usize>()`.

use std::io;
use std::mem::{size_of, MaybeUninit};
use std::os::fd::RawFd;

fn cmsg_align(len: usize) -> usize {
    let align = size_of::<usize>();
    (len + align - 1) & !(align - 1)
}

fn cmsg_space(payload_len: usize) -> usize {
    cmsg_align(size_of::<libc::cmsghdr>()) + cmsg_align(payload_len)
}

/// Sends `buf` on `fd`, attaching `passed_fd` as `SCM_RIGHTS` ancillary data
/// when present.
pub fn send_with_fd(fd: RawFd, buf: &[u8], passed_fd: Option<RawFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut cmsg_buf = vec![0u8; cmsg_space(size_of::<RawFd>())];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(passed) = passed_fd {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;

        // SAFETY: `cmsg_buf` is sized by `cmsg_space` for exactly one
        // `cmsghdr` plus one `RawFd` payload, and `msg` was just pointed at it.
        unsafe {
            let cmsg = msg.msg_control as *mut libc::cmsghdr;
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = cmsg_align(size_of::<libc::cmsghdr>()) + size_of::<RawFd>();
            let data = cmsg_data(cmsg);
            std::ptr::write_unaligned(data as *mut RawFd, passed);
        }
        msg.msg_controllen = cmsg_space(size_of::<RawFd>()) as _;
    }

    // SAFETY: `msg` is fully initialized above, `fd` is caller-owned.
    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Receives into `buf` from `fd`, returning the byte count and any
/// descriptor carried as `SCM_RIGHTS` ancillary data.
pub fn recv_with_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<RawFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut cmsg_buf: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); cmsg_space(size_of::<RawFd>())];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    // SAFETY: `msg` fields all point into buffers owned for the call's
    // duration; `fd` is caller-owned.
    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut passed_fd = None;
    if msg.msg_controllen as usize >= cmsg_align(size_of::<libc::cmsghdr>()) {
        // SAFETY: just checked the control buffer is at least one header long.
        unsafe {
            let cmsg = msg.msg_control as *const libc::cmsghdr;
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = cmsg_data(cmsg as *mut libc::cmsghdr);
                passed_fd = Some(std::ptr::read_unaligned(data as *const RawFd));
            }
        }
    }

    Ok((n as usize, passed_fd))
}

/// SAFETY: `cmsg` must point at a `cmsghdr` with enough trailing space for
/// its payload, matching the `CMSG_DATA` macro's layout assumption.
unsafe fn cmsg_data(cmsg: *mut libc::cmsghdr) -> *mut u8 {
    (cmsg as *mut u8).add(cmsg_align(size_of::<libc::cmsghdr>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_round_trips_over_a_socketpair() {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let (a, b) = (fds[0], fds[1]);

        let dev_null = unsafe { libc::open(c_path(b"/dev/null\0"), libc::O_RDONLY) };
        assert!(dev_null >= 0);

        send_with_fd(a, b"hi", Some(dev_null)).unwrap();
        let mut buf = [0u8; 2];
        let (n, received) = recv_with_fd(b, &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"hi");
        assert!(received.is_some());

        unsafe {
            libc::close(a);
            libc::close(b);
            libc::close(dev_null);
            libc::close(received.unwrap());
        }
    }

    fn c_path(bytes: &[u8]) -> *const libc::c_char {
        bytes.as_ptr() as *const libc::c_char
    }
}
