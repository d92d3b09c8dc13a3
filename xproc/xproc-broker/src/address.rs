// SPDX-License-Identifier: Apache-2.0

//! Broker socket addressing (§6 "Socket rendezvous").
//!
//! Linux's abstract namespace needs a raw `sockaddr_un` with a leading NUL
//! byte, which neither `std` nor `mio` expose a constructor for — both only
//! bind to real paths. Binding and connecting are therefore done with raw
//! `libc` calls and the resulting descriptor is handed to `std`/`mio` only
//! after the socket already exists.

use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

fn socket_name(proxy_id: u32) -> String {
    format!("fdproxy-{proxy_id}")
}

#[cfg(target_os = "linux")]
fn build_sockaddr(proxy_id: u32) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let name = socket_name(proxy_id);
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    // Abstract namespace: sun_path[0] == 0, name follows without a NUL
    // terminator, length is exactly header + 1 + name bytes.
    let name_bytes = name.as_bytes();
    assert!(name_bytes.len() < addr.sun_path.len() - 1);
    for (slot, byte) in addr.sun_path[1..].iter_mut().zip(name_bytes) {
        *slot = *byte as libc::c_char;
    }
    let len = (size_of::<libc::sa_family_t>() + 1 + name_bytes.len()) as libc::socklen_t;
    Ok((addr, len))
}

#[cfg(not(target_os = "linux"))]
fn build_sockaddr(proxy_id: u32) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let path = std::env::temp_dir().join(socket_name(proxy_id));
    let path_str = path.to_str().ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-utf8 temp dir"))?;
    let c_path = CString::new(path_str).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = c_path.as_bytes_with_nul();
    assert!(bytes.len() <= addr.sun_path.len());
    for (slot, byte) in addr.sun_path.iter_mut().zip(bytes) {
        *slot = *byte as libc::c_char;
    }
    let len = (size_of::<libc::sa_family_t>() + bytes.len()) as libc::socklen_t;
    Ok((addr, len))
}

fn raw_socket() -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub fn bind_listener(proxy_id: u32) -> io::Result<UnixListener> {
    let fd = raw_socket()?;
    let (addr, len) = build_sockaddr(proxy_id)?;
    let rc = unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    let rc = unsafe { libc::listen(fd, libc::SOMAXCONN) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    // SAFETY: `fd` is a freshly bound, listening socket owned by this call.
    Ok(unsafe { UnixListener::from_raw_fd(fd) })
}

pub fn connect(proxy_id: u32) -> io::Result<UnixStream> {
    let fd = raw_socket()?;
    let (addr, len) = build_sockaddr(proxy_id)?;
    let rc = unsafe { libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    // SAFETY: `fd` is a freshly connected socket owned by this call.
    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}
