//! Out-of-band descriptor passing over `SCM_RIGHTS` ancillary data. Hand-rolled rather than pulled
//! in from a crate because every fd-passing crate on crates.io ties its `Sendable`/`Receivable`
//! impls to `std::os::unix::net` types, and this worker's sockets are raw fds registered directly
//! with the multiplexer. The `sendmsg`/`recvmsg`/`cmsghdr` plumbing below follows the same shape
//! nagisa's `sendfd` crate uses internally.

use std::io;
use std::os::unix::io::RawFd;
use std::{alloc, mem, ptr};

use crate::frame::MAX_FDS;

unsafe fn construct_msghdr_for(iov: &mut libc::iovec, fd_count: usize) -> (libc::msghdr, alloc::Layout, usize) {
    let fd_len = mem::size_of::<RawFd>() * fd_count;
    let cmsg_buffer_len = libc::CMSG_SPACE(fd_len as u32) as usize;
    let layout = alloc::Layout::from_size_align(cmsg_buffer_len, mem::align_of::<libc::cmsghdr>())
        .expect("cmsg buffer layout");
    let cmsg_buffer = alloc::alloc(layout);
    if cmsg_buffer.is_null() {
        alloc::handle_alloc_error(layout);
    }

    (
        libc::msghdr {
            msg_name: ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: iov as *mut _,
            msg_iovlen: 1,
            msg_control: cmsg_buffer as *mut _,
            msg_controllen: cmsg_buffer_len,
            ..mem::zeroed()
        },
        layout,
        fd_len,
    )
}

/// Sends `bytes` and ancillary-attaches `fds` (at most `MAX_FDS`) over `socket`. Ownership of the
/// descriptors is not transferred -- closing them after a successful send is the caller's job,
/// same as a plain `write`.
pub fn send_with_fds(socket: RawFd, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    assert!(fds.len() <= MAX_FDS, "too many descriptors for one frame");

    unsafe {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut _,
            iov_len: bytes.len(),
        };
        let (mut msghdr, cmsg_layout, fd_len) = construct_msghdr_for(&mut iov, fds.len());
        let cmsg_buffer = msghdr.msg_control;

        if !fds.is_empty() {
            let cmsg_header = libc::CMSG_FIRSTHDR(&msghdr as *const _ as *mut _);
            ptr::write(
                cmsg_header,
                libc::cmsghdr {
                    cmsg_level: libc::SOL_SOCKET,
                    cmsg_type: libc::SCM_RIGHTS,
                    cmsg_len: libc::CMSG_LEN(fd_len as u32) as usize,
                },
            );
            let cmsg_data = libc::CMSG_DATA(cmsg_header) as *mut RawFd;
            for (i, fd) in fds.iter().enumerate() {
                ptr::write_unaligned(cmsg_data.offset(i as isize), *fd);
            }
        } else {
            msghdr.msg_control = ptr::null_mut();
            msghdr.msg_controllen = 0;
        }

        let sent = libc::sendmsg(socket, &msghdr as *const _, libc::MSG_NOSIGNAL);
        alloc::dealloc(cmsg_buffer as *mut _, cmsg_layout);

        if sent < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(sent as usize)
        }
    }
}

/// Receives into `bytes`, collecting up to `MAX_FDS` ancillary descriptors into `fds`. Returns
/// `(bytes_read, fds_received)`. Received descriptors are owned by the caller and must be closed.
pub fn recv_with_fds(socket: RawFd, bytes: &mut [u8], fds: &mut [RawFd; MAX_FDS]) -> io::Result<(usize, usize)> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: bytes.as_mut_ptr() as *mut _,
            iov_len: bytes.len(),
        };
        let (mut msghdr, cmsg_layout, _) = construct_msghdr_for(&mut iov, MAX_FDS);
        let cmsg_buffer = msghdr.msg_control;

        let received = libc::recvmsg(socket, &mut msghdr as *mut _, 0);
        if received < 0 {
            let err = io::Error::last_os_error();
            alloc::dealloc(cmsg_buffer as *mut _, cmsg_layout);
            return Err(err);
        }

        if msghdr.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
            let mut cmsg_header = libc::CMSG_FIRSTHDR(&msghdr as *const _ as *mut _);
            while !cmsg_header.is_null() {
                if (*cmsg_header).cmsg_level == libc::SOL_SOCKET && (*cmsg_header).cmsg_type == libc::SCM_RIGHTS {
                    let data_ptr = libc::CMSG_DATA(cmsg_header) as *const RawFd;
                    let header_len = (*cmsg_header).cmsg_len;
                    let data_offset = libc::CMSG_LEN(0) as usize;
                    let data_bytes = header_len.saturating_sub(data_offset);
                    let n = data_bytes / mem::size_of::<RawFd>();
                    for i in 0..n {
                        libc::close(ptr::read_unaligned(data_ptr.add(i)));
                    }
                }
                cmsg_header = libc::CMSG_NXTHDR(&mut msghdr as *mut _, cmsg_header);
            }
            alloc::dealloc(cmsg_buffer as *mut _, cmsg_layout);
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }

        let mut fd_count = 0;
        let mut cmsg_header = libc::CMSG_FIRSTHDR(&msghdr as *const _ as *mut _);
        while !cmsg_header.is_null() {
            if (*cmsg_header).cmsg_level == libc::SOL_SOCKET && (*cmsg_header).cmsg_type == libc::SCM_RIGHTS {
                let data_ptr = libc::CMSG_DATA(cmsg_header) as *const RawFd;
                let header_len = (*cmsg_header).cmsg_len;
                let data_offset = libc::CMSG_LEN(0) as usize;
                let data_bytes = header_len.saturating_sub(data_offset);
                let n = (data_bytes / mem::size_of::<RawFd>()).min(MAX_FDS - fd_count);
                for i in 0..n {
                    fds[fd_count] = ptr::read_unaligned(data_ptr.add(i));
                    fd_count += 1;
                }
            }
            cmsg_header = libc::CMSG_NXTHDR(&mut msghdr as *mut _, cmsg_header);
        }

        alloc::dealloc(cmsg_buffer as *mut _, cmsg_layout);
        Ok((received as usize, fd_count))
    }
}
