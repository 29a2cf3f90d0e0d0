//! Descriptor-backed device

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tracing::debug;

use crate::common::Result;

use super::TunDevice;

const PACKET_INFO_LEN: usize = 4;

/// Raw descriptor that is never closed here; the host owns it.
struct HostFd(RawFd);

impl AsRawFd for HostFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Interface descriptor handed over by the host.
///
/// The descriptor is switched to non-blocking mode and registered with the
/// tokio reactor, so `new` must run inside a runtime. With `packet_info`
/// every frame carries a 4-byte protocol header which is stripped on read
/// and prepended on write.
pub struct FdDevice {
    name: String,
    fd: AsyncFd<HostFd>,
    packet_info: bool,
}

impl FdDevice {
    pub fn new(descriptor: RawFd, packet_info: bool) -> Result<Self> {
        set_nonblocking(descriptor)?;
        let fd = AsyncFd::new(HostFd(descriptor))?;
        debug!("Opened interface descriptor {} (packet info: {})", descriptor, packet_info);

        Ok(Self {
            name: format!("fd{}", descriptor),
            fd,
            packet_info,
        })
    }

    pub fn descriptor(&self) -> RawFd {
        self.fd.get_ref().0
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a caller-provided descriptor; failure is reported.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0 {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Packet information header for an IP frame.
///
/// utun (Darwin) uses the address family as a big-endian u32, Linux
/// `IFF_PI` uses flags(2) + ethertype(2).
fn packet_info_header(packet: &[u8]) -> [u8; PACKET_INFO_LEN] {
    let is_v6 = packet.first().map(|b| b >> 4 == 6).unwrap_or(false);

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        let family = if is_v6 { libc::AF_INET6 } else { libc::AF_INET };
        (family as u32).to_be_bytes()
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    {
        let ethertype: u16 = if is_v6 { 0x86DD } else { 0x0800 };
        let [hi, lo] = ethertype.to_be_bytes();
        [0, 0, hi, lo]
    }
}

#[async_trait]
impl TunDevice for FdDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let mut header = [0u8; PACKET_INFO_LEN];

        loop {
            let mut guard = self.fd.readable().await?;

            let result = guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = if self.packet_info {
                    let iov = [
                        libc::iovec {
                            iov_base: header.as_mut_ptr().cast(),
                            iov_len: header.len(),
                        },
                        libc::iovec {
                            iov_base: buf.as_mut_ptr().cast(),
                            iov_len: buf.len(),
                        },
                    ];
                    // SAFETY: both iovecs point at live, writable buffers.
                    unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) }
                } else {
                    // SAFETY: reading into a valid buffer.
                    unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) }
                };

                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });

            match result {
                Ok(Ok(n)) if self.packet_info => return Ok(n.saturating_sub(PACKET_INFO_LEN)),
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        let header = packet_info_header(packet);

        loop {
            let mut guard = self.fd.writable().await?;

            let result = guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = if self.packet_info {
                    let iov = [
                        libc::iovec {
                            iov_base: header.as_ptr() as *mut libc::c_void,
                            iov_len: header.len(),
                        },
                        libc::iovec {
                            iov_base: packet.as_ptr() as *mut libc::c_void,
                            iov_len: packet.len(),
                        },
                    ];
                    // SAFETY: writev only reads through the iovecs.
                    unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) }
                } else {
                    // SAFETY: writing from a valid buffer.
                    unsafe { libc::write(fd, packet.as_ptr().cast(), packet.len()) }
                };

                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });

            match result {
                Ok(Ok(n)) if self.packet_info => return Ok(n.saturating_sub(PACKET_INFO_LEN)),
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}
