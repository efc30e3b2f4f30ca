//! Framing and descriptor passing over Unix stream sockets.
//!
//! Every message on a pool channel is an 8-byte big-endian length followed by
//! that many payload bytes. Reads are all-or-nothing: a peer that disappears
//! mid-frame yields [`PrewarmError::ShortRead`], never a partial payload.
//!
//! Two things travel unframed: the handshake acknowledgement, a bare
//! [`ACK`] byte, and the slot handoff, a single sentinel byte with a
//! descriptor attached as `SCM_RIGHTS` ancillary data.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{PrewarmError, Result};

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 8;

/// Largest payload accepted from a peer (64 MiB).
pub const MAX_FRAME: u64 = 64 * 1024 * 1024;

/// The handshake acknowledgement byte. Sent bare, without a length prefix.
pub const ACK: u8 = 0x01;

/// Byte carried alongside a handed-off descriptor.
const HANDOFF_SENTINEL: u8 = 0x01;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

/// Fill `buf` completely, or report how far we got.
///
/// Returns `Ok(false)` if the peer closed before the first byte, so callers
/// can tell a clean hang-up from a torn frame.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]) {
            Ok(0) if got == 0 => return Ok(false),
            Ok(0) => {
                return Err(PrewarmError::ShortRead {
                    expected: buf.len(),
                    got,
                });
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Read one frame. `Ok(None)` means the peer hung up between frames.
pub fn read_frame_opt<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; LEN_PREFIX];
    if !fill(reader, &mut prefix)? {
        return Ok(None);
    }

    let len = u64::from_be_bytes(prefix);
    if len > MAX_FRAME {
        return Err(PrewarmError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME
        )));
    }

    let mut payload = vec![0u8; len as usize];
    if !payload.is_empty() && !fill(reader, &mut payload)? {
        return Err(PrewarmError::ShortRead {
            expected: payload.len(),
            got: 0,
        });
    }
    Ok(Some(payload))
}

/// Read one frame; hanging up is an error here.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    read_frame_opt(reader)?.ok_or(PrewarmError::ShortRead {
        expected: LEN_PREFIX,
        got: 0,
    })
}

/// Write one frame and flush it.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(LEN_PREFIX + payload.len());
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and decode it as JSON.
pub fn read_json<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<T> {
    let payload = read_frame(reader)?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Like [`read_json`], but a hang-up before the frame yields `Ok(None)`.
pub fn read_json_opt<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<Option<T>> {
    match read_frame_opt(reader)? {
        Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        None => Ok(None),
    }
}

/// Encode `value` as JSON and write it as one frame.
pub fn write_json<T: Serialize, W: Write>(writer: &mut W, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_frame(writer, &payload)
}

pub fn write_ack<W: Write>(writer: &mut W) -> Result<()> {
    writer.write_all(&[ACK])?;
    writer.flush()?;
    Ok(())
}

/// Read one bare byte and require it to be [`ACK`].
pub fn read_ack<R: Read>(reader: &mut R) -> Result<()> {
    let mut byte = [0u8; 1];
    if !fill(reader, &mut byte)? {
        return Err(PrewarmError::ShortRead {
            expected: 1,
            got: 0,
        });
    }
    if byte[0] != ACK {
        return Err(PrewarmError::Protocol(format!(
            "expected acknowledgement 0x{:02x}, got 0x{:02x}",
            ACK, byte[0]
        )));
    }
    Ok(())
}

/// Hand `fd` to the peer of `conn`.
pub fn send_fd(conn: &UnixStream, fd: BorrowedFd<'_>) -> Result<()> {
    let sentinel = [HANDOFF_SENTINEL];
    let iov = [IoSlice::new(&sentinel)];
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    loop {
        match sendmsg::<()>(conn.as_raw_fd(), &iov, &cmsgs, SEND_FLAGS, None) {
            Ok(0) => return Err(PrewarmError::Handoff("peer accepted no data".into())),
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(PrewarmError::Handoff(format!("sendmsg: {}", e))),
        }
    }
}

/// Receive exactly one descriptor sent with [`send_fd`].
pub fn recv_fd(conn: &UnixStream) -> Result<OwnedFd> {
    let mut sentinel = [0u8; 1];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    let (bytes, raw_fds) = loop {
        let mut iov = [IoSliceMut::new(&mut sentinel)];
        match recvmsg::<()>(
            conn.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        ) {
            Ok(msg) => {
                let mut fds = Vec::new();
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received);
                    }
                }
                break (msg.bytes, fds);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(PrewarmError::Handoff(format!("recvmsg: {}", e))),
        }
    };

    // Safety: SCM_RIGHTS installed these descriptors in this process for us.
    let mut fds: Vec<OwnedFd> = raw_fds
        .into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();

    if bytes == 0 && fds.is_empty() {
        return Err(PrewarmError::Handoff(
            "pool closed the connection without handing off a slot".into(),
        ));
    }
    if fds.len() != 1 {
        return Err(PrewarmError::Handoff(format!(
            "expected one descriptor, got {}",
            fds.len()
        )));
    }
    Ok(fds.remove(0))
}
