//! Byte-stream seam between the runtime and the sockets underneath it.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use crate::error::Result;

/// The socket-like surface the transport consumes: buffered reads and
/// writes, a raw descriptor for the multiplexed wait, orderly shutdown and
/// blocking-mode control.
pub trait Stream: Read + Write + Send + AsRawFd {
    fn shutdown(&mut self) -> Result<()>;
    fn set_nonblocking(&mut self, b: bool) -> Result<()>;
}

impl Stream for UnixStream {
    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }

    fn set_nonblocking(&mut self, b: bool) -> Result<()> {
        UnixStream::set_nonblocking(self, b)?;
        Ok(())
    }
}

impl Stream for TcpStream {
    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }

    fn set_nonblocking(&mut self, b: bool) -> Result<()> {
        TcpStream::set_nonblocking(self, b)?;
        Ok(())
    }
}
