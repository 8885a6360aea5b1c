//! RSP framing: `$payload#cc` packets over a buffered socket reader, plus
//! the ACK/NACK handshake and no-ack-mode negotiation.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

use super::bytebuffer::checksum;
use super::error::GdbError;

const BUF_CAPACITY: usize = 4096;

/// A buffered reader/writer over a client [`TcpStream`], framing RSP
/// packets and performing the ACK/NACK handshake.
pub struct RspCodec {
    stream: TcpStream,
    buf: Vec<u8>,
    pos: usize,
}

impl RspCodec {
    pub fn new(stream: TcpStream) -> Self {
        RspCodec { stream, buf: Vec::new(), pos: 0 }
    }

    fn refill(&mut self) -> std::io::Result<usize> {
        let mut chunk = vec![0u8; BUF_CAPACITY];
        let n = self.stream.read(&mut chunk)?;
        chunk.truncate(n);
        self.buf = chunk;
        self.pos = 0;
        Ok(n)
    }

    fn read_byte(&mut self) -> Result<u8, GdbError> {
        if self.pos >= self.buf.len() {
            let n = self.refill().map_err(GdbError::ReadError)?;
            if n == 0 {
                return Err(GdbError::UnexpectedEof);
            }
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Reads one full `$payload#cc` frame and returns `(payload, expected_checksum)`.
    pub fn receive_packet(&mut self) -> Result<(Vec<u8>, u8), GdbError> {
        loop {
            if self.read_byte()? == b'$' {
                break;
            }
        }

        let mut payload = Vec::new();
        loop {
            let b = self.read_byte()?;
            if b == b'#' {
                break;
            }
            payload.push(b);
        }

        let hi = self.read_byte()?;
        let lo = self.read_byte()?;
        let expected = (hex_val(hi) << 4) | hex_val(lo);

        Ok((payload, expected))
    }

    fn write_all_resilient(&mut self, bytes: &[u8]) -> Result<(), GdbError> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            match self.stream.write(remaining) {
                Ok(0) => return Err(GdbError::WriteError(std::io::Error::from(ErrorKind::WriteZero))),
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(GdbError::WriteError(e)),
            }
        }
        Ok(())
    }

    pub fn send_ack(&mut self) -> Result<(), GdbError> {
        self.write_all_resilient(b"+")
    }

    pub fn send_nack(&mut self) -> Result<(), GdbError> {
        self.write_all_resilient(b"-")
    }

    /// Frames and sends `payload`, retrying the whole frame on a `-` NACK
    /// unless `no_ack_mode` is set.
    pub fn send_response(&mut self, payload: &[u8], no_ack_mode: bool) -> Result<(), GdbError> {
        let mut framed = Vec::with_capacity(payload.len() + 4);
        framed.push(b'$');
        framed.extend_from_slice(payload);
        framed.push(b'#');
        let cc = checksum(payload);
        framed.push(hex_digit(cc >> 4));
        framed.push(hex_digit(cc & 0xF));

        self.write_all_resilient(&framed)?;

        if !no_ack_mode {
            loop {
                let ch = self.read_byte()?;
                if ch == b'+' {
                    break;
                }
                if ch == b'-' {
                    self.write_all_resilient(&framed)?;
                }
            }
        }

        Ok(())
    }

    /// Non-destructively checks for a single unframed `0x03` byte (GDB's
    /// interrupt) without blocking. Drains any already-buffered bytes first.
    pub fn try_read_break_byte(&mut self) -> Result<bool, GdbError> {
        if self.pos < self.buf.len() {
            let b = self.buf[self.pos];
            self.pos += 1;
            return Ok(b == 0x03);
        }

        self.stream.set_nonblocking(true).map_err(GdbError::ReadError)?;
        let mut one = [0u8; 1];
        let result = self.stream.read(&mut one);
        self.stream.set_nonblocking(false).map_err(GdbError::ReadError)?;

        match result {
            Ok(0) => Err(GdbError::UnexpectedEof),
            Ok(_) => Ok(one[0] == 0x03),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(GdbError::ReadError(e)),
        }
    }
}

fn hex_val(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}

fn hex_digit(v: u8) -> u8 {
    b"0123456789abcdef"[(v & 0xF) as usize]
}
