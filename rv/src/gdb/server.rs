//! The GDB RSP server: bind/listen/accept, and the per-connection session
//! loop that dispatches packets against the [`Cpu`]/[`Memory`] pair.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Socket, Type};

use crate::cpu::{Cpu, StepResult};
use crate::memory::{Memory, MemoryFault};
use crate::syscall::HostIo;

use super::bytebuffer::ByteBuffer;
use super::codec::RspCodec;
use super::error::GdbError;

const NUM_REGS: usize = 32;

/// Only one GDB client is ever served at a time; a backlog of 1 is enough.
const LISTEN_BACKLOG: i32 = 1;

/// Accepts exactly one connection at a time on the given port.
pub struct GdbServer {
    listener: TcpListener,
}

impl GdbServer {
    /// Creates the listening socket, sets `SO_REUSEADDR`, binds, and
    /// listens with a backlog of 1 — a quick local restart must not fail
    /// with `EADDRINUSE` while the previous session's socket lingers in
    /// `TIME_WAIT`.
    pub fn bind(port: u16) -> Result<Self, GdbError> {
        let socket =
            Socket::new(Domain::IPV4, Type::STREAM, None).map_err(GdbError::CreateSocketError)?;
        socket
            .set_reuse_address(true)
            .map_err(GdbError::CreateSocketError)?;

        let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
        socket.bind(&addr.into()).map_err(GdbError::BindError)?;
        socket.listen(LISTEN_BACKLOG).map_err(GdbError::ListenError)?;

        let listener: TcpListener = socket.into();
        tracing::info!(port, "listening for GDB connections");
        Ok(GdbServer { listener })
    }

    pub fn accept(&self) -> Result<TcpStream, GdbError> {
        let (stream, addr) = self.listener.accept().map_err(GdbError::BindError)?;
        tracing::info!(%addr, "accepted GDB connection");
        Ok(stream)
    }

    /// The bound local address, useful for tests that bind to port 0 and
    /// need to discover the ephemeral port the OS assigned.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, GdbError> {
        self.listener.local_addr().map_err(GdbError::BindError)
    }
}

/// Per-connection state: the owned CPU and memory, the packet codec, and
/// the ack/no-ack negotiation state.
pub struct Session<'a> {
    codec: RspCodec,
    cpu: &'a mut Cpu,
    mem: &'a mut Memory,
    host: &'a mut dyn HostIo,
    no_ack_mode: bool,
    stop_signal: String,
    running: Arc<AtomicBool>,
}

impl<'a> Session<'a> {
    pub fn new(
        stream: TcpStream,
        cpu: &'a mut Cpu,
        mem: &'a mut Memory,
        host: &'a mut dyn HostIo,
        running: Arc<AtomicBool>,
    ) -> Self {
        Session {
            codec: RspCodec::new(stream),
            cpu,
            mem,
            host,
            no_ack_mode: false,
            stop_signal: "S05".to_string(),
            running,
        }
    }

    /// Runs the session loop until the client disconnects or the process
    /// receives SIGINT.
    pub fn run(&mut self) -> Result<(), GdbError> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                tracing::debug!("SIGINT received, ending session");
                return Ok(());
            }

            let (payload, expected_checksum) = match self.codec.receive_packet() {
                Ok(p) => p,
                Err(GdbError::UnexpectedEof) => {
                    tracing::debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if !self.no_ack_mode {
                let actual = super::bytebuffer::checksum(&payload);
                if actual != expected_checksum {
                    self.codec.send_nack()?;
                    continue;
                }
                self.codec.send_ack()?;
            }

            let response = match self.handle_packet(&payload) {
                Ok(resp) => resp,
                Err(fault) => {
                    tracing::error!(error = %fault, "fatal memory fault, terminating session");
                    return Ok(());
                }
            };
            self.codec.send_response(response.as_bytes(), self.no_ack_mode)?;
        }
    }

    fn handle_packet(&mut self, payload: &[u8]) -> Result<ByteBuffer, MemoryFault> {
        let packet = String::from_utf8_lossy(payload).into_owned();
        tracing::trace!(packet = %packet, "received packet");

        let mut resp = ByteBuffer::new();

        if packet.starts_with("qSupported") {
            resp.push_str("QStartNoAckMode+");
        } else if packet == "QStartNoAckMode" {
            self.no_ack_mode = true;
            resp.push_str("OK");
        } else if packet == "qfThreadInfo" {
            resp.push_str("m1");
        } else if packet == "qsThreadInfo" {
            resp.push('l');
        } else if packet == "qC" {
            resp.push_str("QC1");
        } else if packet.starts_with('q') || packet.starts_with('Q') {
            // unsupported query, empty response
        } else if packet == "vCont?" {
            resp.push_str("vCont;c;s;t");
        } else if packet.starts_with('v') {
            // unsupported v-packet, empty response
        } else if packet == "?" {
            resp.push_str(&self.stop_signal);
        } else if packet.starts_with("Hg") || packet.starts_with("Hc") {
            resp.push_str("OK");
        } else if packet == "g" {
            self.encode_registers(&mut resp);
        } else if let Some(hex) = packet.strip_prefix('G') {
            self.write_registers(hex, &mut resp);
        } else if let Some(rest) = packet.strip_prefix('m') {
            self.read_memory(rest, &mut resp);
        } else if let Some(rest) = packet.strip_prefix('M') {
            self.write_memory(rest, &mut resp);
        } else if packet == "s" {
            self.step_one(&mut resp)?;
        } else if packet == "c" {
            self.continue_run(&mut resp)?;
        }
        // else: unsupported packet, empty response

        Ok(resp)
    }

    fn encode_registers(&self, resp: &mut ByteBuffer) {
        for &r in self.cpu.regs().iter() {
            resp.push_hex_u32_le(r);
        }
        resp.push_hex_u32_le(self.cpu.pc);
    }

    fn write_registers(&mut self, hex: &str, resp: &mut ByteBuffer) {
        let expected_len = 8 * (NUM_REGS + 1);
        if hex.len() != expected_len {
            resp.push_str("E01");
            return;
        }

        let mut regs = [0u32; NUM_REGS];
        for (i, r) in regs.iter_mut().enumerate() {
            *r = parse_hex_u32_le(&hex[i * 8..i * 8 + 8]);
        }
        self.cpu.set_regs(regs);
        self.cpu.pc = parse_hex_u32_le(&hex[NUM_REGS * 8..NUM_REGS * 8 + 8]);

        resp.push_str("OK");
    }

    fn read_memory(&self, rest: &str, resp: &mut ByteBuffer) {
        let Some((addr, len)) = parse_addr_len(rest) else {
            resp.push_str("E01");
            return;
        };

        if (addr as u64) + (len as u64) >= 1u64 << 32 {
            resp.push_str("E14");
            return;
        }

        for i in 0..len {
            match self.mem.read8(addr.wrapping_add(i)) {
                Ok(b) => resp.push_hex_u8(b),
                Err(_) => {
                    resp.push_str("E14");
                    return;
                }
            }
        }
    }

    fn write_memory(&mut self, rest: &str, resp: &mut ByteBuffer) {
        let Some((header, hex)) = rest.split_once(':') else {
            resp.push_str("E01");
            return;
        };
        let Some((addr, len)) = parse_addr_len(header) else {
            resp.push_str("E01");
            return;
        };

        if hex.len() != (len as usize) * 2 {
            resp.push_str("E01");
            return;
        }

        if (addr as u64) + (len as u64) >= 1u64 << 32 {
            resp.push_str("E14");
            return;
        }

        for i in 0..len {
            let byte = parse_hex_u8(&hex[(i as usize) * 2..(i as usize) * 2 + 2]);
            if self.mem.write8(addr.wrapping_add(i), byte).is_err() {
                resp.push_str("E14");
                return;
            }
        }

        resp.push_str("OK");
    }

    /// Steps one instruction. A [`MemoryFault`] is fatal to the session and
    /// is propagated to `run()` instead of being reported as a stop signal.
    fn step_one(&mut self, resp: &mut ByteBuffer) -> Result<(), MemoryFault> {
        match self.cpu.step(self.mem, self.host)? {
            StepResult::IllegalInstruction => self.stop_signal = "S04".to_string(),
            _ => self.stop_signal = "S05".to_string(),
        }
        resp.push_str(&self.stop_signal);
        Ok(())
    }

    /// Runs until `Cpu::step` stops, a `0x03` break byte arrives, or SIGINT
    /// is observed. A [`MemoryFault`] is fatal to the session and is
    /// propagated to `run()` instead of being reported as a stop signal.
    fn continue_run(&mut self, resp: &mut ByteBuffer) -> Result<(), MemoryFault> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                self.stop_signal = "S02".to_string();
                break;
            }

            match self.codec.try_read_break_byte() {
                Ok(true) => {
                    self.stop_signal = "S02".to_string();
                    break;
                }
                Ok(false) => {}
                Err(_) => {
                    self.stop_signal = "S02".to_string();
                    break;
                }
            }

            match self.cpu.step(self.mem, self.host)? {
                StepResult::Continue => continue,
                StepResult::IllegalInstruction => {
                    self.stop_signal = "S04".to_string();
                    break;
                }
                StepResult::Break | StepResult::Exit => {
                    self.stop_signal = "S05".to_string();
                    break;
                }
            }
        }
        resp.push_str(&self.stop_signal);
        Ok(())
    }
}

fn parse_hex_u8(s: &str) -> u8 {
    u8::from_str_radix(s, 16).unwrap_or(0)
}

fn parse_hex_u32_le(s: &str) -> u32 {
    let mut bytes = [0u8; 4];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = parse_hex_u8(&s[i * 2..i * 2 + 2]);
    }
    u32::from_le_bytes(bytes)
}

fn parse_addr_len(s: &str) -> Option<(u32, u32)> {
    let (addr, len) = s.split_once(',')?;
    let addr = u32::from_str_radix(addr, 16).ok()?;
    let len = u32::from_str_radix(len, 16).ok()?;
    Some((addr, len))
}
