//! Minimal Server List Ping framing shared by the liveness probe and the
//! wake listener.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame the protocol allows: a length that fits a 3-byte VarInt.
pub const MAX_PACKET_LEN: usize = 2_097_151;

/// Cap for frames read from untrusted clients, which only ever send small
/// handshake, status and login packets.
pub const MAX_SERVERBOUND_LEN: usize = 32 * 1024;

/// Protocol version sent in handshakes when we are the client.
pub const HANDSHAKE_PROTOCOL: i32 = 47;

pub const NEXT_STATE_STATUS: i32 = 1;
pub const NEXT_STATE_LOGIN: i32 = 2;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7f == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
}

pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<i32> {
    let mut value: u32 = 0;
    for i in 0..5 {
        let byte = reader.read_u8().await?;
        value |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(invalid("varint is too long"))
}

/// Builder for the body of a single packet.
pub struct PacketWriter {
    id: i32,
    body: Vec<u8>,
}

impl PacketWriter {
    pub fn new(id: i32) -> Self {
        Self { id, body: Vec::new() }
    }

    pub fn varint(mut self, value: i32) -> Self {
        write_varint(&mut self.body, value);
        self
    }

    pub fn string(mut self, value: &str) -> Self {
        write_varint(&mut self.body, value.len() as i32);
        self.body.extend_from_slice(value.as_bytes());
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.body.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn i64(mut self, value: i64) -> Self {
        self.body.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Length-prefixed frame ready to be written to the socket.
    pub fn finish(self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.body.len() + 5);
        write_varint(&mut payload, self.id);
        payload.extend_from_slice(&self.body);

        let mut frame = Vec::with_capacity(payload.len() + 5);
        write_varint(&mut frame, payload.len() as i32);
        frame.extend_from_slice(&payload);
        frame
    }

    pub async fn send<W: AsyncWrite + Unpin>(self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.finish()).await?;
        writer.flush().await
    }
}

/// A decoded packet: its id and a cursor over the remaining body.
pub struct Packet {
    pub id: i32,
    body: Vec<u8>,
    pos: usize,
}

impl Packet {
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        Self::read_limited(reader, MAX_PACKET_LEN).await
    }

    pub async fn read_limited<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> io::Result<Self> {
        let len = read_varint(reader).await?;
        if len <= 0 || len as usize > max_len {
            return Err(invalid(format!("bad packet length {len}")));
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;

        let mut packet = Self {
            id: 0,
            body: payload,
            pos: 0,
        };
        packet.id = packet.varint()?;
        Ok(packet)
    }

    fn take(&mut self, n: usize) -> io::Result<&[u8]> {
        if self.pos + n > self.body.len() {
            return Err(invalid("packet ended early"));
        }
        let slice = &self.body[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn varint(&mut self) -> io::Result<i32> {
        let mut value: u32 = 0;
        for i in 0..5 {
            let byte = self.take(1)?[0];
            value |= ((byte & 0x7f) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(invalid("varint is too long"))
    }

    pub fn string(&mut self) -> io::Result<String> {
        let len = self.varint()?;
        if len < 0 {
            return Err(invalid("negative string length"));
        }
        let bytes = self.take(len as usize)?.to_vec();
        String::from_utf8(bytes).map_err(|e| invalid(e.to_string()))
    }

    pub fn u16(&mut self) -> io::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn i64(&mut self) -> io::Result<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(raw))
    }
}

/// The handshake every client opens a connection with.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol: i32,
    pub address: String,
    pub port: u16,
    pub next_state: i32,
}

impl Handshake {
    pub fn writer(&self) -> PacketWriter {
        PacketWriter::new(0x00)
            .varint(self.protocol)
            .string(&self.address)
            .u16(self.port)
            .varint(self.next_state)
    }

    pub fn parse(packet: &mut Packet) -> io::Result<Self> {
        if packet.id != 0x00 {
            return Err(invalid(format!("expected handshake, got packet {:#04x}", packet.id)));
        }
        Ok(Self {
            protocol: packet.varint()?,
            address: packet.string()?,
            port: packet.u16()?,
            next_state: packet.varint()?,
        })
    }
}
