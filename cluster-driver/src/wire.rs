//! Binary framing shared by info and command exchanges.
//!
//! Every frame starts with an 8-byte proto header: version, message type and
//! a 48-bit big-endian body size. Command bodies then carry a fixed 22-byte
//! message header followed by typed fields and bin operations. All integers
//! are big-endian.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::digest::{DIGEST_LEN, Digest, digest};
use crate::error::{Error, Result, ResultCode};
use crate::value::Value;

pub const PROTO_VERSION: u8 = 2;
pub const PROTO_HEADER_LEN: usize = 8;
pub const MSG_HEADER_LEN: usize = 22;

/// Upper bound on a body we are willing to allocate for.
pub const MAX_BODY_SIZE: u64 = 128 * 1024 * 1024;

pub mod message_type {
    pub const INFO: u8 = 1;
    pub const COMMAND: u8 = 3;
}

pub mod info1 {
    pub const READ: u8 = 1 << 0;
    pub const GET_ALL: u8 = 1 << 1;
}

pub mod info2 {
    pub const WRITE: u8 = 1 << 0;
}

pub mod field_type {
    pub const NAMESPACE: u8 = 0;
    pub const SET: u8 = 1;
    pub const KEY: u8 = 2;
    pub const DIGEST: u8 = 4;
}

pub mod op_type {
    pub const READ: u8 = 1;
    pub const WRITE: u8 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoHeader {
    pub version: u8,
    pub kind: u8,
    pub size: u64,
}

impl ProtoHeader {
    pub fn new(kind: u8, size: usize) -> Self {
        Self {
            version: PROTO_VERSION,
            kind,
            size: size as u64,
        }
    }

    pub fn encode(&self) -> [u8; PROTO_HEADER_LEN] {
        let word = (u64::from(self.version) << 56)
            | (u64::from(self.kind) << 48)
            | (self.size & 0x0000_ffff_ffff_ffff);
        word.to_be_bytes()
    }

    /// Parses a header and checks it is something we can read a body for.
    pub fn decode(bytes: [u8; PROTO_HEADER_LEN], expected_kind: u8) -> Result<Self> {
        let word = u64::from_be_bytes(bytes);
        let header = Self {
            version: (word >> 56) as u8,
            kind: (word >> 48) as u8,
            size: word & 0x0000_ffff_ffff_ffff,
        };
        if header.version != PROTO_VERSION {
            return Err(Error::protocol(format!(
                "unsupported proto version {}",
                header.version
            )));
        }
        if header.kind != expected_kind {
            return Err(Error::protocol(format!(
                "expected message type {expected_kind}, got {}",
                header.kind
            )));
        }
        if header.size > MAX_BODY_SIZE {
            return Err(Error::protocol(format!("body too large: {}", header.size)));
        }
        Ok(header)
    }
}

/// Wraps `body` in a proto header of type `kind`.
pub fn frame(kind: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PROTO_HEADER_LEN + body.len());
    buf.put_slice(&ProtoHeader::new(kind, body.len()).encode());
    buf.put_slice(body);
    buf.freeze()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub result_code: ResultCode,
    pub generation: u32,
    pub record_ttl: u32,
    pub transaction_ttl: u32,
    pub n_fields: u16,
    pub n_ops: u16,
}

impl MessageHeader {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(MSG_HEADER_LEN as u8);
        buf.put_u8(self.info1);
        buf.put_u8(self.info2);
        buf.put_u8(self.info3);
        buf.put_u8(0);
        buf.put_u8(self.result_code);
        buf.put_u32(self.generation);
        buf.put_u32(self.record_ttl);
        buf.put_u32(self.transaction_ttl);
        buf.put_u16(self.n_fields);
        buf.put_u16(self.n_ops);
    }

    pub fn read_from(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < MSG_HEADER_LEN {
            return Err(Error::protocol("truncated message header"));
        }
        let header_len = buf.get_u8() as usize;
        if header_len != MSG_HEADER_LEN {
            return Err(Error::protocol(format!("unexpected header size {header_len}")));
        }
        let info1 = buf.get_u8();
        let info2 = buf.get_u8();
        let info3 = buf.get_u8();
        let _unused = buf.get_u8();
        Ok(Self {
            info1,
            info2,
            info3,
            result_code: buf.get_u8(),
            generation: buf.get_u32(),
            record_ttl: buf.get_u32(),
            transaction_ttl: buf.get_u32(),
            n_fields: buf.get_u16(),
            n_ops: buf.get_u16(),
        })
    }
}

fn put_field(buf: &mut BytesMut, kind: u8, data: &[u8]) {
    buf.put_u32(data.len() as u32 + 1);
    buf.put_u8(kind);
    buf.put_slice(data);
}

fn put_op(buf: &mut BytesMut, op: u8, name: &str, value: &Value) {
    let payload = value.to_bytes();
    buf.put_u32((4 + name.len() + payload.len()) as u32);
    buf.put_u8(op);
    buf.put_u8(value.particle_type());
    buf.put_u8(0);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    buf.put_slice(&payload);
}

/// Bin names travel with a one-byte length.
fn check_bin_name(name: &str) -> Result<()> {
    if name.len() > u8::MAX as usize {
        return Err(Error::client(format!("bin name too long: {name}")));
    }
    Ok(())
}

/// A single-record command ready to be compiled.
#[derive(Debug, Clone)]
pub struct Command {
    namespace: String,
    set: String,
    digest: Digest,
    key: Option<Value>,
    read_bins: Vec<String>,
    write_bins: Vec<(String, Value)>,
}

impl Command {
    /// Reads all bins of the record at `key`.
    pub fn get(namespace: &str, set: &str, key: Value) -> Result<Self> {
        Self::new(namespace, set, key)
    }

    /// Reads only the named bins.
    pub fn get_bins(namespace: &str, set: &str, key: Value, bins: &[&str]) -> Result<Self> {
        bins.iter().try_for_each(|name| check_bin_name(name))?;
        let mut command = Self::new(namespace, set, key)?;
        command.read_bins = bins.iter().map(|b| b.to_string()).collect();
        Ok(command)
    }

    /// Writes `bins` to the record at `key`.
    pub fn put(namespace: &str, set: &str, key: Value, bins: Vec<(String, Value)>) -> Result<Self> {
        if bins.is_empty() {
            return Err(Error::client("put requires at least one bin"));
        }
        bins.iter().try_for_each(|(name, _)| check_bin_name(name))?;
        let mut command = Self::new(namespace, set, key)?;
        command.write_bins = bins;
        Ok(command)
    }

    fn new(namespace: &str, set: &str, key: Value) -> Result<Self> {
        if namespace.is_empty() {
            return Err(Error::client("namespace must not be empty"));
        }
        let digest = digest(set, &key)?;
        Ok(Self {
            namespace: namespace.to_string(),
            set: set.to_string(),
            digest,
            key: Some(key),
            read_bins: Vec::new(),
            write_bins: Vec::new(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn is_write(&self) -> bool {
        !self.write_bins.is_empty()
    }

    /// Encodes the full frame, proto header included.
    pub fn compile(&self, timeout: Duration) -> Bytes {
        let mut body = BytesMut::with_capacity(self.estimate_size());

        let mut n_fields = 2;
        if !self.set.is_empty() {
            n_fields += 1;
        }
        if self.key.is_some() {
            n_fields += 1;
        }

        let (info1, info2, n_ops) = if self.is_write() {
            (0, info2::WRITE, self.write_bins.len())
        } else if self.read_bins.is_empty() {
            (info1::READ | info1::GET_ALL, 0, 0)
        } else {
            (info1::READ, 0, self.read_bins.len())
        };

        MessageHeader {
            info1,
            info2,
            transaction_ttl: timeout.as_millis().min(u32::MAX as u128) as u32,
            n_fields,
            n_ops: n_ops as u16,
            ..Default::default()
        }
        .write_to(&mut body);

        put_field(&mut body, field_type::NAMESPACE, self.namespace.as_bytes());
        if !self.set.is_empty() {
            put_field(&mut body, field_type::SET, self.set.as_bytes());
        }
        if let Some(key) = &self.key {
            let mut data = Vec::with_capacity(1 + 8);
            data.push(key.particle_type());
            data.extend_from_slice(&key.to_bytes());
            put_field(&mut body, field_type::KEY, &data);
        }
        put_field(&mut body, field_type::DIGEST, self.digest.as_bytes());

        for name in &self.read_bins {
            put_op(&mut body, op_type::READ, name, &Value::Nil);
        }
        for (name, value) in &self.write_bins {
            put_op(&mut body, op_type::WRITE, name, value);
        }

        frame(message_type::COMMAND, &body)
    }

    fn estimate_size(&self) -> usize {
        let fields = self.namespace.len() + self.set.len() + DIGEST_LEN + 32;
        let ops: usize = self
            .write_bins
            .iter()
            .map(|(name, _)| name.len() + 24)
            .chain(self.read_bins.iter().map(|name| name.len() + 8))
            .sum();
        MSG_HEADER_LEN + fields + ops
    }
}

/// A decoded command response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Response {
    pub result_code: ResultCode,
    pub generation: u32,
    pub expiration: u32,
    pub bins: BTreeMap<String, Value>,
}

/// Decodes a command response body (the bytes after the proto header).
pub fn decode_response(body: &[u8]) -> Result<Response> {
    let mut buf = body;
    let header = MessageHeader::read_from(&mut buf)?;

    for _ in 0..header.n_fields {
        if buf.remaining() < 4 {
            return Err(Error::protocol("truncated field"));
        }
        let size = buf.get_u32() as usize;
        if size == 0 || buf.remaining() < size {
            return Err(Error::protocol("field overruns body"));
        }
        buf.advance(size);
    }

    let mut bins = BTreeMap::new();
    for _ in 0..header.n_ops {
        if buf.remaining() < 8 {
            return Err(Error::protocol("truncated op"));
        }
        let size = buf.get_u32() as usize;
        let _op = buf.get_u8();
        let particle_type = buf.get_u8();
        let _version = buf.get_u8();
        let name_len = buf.get_u8() as usize;
        if size < 4 + name_len || buf.remaining() < size - 4 {
            return Err(Error::protocol("op overruns body"));
        }
        let name = String::from_utf8(buf[..name_len].to_vec())
            .map_err(|_| Error::protocol("bin name is not UTF-8"))?;
        buf.advance(name_len);
        let value_len = size - 4 - name_len;
        let value = Value::from_bytes(particle_type, &buf[..value_len]).ok_or_else(|| {
            Error::protocol(format!("bad value for bin '{name}' (type {particle_type})"))
        })?;
        buf.advance(value_len);
        bins.insert(name, value);
    }

    Ok(Response {
        result_code: header.result_code,
        generation: header.generation,
        expiration: header.record_ttl,
        bins,
    })
}

/// Encodes a response body the way a server would. Used by tools and tests.
pub fn encode_response(response: &Response) -> Bytes {
    let mut body = BytesMut::new();
    MessageHeader {
        result_code: response.result_code,
        generation: response.generation,
        record_ttl: response.expiration,
        n_ops: response.bins.len() as u16,
        ..Default::default()
    }
    .write_to(&mut body);
    for (name, value) in &response.bins {
        put_op(&mut body, op_type::READ, name, value);
    }
    frame(message_type::COMMAND, &body)
}

/// Parsed request fields a server needs to route and answer a command.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCommand {
    pub header: MessageHeader,
    pub namespace: Option<String>,
    pub digest: Option<Digest>,
    pub bins: Vec<(String, Value)>,
}

/// Decodes a command request body. Used by tools and tests that play server.
pub fn decode_command(body: &[u8]) -> Result<DecodedCommand> {
    let mut buf = body;
    let header = MessageHeader::read_from(&mut buf)?;
    let mut namespace = None;
    let mut digest = None;

    for _ in 0..header.n_fields {
        if buf.remaining() < 5 {
            return Err(Error::protocol("truncated field"));
        }
        let size = buf.get_u32() as usize;
        if size == 0 || buf.remaining() < size {
            return Err(Error::protocol("field overruns body"));
        }
        let kind = buf.get_u8();
        let data = &buf[..size - 1];
        match kind {
            field_type::NAMESPACE => namespace = Some(String::from_utf8_lossy(data).into_owned()),
            field_type::DIGEST if data.len() == DIGEST_LEN => {
                let mut bytes = [0u8; DIGEST_LEN];
                bytes.copy_from_slice(data);
                digest = Some(Digest::from_bytes(bytes));
            }
            _ => {}
        }
        buf.advance(size - 1);
    }

    let mut bins = Vec::new();
    for _ in 0..header.n_ops {
        if buf.remaining() < 8 {
            return Err(Error::protocol("truncated op"));
        }
        let size = buf.get_u32() as usize;
        let _op = buf.get_u8();
        let particle_type = buf.get_u8();
        let _version = buf.get_u8();
        let name_len = buf.get_u8() as usize;
        if size < 4 + name_len || buf.remaining() < size - 4 {
            return Err(Error::protocol("op overruns body"));
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        buf.advance(name_len);
        let value_len = size - 4 - name_len;
        let value = Value::from_bytes(particle_type, &buf[..value_len]).unwrap_or(Value::Nil);
        buf.advance(value_len);
        bins.push((name, value));
    }

    Ok(DecodedCommand {
        header,
        namespace,
        digest,
        bins,
    })
}
