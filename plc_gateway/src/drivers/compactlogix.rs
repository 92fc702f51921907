use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::drivers::traits::{
    DriverConfig, DriverError, DriverResult, PlcDriver, RawValue, ReadBatch,
};

const ENIP_PORT: u16 = 44818;

// EtherNet/IP encapsulation commands
const CMD_REGISTER_SESSION: u16 = 0x0065;
const CMD_UNREGISTER_SESSION: u16 = 0x0066;
const CMD_SEND_RR_DATA: u16 = 0x006F;

// CIP services
const SVC_READ_TAG: u8 = 0x4C;
const SVC_WRITE_TAG: u8 = 0x4D;

// CIP elementary type codes
const TYPE_BOOL: u16 = 0x00C1;
const TYPE_SINT: u16 = 0x00C2;
const TYPE_INT: u16 = 0x00C3;
const TYPE_DINT: u16 = 0x00C4;
const TYPE_LINT: u16 = 0x00C5;
const TYPE_REAL: u16 = 0x00CA;
const TYPE_LREAL: u16 = 0x00CB;

/// EtherNet/IP (CIP) driver for CompactLogix controllers.
///
/// Speaks unconnected messaging: one registered session per connection,
/// symbolic Read Tag / Write Tag requests carried in SendRRData frames.
pub struct CompactLogixDriver {
    config: DriverConfig,
    session: Option<Session>,
}

struct Session {
    stream: TcpStream,
    handle: u32,
}

impl CompactLogixDriver {
    pub fn new(config: DriverConfig) -> Self {
        CompactLogixDriver {
            config,
            session: None,
        }
    }

    fn endpoint(&self) -> String {
        if self.config.endpoint.contains(':') {
            self.config.endpoint.clone()
        } else {
            format!("{}:{ENIP_PORT}", self.config.endpoint)
        }
    }

    /// Build a symbolic EPATH for a tag name; dotted names become one ANSI
    /// extended symbol segment per member.
    fn epath(address: &str) -> DriverResult<Vec<u8>> {
        if address.is_empty() {
            return Err(DriverError::Address(address.to_string()));
        }
        let mut path = Vec::new();
        for segment in address.split('.') {
            let bytes = segment.as_bytes();
            if bytes.is_empty() || bytes.len() > u8::MAX as usize {
                return Err(DriverError::Address(address.to_string()));
            }
            path.push(0x91); // ANSI extended symbol segment
            path.push(bytes.len() as u8);
            path.extend_from_slice(bytes);
            if bytes.len() % 2 == 1 {
                path.push(0x00); // pad to word boundary
            }
        }
        Ok(path)
    }

    /// One encapsulated request/response round trip over the session.
    async fn transact(&mut self, cip: Vec<u8>) -> DriverResult<Vec<u8>> {
        let io_timeout = self.config.socket_timeout;
        let session = self.session.as_mut().ok_or(DriverError::NotConnected)?;

        // SendRRData payload: interface handle, timeout, CPF items
        // (null address item + unconnected data item carrying the CIP request).
        let mut payload = Vec::with_capacity(16 + cip.len());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&10u16.to_le_bytes());
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&0x0000u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&0x00B2u16.to_le_bytes());
        payload.extend_from_slice(&(cip.len() as u16).to_le_bytes());
        payload.extend_from_slice(&cip);

        let frame = encap_frame(CMD_SEND_RR_DATA, session.handle, &payload);
        let round_trip = async {
            session.stream.write_all(&frame).await?;
            recv_encap(&mut session.stream).await
        };

        let (status, reply) = match timeout(io_timeout, round_trip).await {
            Ok(Ok((_, status, payload))) => (status, payload),
            Ok(Err(e)) => {
                self.session = None;
                return Err(DriverError::Read(e.to_string()));
            }
            Err(_) => {
                self.session = None;
                return Err(DriverError::Timeout(io_timeout));
            }
        };
        if status != 0 {
            self.session = None;
            return Err(DriverError::Read(format!("encapsulation status {status:#06x}")));
        }
        // Strip interface handle + timeout, then walk the CPF items to the
        // unconnected data item.
        let body = reply
            .get(6..)
            .ok_or_else(|| DriverError::Read("short SendRRData reply".to_string()))?;
        let count = read_u16(body, 0)? as usize;
        let mut offset = 2;
        for _ in 0..count {
            let item_type = read_u16(body, offset)?;
            let item_len = read_u16(body, offset + 2)? as usize;
            offset += 4;
            let data = body
                .get(offset..offset + item_len)
                .ok_or_else(|| DriverError::Read("truncated CPF item".to_string()))?;
            if item_type == 0x00B2 {
                return Ok(data.to_vec());
            }
            offset += item_len;
        }
        Err(DriverError::Read("no data item in reply".to_string()))
    }

    async fn read_one(&mut self, address: &str) -> DriverResult<RawValue> {
        let path = Self::epath(address)?;
        let mut cip = Vec::with_capacity(4 + path.len());
        cip.push(SVC_READ_TAG);
        cip.push((path.len() / 2) as u8);
        cip.extend_from_slice(&path);
        cip.extend_from_slice(&1u16.to_le_bytes()); // element count

        let reply = self.transact(cip).await?;
        let data = check_cip_reply(&reply, SVC_READ_TAG)?;
        decode_typed_value(data, address)
    }
}

fn encap_frame(command: u16, session: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(24 + payload.len());
    frame.extend_from_slice(&command.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&session.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes()); // status
    frame.extend_from_slice(&[0u8; 8]); // sender context
    frame.extend_from_slice(&0u32.to_le_bytes()); // options
    frame.extend_from_slice(payload);
    frame
}

/// Receive one encapsulated frame; returns (session handle, status, payload).
async fn recv_encap(stream: &mut TcpStream) -> std::io::Result<(u32, u32, Vec<u8>)> {
    let mut header = [0u8; 24];
    stream.read_exact(&mut header).await?;
    let length = u16::from_le_bytes([header[2], header[3]]) as usize;
    let session = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let status = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;
    Ok((session, status, payload))
}

fn read_u16(buf: &[u8], offset: usize) -> DriverResult<u16> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| DriverError::Read("short frame".to_string()))
}

/// Validate the CIP reply envelope and return the service data.
fn check_cip_reply(reply: &[u8], service: u8) -> DriverResult<&[u8]> {
    if reply.len() < 4 {
        return Err(DriverError::Read("short CIP reply".to_string()));
    }
    if reply[0] != service | 0x80 {
        return Err(DriverError::Read(format!(
            "unexpected reply service {:#04x}",
            reply[0]
        )));
    }
    let general_status = reply[2];
    let extended_words = reply[3] as usize;
    if general_status != 0 {
        return Err(DriverError::Read(format!(
            "CIP general status {general_status:#04x}"
        )));
    }
    reply
        .get(4 + extended_words * 2..)
        .ok_or_else(|| DriverError::Read("short CIP reply".to_string()))
}

fn decode_typed_value(data: &[u8], address: &str) -> DriverResult<RawValue> {
    let type_code = read_u16(data, 0)?;
    let v = &data[2..];
    let short = || DriverError::Read(format!("short data for {address}"));
    match type_code {
        TYPE_BOOL => Ok(RawValue::Bool(*v.first().ok_or_else(short)? != 0)),
        TYPE_SINT => Ok(RawValue::Int(
            i8::from_le_bytes([*v.first().ok_or_else(short)?]) as i64,
        )),
        TYPE_INT => {
            let b = v.get(..2).ok_or_else(short)?;
            Ok(RawValue::Int(i16::from_le_bytes([b[0], b[1]]) as i64))
        }
        TYPE_DINT => {
            let b = v.get(..4).ok_or_else(short)?;
            Ok(RawValue::Int(
                i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64
            ))
        }
        TYPE_LINT => {
            let b = v.get(..8).ok_or_else(short)?;
            let mut a = [0u8; 8];
            a.copy_from_slice(b);
            Ok(RawValue::Int(i64::from_le_bytes(a)))
        }
        TYPE_REAL => {
            let b = v.get(..4).ok_or_else(short)?;
            Ok(RawValue::Real(
                f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64
            ))
        }
        TYPE_LREAL => {
            let b = v.get(..8).ok_or_else(short)?;
            let mut a = [0u8; 8];
            a.copy_from_slice(b);
            Ok(RawValue::Real(f64::from_le_bytes(a)))
        }
        other => Err(DriverError::Address(format!(
            "{address}: unsupported CIP type {other:#06x}"
        ))),
    }
}

fn encode_typed_value(value: &RawValue) -> DriverResult<(u16, Vec<u8>)> {
    match value {
        RawValue::Bool(b) => Ok((TYPE_BOOL, vec![if *b { 0xFF } else { 0x00 }])),
        RawValue::Int(i) => {
            let v = i32::try_from(*i)
                .map_err(|_| DriverError::Write(format!("{i} out of DINT range")))?;
            Ok((TYPE_DINT, v.to_le_bytes().to_vec()))
        }
        RawValue::Real(f) => Ok((TYPE_REAL, (*f as f32).to_le_bytes().to_vec())),
        RawValue::Text(_) => Err(DriverError::Write(
            "STRING writes not supported".to_string(),
        )),
    }
}

#[async_trait]
impl PlcDriver for CompactLogixDriver {
    fn config(&self) -> &DriverConfig {
        &self.config
    }

    async fn connect(&mut self) -> DriverResult<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let io_timeout = self.config.socket_timeout;
        let endpoint = self.endpoint();

        let mut stream = match timeout(io_timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(DriverError::Connect(format!("{endpoint}: {e}"))),
            Err(_) => return Err(DriverError::Timeout(io_timeout)),
        };

        // RegisterSession: protocol version 1, no option flags.
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        let frame = encap_frame(CMD_REGISTER_SESSION, 0, &payload);

        let registered = async {
            stream.write_all(&frame).await?;
            recv_encap(&mut stream).await
        };
        let (handle, status, _) = match timeout(io_timeout, registered).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(DriverError::Connect(e.to_string())),
            Err(_) => return Err(DriverError::Timeout(io_timeout)),
        };
        if status != 0 {
            return Err(DriverError::Connect(format!(
                "session registration status {status:#06x}"
            )));
        }

        debug!(plc = %self.config.plc, %endpoint, handle, "EtherNet/IP session registered");
        self.session = Some(Session { stream, handle });
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            let frame = encap_frame(CMD_UNREGISTER_SESSION, session.handle, &[]);
            let _ = timeout(self.config.socket_timeout, session.stream.write_all(&frame)).await;
        }
    }

    async fn read(&mut self, addresses: &[String]) -> DriverResult<ReadBatch> {
        if self.session.is_none() {
            return Err(DriverError::NotConnected);
        }
        let mut batch = ReadBatch::new();
        for address in addresses {
            match self.read_one(address).await {
                Ok(value) => {
                    batch.insert(address.clone(), Ok(value));
                }
                // Transport-level faults break the whole batch; CIP-level
                // and address faults stay per-tag.
                Err(e @ (DriverError::Timeout(_) | DriverError::NotConnected)) => return Err(e),
                Err(e) => {
                    if self.session.is_none() {
                        return Err(e);
                    }
                    batch.insert(address.clone(), Err(e));
                }
            }
        }
        Ok(batch)
    }

    async fn write(&mut self, address: &str, value: &RawValue) -> DriverResult<()> {
        let path = Self::epath(address)?;
        let (type_code, data) = encode_typed_value(value)?;
        let mut cip = Vec::with_capacity(8 + path.len() + data.len());
        cip.push(SVC_WRITE_TAG);
        cip.push((path.len() / 2) as u8);
        cip.extend_from_slice(&path);
        cip.extend_from_slice(&type_code.to_le_bytes());
        cip.extend_from_slice(&1u16.to_le_bytes());
        cip.extend_from_slice(&data);

        let reply = self.transact(cip).await.map_err(|e| match e {
            DriverError::Read(m) => DriverError::Write(m),
            other => other,
        })?;
        check_cip_reply(&reply, SVC_WRITE_TAG)
            .map(|_| ())
            .map_err(|e| match e {
                DriverError::Read(m) => DriverError::Write(m),
                other => other,
            })
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}
