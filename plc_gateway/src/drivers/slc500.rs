use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::drivers::traits::{
    DriverConfig, DriverError, DriverResult, PlcDriver, RawValue, ReadBatch,
};

const CSP_PORT: u16 = 2222;

// CSP (AB/Ethernet) commands
const CMD_REGISTER_SESSION: u16 = 0x0101;
const CMD_PCCC_TRANSFER: u16 = 0x0107;

// PCCC protected typed logical read/write with three address fields
const PCCC_CMD: u8 = 0x0F;
const FNC_READ_3ADDR: u8 = 0xA2;
const FNC_WRITE_3ADDR: u8 = 0xAA;

/// SLC 5/05 data file kinds addressable through this driver.
#[derive(Debug, Clone, Copy, PartialEq)]
enum FileKind {
    Integer, // N, 16-bit words
    Float,   // F, 32-bit IEEE
    Binary,  // B, 16-bit words, bit-addressable
}

impl FileKind {
    fn type_code(self) -> u8 {
        match self {
            FileKind::Binary => 0x85,
            FileKind::Integer => 0x89,
            FileKind::Float => 0x8A,
        }
    }

    fn element_size(self) -> u8 {
        match self {
            FileKind::Integer | FileKind::Binary => 2,
            FileKind::Float => 4,
        }
    }
}

/// A parsed SLC data-file address: `N7:0`, `F8:2`, `B3:4/15`.
#[derive(Debug, Clone, PartialEq)]
struct SlcAddress {
    kind: FileKind,
    file: u8,
    element: u8,
    bit: Option<u8>,
}

impl SlcAddress {
    fn parse(address: &str) -> DriverResult<Self> {
        let bad = || DriverError::Address(address.to_string());
        let mut chars = address.chars();
        let kind = match chars.next().ok_or_else(bad)? {
            'N' | 'n' => FileKind::Integer,
            'F' | 'f' => FileKind::Float,
            'B' | 'b' => FileKind::Binary,
            _ => return Err(bad()),
        };
        let rest = chars.as_str();
        let (file_part, elem_part) = rest.split_once(':').ok_or_else(bad)?;
        let file: u8 = file_part.parse().map_err(|_| bad())?;
        let (elem_part, bit) = match elem_part.split_once('/') {
            Some((e, b)) => {
                let bit: u8 = b.parse().map_err(|_| bad())?;
                if bit > 15 || kind == FileKind::Float {
                    return Err(bad());
                }
                (e, Some(bit))
            }
            None => (elem_part, None),
        };
        let element: u8 = elem_part.parse().map_err(|_| bad())?;
        Ok(SlcAddress {
            kind,
            file,
            element,
            bit,
        })
    }
}

/// DF1/PCCC driver for SLC 5/05 controllers over AB/Ethernet (CSP, TCP 2222).
pub struct Slc500Driver {
    config: DriverConfig,
    session: Option<Session>,
    tns: u16,
}

struct Session {
    stream: TcpStream,
    handle: u32,
}

impl Slc500Driver {
    pub fn new(config: DriverConfig) -> Self {
        Slc500Driver {
            config,
            session: None,
            tns: 0,
        }
    }

    fn endpoint(&self) -> String {
        if self.config.endpoint.contains(':') {
            self.config.endpoint.clone()
        } else {
            format!("{}:{CSP_PORT}", self.config.endpoint)
        }
    }

    fn next_tns(&mut self) -> u16 {
        self.tns = self.tns.wrapping_add(1);
        self.tns
    }

    /// One PCCC command/reply round trip; returns the reply data bytes.
    async fn transact(&mut self, pccc: Vec<u8>) -> DriverResult<Vec<u8>> {
        let io_timeout = self.config.socket_timeout;
        let session = self.session.as_mut().ok_or(DriverError::NotConnected)?;

        let frame = csp_frame(CMD_PCCC_TRANSFER, session.handle, &pccc);
        let round_trip = async {
            session.stream.write_all(&frame).await?;
            recv_csp(&mut session.stream).await
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
            return Err(DriverError::Read(format!("CSP status {status:#06x}")));
        }
        // PCCC reply: cmd | 0x40, sts, tns, data...
        if reply.len() < 4 {
            return Err(DriverError::Read("short PCCC reply".to_string()));
        }
        if reply[1] != 0 {
            return Err(DriverError::Read(format!("PCCC status {:#04x}", reply[1])));
        }
        Ok(reply[4..].to_vec())
    }

    async fn read_one(&mut self, address: &str) -> DriverResult<RawValue> {
        let addr = SlcAddress::parse(address)?;
        let tns = self.next_tns();
        let pccc = pccc_request(FNC_READ_3ADDR, tns, &addr, &[]);

        let data = self.transact(pccc).await?;
        match addr.kind {
            FileKind::Float => {
                let b = data
                    .get(..4)
                    .ok_or_else(|| DriverError::Read(format!("short data for {address}")))?;
                Ok(RawValue::Real(
                    f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64
                ))
            }
            FileKind::Integer | FileKind::Binary => {
                let b = data
                    .get(..2)
                    .ok_or_else(|| DriverError::Read(format!("short data for {address}")))?;
                let word = i16::from_le_bytes([b[0], b[1]]);
                match addr.bit {
                    Some(bit) => Ok(RawValue::Bool((word >> bit) & 1 != 0)),
                    None => Ok(RawValue::Int(word as i64)),
                }
            }
        }
    }
}

fn pccc_request(fnc: u8, tns: u16, addr: &SlcAddress, data: &[u8]) -> Vec<u8> {
    let mut pccc = Vec::with_capacity(9 + data.len());
    pccc.push(PCCC_CMD);
    pccc.push(0x00); // status
    pccc.extend_from_slice(&tns.to_le_bytes());
    pccc.push(fnc);
    pccc.push(addr.kind.element_size()); // byte count
    pccc.push(addr.file);
    pccc.push(addr.kind.type_code());
    pccc.push(addr.element);
    pccc.push(0x00); // sub-element
    pccc.extend_from_slice(data);
    pccc
}

fn csp_frame(command: u16, session: u32, payload: &[u8]) -> Vec<u8> {
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

/// Receive one CSP frame; returns (session handle, status, payload).
async fn recv_csp(stream: &mut TcpStream) -> std::io::Result<(u32, u32, Vec<u8>)> {
    let mut header = [0u8; 24];
    stream.read_exact(&mut header).await?;
    let length = u16::from_le_bytes([header[2], header[3]]) as usize;
    let session = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let status = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;
    Ok((session, status, payload))
}

#[async_trait]
impl PlcDriver for Slc500Driver {
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

        let frame = csp_frame(CMD_REGISTER_SESSION, 0, &[]);
        let registered = async {
            stream.write_all(&frame).await?;
            recv_csp(&mut stream).await
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

        debug!(plc = %self.config.plc, %endpoint, handle, "CSP session registered");
        self.session = Some(Session { stream, handle });
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.session = None;
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
        let addr = SlcAddress::parse(address)?;
        if addr.bit.is_some() {
            return Err(DriverError::Write(
                "bit-level writes not supported".to_string(),
            ));
        }
        let data = match (addr.kind, value) {
            (FileKind::Integer | FileKind::Binary, RawValue::Int(i)) => i16::try_from(*i)
                .map_err(|_| DriverError::Write(format!("{i} out of word range")))?
                .to_le_bytes()
                .to_vec(),
            (FileKind::Integer | FileKind::Binary, RawValue::Bool(b)) => {
                (*b as i16).to_le_bytes().to_vec()
            }
            (FileKind::Float, RawValue::Real(f)) => (*f as f32).to_le_bytes().to_vec(),
            (FileKind::Float, RawValue::Int(i)) => (*i as f32).to_le_bytes().to_vec(),
            (kind, value) => {
                return Err(DriverError::Write(format!(
                    "{value:?} does not fit {kind:?} file {address}"
                )))
            }
        };
        let tns = self.next_tns();
        let pccc = pccc_request(FNC_WRITE_3ADDR, tns, &addr, &data);
        self.transact(pccc).await.map(|_| ()).map_err(|e| match e {
            DriverError::Read(m) => DriverError::Write(m),
            other => other,
        })
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}
