//! Minimal async Modbus-TCP client (function 0x03 only)

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{ConnectError, ProtocolError, ReadError};

/// Default Modbus-TCP port
pub const DEFAULT_PORT: u16 = 502;

const MBAP_LEN: usize = 7;
const READ_HOLDING_REGISTERS: u8 = 0x03;
const EXCEPTION_FLAG: u8 = 0x80;
/// Registers a single 0x03 request may ask for
const MAX_REGISTERS: u16 = 125;

/// Build a read-holding-registers request frame
pub fn encode_request(transaction: u16, unit_id: u8, start: u16, count: u16) -> [u8; 12] {
    let mut frame = [0u8; 12];
    frame[0..2].copy_from_slice(&transaction.to_be_bytes());
    // Bytes 2-3: protocol id 0
    frame[4..6].copy_from_slice(&6u16.to_be_bytes());
    frame[6] = unit_id;
    frame[7] = READ_HOLDING_REGISTERS;
    frame[8..10].copy_from_slice(&start.to_be_bytes());
    frame[10..12].copy_from_slice(&count.to_be_bytes());
    frame
}

/// Validated MBAP header of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction: u16,
    pub protocol: u16,
    /// Bytes following the length field, unit id included
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(buf: &[u8; MBAP_LEN]) -> Self {
        Self {
            transaction: u16::from_be_bytes([buf[0], buf[1]]),
            protocol: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        }
    }

    fn validate(&self, transaction: u16, unit_id: u8) -> Result<(), ProtocolError> {
        if self.protocol != 0 {
            return Err(ProtocolError::InvalidResponse(format!(
                "protocol id {}",
                self.protocol
            )));
        }
        if self.transaction != transaction {
            return Err(ProtocolError::InvalidResponse(format!(
                "transaction {} != {}",
                self.transaction, transaction
            )));
        }
        if self.unit_id != unit_id {
            return Err(ProtocolError::InvalidResponse(format!(
                "unit {} != {}",
                self.unit_id, unit_id
            )));
        }
        if self.length < 2 || self.length > 254 {
            return Err(ProtocolError::InvalidResponse(format!(
                "length {}",
                self.length
            )));
        }
        Ok(())
    }
}

/// Decode the PDU (function code onward) of a 0x03 response
pub fn decode_pdu(pdu: &[u8], count: u16) -> Result<Vec<u16>, ProtocolError> {
    let Some(&function) = pdu.first() else {
        return Err(ProtocolError::TooShort {
            expected: 2,
            actual: 0,
        });
    };

    if function == READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(ProtocolError::ModbusException(code));
    }
    if function != READ_HOLDING_REGISTERS {
        return Err(ProtocolError::InvalidResponse(format!(
            "function 0x{function:02x}"
        )));
    }

    let expected = usize::from(count) * 2;
    let byte_count = pdu.get(1).copied().map(usize::from).unwrap_or(0);
    if byte_count != expected {
        return Err(ProtocolError::InvalidResponse(format!(
            "byte count {byte_count}, expected {expected}"
        )));
    }
    let data = &pdu[2..];
    if data.len() < expected {
        return Err(ProtocolError::TooShort {
            expected: expected + 2,
            actual: pdu.len(),
        });
    }

    Ok(data[..expected]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Decode a complete response frame, MBAP header included
pub fn decode_response(
    frame: &[u8],
    transaction: u16,
    unit_id: u8,
    count: u16,
) -> Result<Vec<u16>, ProtocolError> {
    let header: &[u8; MBAP_LEN] = frame
        .get(..MBAP_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(ProtocolError::TooShort {
            expected: MBAP_LEN + 2,
            actual: frame.len(),
        })?;
    let header = MbapHeader::parse(header);
    header.validate(transaction, unit_id)?;
    decode_pdu(&frame[MBAP_LEN..], count)
}

/// Open a TCP connection, resolving `host` first, bounded by `limit`
pub async fn open_stream(
    host: &str,
    port: u16,
    limit: Duration,
) -> Result<(TcpStream, SocketAddr), ConnectError> {
    let target = format!("{host}:{port}");
    let attempt = async {
        let peer = lookup_host(target.as_str())
            .await
            .map_err(|source| ConnectError::Resolve {
                address: target.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| ConnectError::NoAddress(target.clone()))?;

        let stream = TcpStream::connect(peer)
            .await
            .map_err(|source| ConnectError::Unreachable {
                address: peer.to_string(),
                source,
            })?;
        // Requests are tiny; don't wait on Nagle
        let _ = stream.set_nodelay(true);
        Ok((stream, peer))
    };

    match timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout {
            address: target,
            after: limit,
        }),
    }
}

/// Modbus-TCP session with one unit
pub struct ModbusTcpClient {
    stream: TcpStream,
    peer: SocketAddr,
    unit_id: u8,
    request_timeout: Duration,
    transaction: u16,
}

impl ModbusTcpClient {
    /// Connect to `host:port`
    pub async fn connect(
        host: &str,
        port: u16,
        unit_id: u8,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let (stream, peer) = open_stream(host, port, connect_timeout).await?;
        debug!(peer = %peer, unit = unit_id, "Modbus session opened");
        Ok(Self {
            stream,
            peer,
            unit_id,
            request_timeout,
            transaction: 0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn next_transaction(&mut self) -> u16 {
        self.transaction = self.transaction.wrapping_add(1);
        self.transaction
    }

    /// Read `count` holding registers starting at `start`
    pub async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ReadError> {
        if count == 0 || count > MAX_REGISTERS {
            return Err(ProtocolError::InvalidResponse(format!(
                "cannot request {count} registers"
            ))
            .into());
        }

        let transaction = self.next_transaction();
        let request = encode_request(transaction, self.unit_id, start, count);
        trace!(
            peer = %self.peer,
            transaction,
            start,
            count,
            "Sending Modbus request"
        );

        let limit = self.request_timeout;
        match timeout(limit, self.transceive(&request, transaction, count)).await {
            Ok(result) => result,
            Err(_) => Err(ReadError::Timeout(limit)),
        }
    }

    async fn transceive(
        &mut self,
        request: &[u8],
        transaction: u16,
        count: u16,
    ) -> Result<Vec<u16>, ReadError> {
        let lost = |e: std::io::Error| ReadError::ConnectionLost(e.to_string());

        self.stream.write_all(request).await.map_err(lost)?;

        let mut header = [0u8; MBAP_LEN];
        self.stream.read_exact(&mut header).await.map_err(lost)?;
        let header = MbapHeader::parse(&header);
        header.validate(transaction, self.unit_id)?;

        let mut pdu = vec![0u8; usize::from(header.length) - 1];
        self.stream.read_exact(&mut pdu).await.map_err(lost)?;

        let registers = decode_pdu(&pdu, count)?;
        trace!(peer = %self.peer, transaction, "Received Modbus response");
        Ok(registers)
    }
}
