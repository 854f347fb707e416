use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{SerialPort, SerialStream};

use crate::config::{Parity, SerialConfig};

/// Exception codes which mean the addressed meter did not answer at all
const GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;
const GATEWAY_TARGET_FAILED: u8 = 0x0B;

/// Smallest RTU frame we can size: unit id, function code, byte count
const RTU_HEADER_LEN: usize = 3;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no response within {0:?}")]
    NoResponse(Duration),
    #[error("incomplete response within {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("meter answered with exception code {0:#04x}")]
    Exception(u8),
    #[error("meter unreachable: {0}")]
    Unreachable(String),
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True when retrying other registers of the same meter in this cycle is pointless
    pub fn is_meter_unreachable(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Io(_))
    }

    pub fn is_silence(&self) -> bool {
        matches!(self, TransportError::NoResponse(_))
    }
}

/// Something able to run a single "read input registers" transaction.
///
/// Framing, CRC and the wire itself are the implementor's business, the
/// polling code only sees register words or an error.
#[async_trait]
pub trait RegisterTransport: Send {
    async fn read_input_registers(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, TransportError>;
}

/// Streams that can throw away input nobody asked for
pub trait DiscardInput {
    fn discard_input(&mut self) -> std::io::Result<()>;
}

impl DiscardInput for SerialStream {
    fn discard_input(&mut self) -> std::io::Result<()> {
        self.clear(tokio_serial::ClearBuffer::Input)?;
        Ok(())
    }
}

/// Modbus RTU master on any byte stream
pub struct RtuTransport<S> {
    port_name: String,
    stream: S,
    received: usize,
}

/// Modbus RTU master on a local serial port
pub type SerialTransport = RtuTransport<SerialStream>;

impl RtuTransport<SerialStream> {
    pub fn open(config: &SerialConfig) -> Result<Self, TransportError> {
        let parity = match config.parity {
            Parity::N => tokio_serial::Parity::None,
            Parity::E => tokio_serial::Parity::Even,
            Parity::O => tokio_serial::Parity::Odd,
        };

        let stop_bits = match config.stopbits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let data_bits = match config.bytesize {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let builder = tokio_serial::new(config.port.clone(), config.baudrate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits);

        let stream = SerialStream::open(&builder)
            .map_err(|e| TransportError::Unreachable(format!("unable to open {}: {}", config.port, e)))?;

        info!("Opened serial port {} at {} baud", config.port, config.baudrate);
        return Ok(RtuTransport::with_stream(&config.port, stream));
    }
}

impl<S: AsyncRead + AsyncWrite + DiscardInput + Unpin + Send> RtuTransport<S> {
    pub fn with_stream(port_name: &str, stream: S) -> Self {
        RtuTransport {
            port_name: port_name.to_string(),
            stream,
            received: 0,
        }
    }

    async fn fill(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.stream.read(&mut buf[pos..]).await?;
            if n == 0 {
                return Err(TransportError::Unreachable(format!("serial port {} closed", self.port_name)));
            }
            pos += n;
            self.received += n;
        }
        Ok(())
    }

    async fn transact(&mut self, unit: u8, start: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        let mut mreq = ModbusRequest::new(unit, ModbusProto::Rtu);
        let mut request = Vec::new();
        mreq.generate_get_inputs(start, count, &mut request)
            .map_err(|e| TransportError::Protocol(format!("unable to build request: {:?}", e)))?;

        self.stream.write_all(&request).await?;

        let mut response = vec![0u8; RTU_HEADER_LEN];
        self.fill(&mut response).await?;

        let len = guess_response_frame_len(&response, ModbusProto::Rtu)
            .map_err(|e| TransportError::Protocol(format!("unable to size response: {:?}", e)))? as usize;

        if len > RTU_HEADER_LEN {
            response.resize(len, 0);
            self.fill(&mut response[RTU_HEADER_LEN..]).await?;
        }

        let mut data = Vec::new();
        if let Err(e) = mreq.parse_u16(&response, &mut data) {
            /* exception frames have the high bit of the function code set */
            if response[1] & 0x80 != 0 {
                let code = response[2];
                if code == GATEWAY_PATH_UNAVAILABLE || code == GATEWAY_TARGET_FAILED {
                    return Err(TransportError::Unreachable(format!("gateway exception {:#04x}", code)));
                }
                return Err(TransportError::Exception(code));
            }
            return Err(TransportError::Protocol(format!("{:?}", e)));
        }

        return Ok(data);
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + DiscardInput + Unpin + Send> RegisterTransport for RtuTransport<S> {
    async fn read_input_registers(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, TransportError> {
        /* drop whatever a previous timed out transaction left behind */
        if let Err(e) = self.stream.discard_input() {
            warn!("Unable to flush {}: {}", self.port_name, e);
        }
        self.received = 0;

        debug!("Unit {} reading {} registers at {:#06x}", unit, count, start);
        let outcome = tokio::time::timeout(timeout, self.transact(unit, start, count)).await;
        match outcome {
            Ok(result) => result,
            Err(_) if self.received == 0 => Err(TransportError::NoResponse(timeout)),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

/// The one physical bus, shared by everything that wants to talk to a meter.
///
/// RS-485 is half duplex, so whoever holds the lock owns the wire until the
/// guard is dropped.
pub struct SharedBus<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for SharedBus<T> {
    fn clone(&self) -> Self {
        SharedBus { inner: Arc::clone(&self.inner) }
    }
}

impl<T: RegisterTransport> SharedBus<T> {
    pub fn new(transport: T) -> Self {
        SharedBus { inner: Arc::new(Mutex::new(transport)) }
    }

    /// Wait until the bus is free. The bus stays taken while the guard lives.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, T> {
        self.inner.lock().await
    }
}
