use std::io::Write;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use async_lock::Mutex;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{crypto_error, sync_error, EntglResult};
use crate::protocol::message::{decode_body, encode_body, SecureEnvelope};
use crate::protocol::secure::SessionCrypto;
use crate::protocol::MessageType;
use crate::telemetry::{MetricKind, TelemetrySink};

/// Payloads larger than this are Brotli-compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Upper bound on a single frame; anything larger is a protocol violation.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

const COMPRESSION_NONE: u8 = 0x00;
const COMPRESSION_BROTLI: u8 = 0x01;

/// Framed, optionally compressed, optionally encrypted transport over one
/// duplex stream.
///
/// Reads and writes are serialized by separate mutexes so full duplex is
/// preserved while parallel writers can never interleave bytes.
pub struct PeerChannel<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    crypto: StdMutex<Option<SessionCrypto>>,
    telemetry: TelemetrySink,
}

impl<S> PeerChannel<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(stream: S, telemetry: TelemetrySink) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            crypto: StdMutex::new(None),
            telemetry,
        }
    }

    /// Installs session keys; every subsequent frame travels inside a
    /// `SecureEnv` envelope.
    pub fn enable_encryption(&self, session: SessionCrypto) {
        *self.crypto.lock().unwrap() = Some(session);
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.lock().unwrap().is_some()
    }

    /// Sends one message, applying compression above the threshold and the
    /// secure envelope when session keys are installed.
    pub async fn send(&self, message_type: MessageType, payload: &[u8]) -> EntglResult<()> {
        let mut writer = self.writer.lock().await;

        let frame = if self.is_encrypted() {
            let inner = self.encode_inner(message_type, payload);
            let envelope = {
                let started = Instant::now();
                let mut guard = self.crypto.lock().unwrap();
                let session = guard.as_mut().expect("encryption enabled");
                let (ciphertext, nonce) = session.seal.seal(&inner)?;
                self.telemetry
                    .record_duration(MetricKind::EncryptionTime, started.elapsed());
                SecureEnvelope {
                    ciphertext,
                    nonce,
                    auth_tag: Vec::new(),
                }
            };
            encode_frame(MessageType::SecureEnv, COMPRESSION_NONE, &encode_body(&envelope))
        } else {
            let (flag, bytes) = self.maybe_compress(message_type, payload);
            encode_frame(message_type, flag, &bytes)
        };

        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Receives one message, reversing the envelope and compression layers.
    pub async fn recv(&self) -> EntglResult<(MessageType, Vec<u8>)> {
        let (message_type, compression, payload) = {
            let mut reader = self.reader.lock().await;
            read_raw_frame(&mut *reader).await?
        };

        if message_type == MessageType::SecureEnv {
            let envelope: SecureEnvelope = decode_body(&payload)?;
            let started = Instant::now();
            let inner = {
                let guard = self.crypto.lock().unwrap();
                let session = guard
                    .as_ref()
                    .ok_or_else(|| crypto_error("received an envelope before key exchange"))?;
                session.open.open(&envelope.ciphertext, &envelope.nonce)?
            };
            self.telemetry
                .record_duration(MetricKind::DecryptionTime, started.elapsed());
            return decode_inner(&inner);
        }

        let payload = inflate(compression, payload)?;
        Ok((message_type, payload))
    }

    fn maybe_compress(&self, message_type: MessageType, payload: &[u8]) -> (u8, Vec<u8>) {
        if payload.len() <= COMPRESSION_THRESHOLD || message_type == MessageType::SecureEnv {
            return (COMPRESSION_NONE, payload.to_vec());
        }
        match brotli_compress(payload) {
            Ok(compressed) if compressed.len() < payload.len() => {
                self.telemetry.record(
                    MetricKind::CompressionRatio,
                    compressed.len() as f64 / payload.len() as f64,
                );
                (COMPRESSION_BROTLI, compressed)
            }
            _ => (COMPRESSION_NONE, payload.to_vec()),
        }
    }

    /// Inner layout mirrors the outer frame minus the length prefix:
    /// `[type][compression][payload]`.
    fn encode_inner(&self, message_type: MessageType, payload: &[u8]) -> Vec<u8> {
        let (flag, bytes) = self.maybe_compress(message_type, payload);
        let mut inner = Vec::with_capacity(2 + bytes.len());
        inner.push(message_type.as_u8());
        inner.push(flag);
        inner.extend_from_slice(&bytes);
        inner
    }
}

fn decode_inner(inner: &[u8]) -> EntglResult<(MessageType, Vec<u8>)> {
    if inner.len() < 2 {
        return Err(sync_error("secure envelope payload is truncated"));
    }
    let message_type = MessageType::from_u8(inner[0]);
    let payload = inflate(inner[1], inner[2..].to_vec())?;
    Ok((message_type, payload))
}

fn encode_frame(message_type: MessageType, compression: u8, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(6 + payload.len());
    frame.put_u32_le(payload.len() as u32);
    frame.put_u8(message_type.as_u8());
    frame.put_u8(compression);
    frame.put_slice(payload);
    frame.freeze()
}

async fn read_raw_frame<R>(reader: &mut R) -> EntglResult<(MessageType, u8, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 6];
    reader.read_exact(&mut header).await?;
    let payload_len = u32::from_le_bytes(header[..4].try_into().expect("4-byte slice"));
    if payload_len > MAX_FRAME_LEN {
        return Err(sync_error(format!(
            "frame of {payload_len} bytes exceeds the protocol limit"
        )));
    }
    let message_type = MessageType::from_u8(header[4]);
    let compression = header[5];

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload).await?;
    Ok((message_type, compression, payload))
}

fn inflate(compression: u8, payload: Vec<u8>) -> EntglResult<Vec<u8>> {
    match compression {
        COMPRESSION_NONE => Ok(payload),
        COMPRESSION_BROTLI => brotli_decompress(&payload),
        other => Err(sync_error(format!("unknown compression flag {other:#04x}"))),
    }
}

fn brotli_compress(payload: &[u8]) -> EntglResult<Vec<u8>> {
    let mut compressed = Vec::new();
    let params = brotli::enc::BrotliEncoderParams {
        quality: 5,
        ..Default::default()
    };
    let mut writer = brotli::CompressorWriter::with_params(&mut compressed, 4096, &params);
    writer
        .write_all(payload)
        .and_then(|_| writer.flush())
        .map_err(|err| sync_error(format!("compression failed: {err}")))?;
    drop(writer);
    Ok(compressed)
}

fn brotli_decompress(payload: &[u8]) -> EntglResult<Vec<u8>> {
    let mut decompressed = Vec::new();
    brotli::BrotliDecompress(&mut &payload[..], &mut decompressed)
        .map_err(|err| sync_error(format!("decompression failed: {err}")))?;
    Ok(decompressed)
}
