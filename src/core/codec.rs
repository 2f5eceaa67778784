//! # Binary Packet Codec
//!
//! Framing, compression and encryption for the wire protocol.
//!
//! ## Wire Format
//! ```text
//! [header (1)] [length (2, or 4 when big sized)] [payload]
//! ```
//!
//! ## Ordering
//! Encoding encrypts first and compresses second. Decoding reverses this exactly:
//! uncompress, then decrypt. Peers depend on the order byte for byte.
//!
//! ## Failure Policy
//! - Encoding is best effort. A failed encryption clears the encrypted flag and a
//!   failed compression leaves the payload uncompressed.
//! - Decoding a compressed or encrypted packet without the matching component
//!   installed is a configuration error and fails immediately.
//!
//! ## Stream Reading
//! TCP delivers bytes in arbitrary chunks. [`BinaryPacketDecoder::read`] keeps its
//! progress in a per-session [`PendingPacket`] so a header, a length field or a
//! payload may arrive split across any number of calls.

use crate::core::header::PacketHeader;
use crate::core::packet::{
    Packet, PacketReadState, PacketState, PendingPacket, ProcessedPacket,
};
use crate::core::serialization::{DataCollection, DataType};
use crate::error::{NetworkError, Result};
use crate::utils::compression::PacketCompressor;
use crate::utils::crypto::PacketEncryptor;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// Payloads strictly larger than this are compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 3000;

/// Upper bound for one framed payload (16 MB).
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Prefix `payload` with its header byte and length field.
pub fn frame(header: PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + header.length_field_size() + payload.len());
    out.put_u8(header.to_byte());
    if header.big_sized {
        out.put_u32(payload.len() as u32);
    } else {
        out.put_u16(payload.len() as u16);
    }
    out.put_slice(payload);
    out
}

/// Turns outbound packets into framed wire bytes.
#[derive(Clone)]
pub struct BinaryPacketEncoder {
    compressor: Option<Arc<dyn PacketCompressor>>,
    encryptor: Option<Arc<dyn PacketEncryptor>>,
    compression_threshold: usize,
    max_packet_size: usize,
}

impl BinaryPacketEncoder {
    pub fn new() -> Self {
        Self {
            compressor: None,
            encryptor: None,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn PacketCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn PacketEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn with_max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max;
        self
    }

    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }

    /// Run a packet through `Raw -> Encrypted -> Compressed -> Framed`.
    ///
    /// Already framed packets are returned untouched.
    ///
    /// # Errors
    /// Returns `NetworkError::OversizedPacket` when the final payload exceeds the
    /// configured maximum. Encryption and compression failures are not errors.
    pub fn encode(&self, mut packet: Packet) -> Result<Packet> {
        if packet.is_framed() {
            return Ok(packet);
        }

        let mut payload = packet.take_data();

        if packet.is_encrypted() {
            match self.encryptor.as_ref().map(|e| e.encrypt(&payload)) {
                Some(Ok(sealed)) => {
                    payload = sealed;
                    packet.mark(PacketState::Encrypted);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Encryption failed, sending packet unencrypted");
                    packet.clear_encryption();
                }
                None => {
                    warn!("No encryptor configured, sending packet unencrypted");
                    packet.clear_encryption();
                }
            }
        }

        let mut compressed = false;
        if payload.len() > self.compression_threshold {
            if let Some(compressor) = &self.compressor {
                match compressor.compress(&payload) {
                    Ok(out) => {
                        debug!(
                            original = payload.len(),
                            compressed = out.len(),
                            "Compressed packet payload"
                        );
                        payload = out;
                        compressed = true;
                        packet.mark(PacketState::Compressed);
                    }
                    Err(e) => warn!(error = %e, "Compression failed, sending packet uncompressed"),
                }
            }
        }

        if payload.len() > self.max_packet_size {
            return Err(NetworkError::OversizedPacket(payload.len()));
        }

        let header = PacketHeader::for_payload(payload.len(), compressed, packet.is_encrypted());
        packet.advance(PacketState::Framed, frame(header, &payload));
        Ok(packet)
    }
}

impl Default for BinaryPacketEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns wire bytes back into payloads and collections.
#[derive(Clone)]
pub struct BinaryPacketDecoder {
    compressor: Option<Arc<dyn PacketCompressor>>,
    decryptor: Option<Arc<dyn PacketEncryptor>>,
    data_type: DataType,
    max_packet_size: usize,
}

impl BinaryPacketDecoder {
    pub fn new(data_type: DataType) -> Self {
        Self {
            compressor: None,
            decryptor: None,
            data_type,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn PacketCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn PacketEncryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn with_max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max;
        self
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Feed a chunk of stream bytes. Returns every packet completed by this chunk.
    ///
    /// On error the pending state is reset so the next chunk starts a new packet.
    pub fn read(&self, pending: &mut PendingPacket, data: &[u8]) -> Result<Vec<ProcessedPacket>> {
        let result = self.read_inner(pending, data);
        if result.is_err() {
            pending.reset();
        }
        result
    }

    fn read_inner(
        &self,
        pending: &mut PendingPacket,
        mut data: &[u8],
    ) -> Result<Vec<ProcessedPacket>> {
        let mut completed = Vec::new();

        while !data.is_empty() {
            match pending.state {
                PacketReadState::WaitNewPacket => {
                    pending.header = Some(PacketHeader::from_byte(data.get_u8())?);
                    pending.state = PacketReadState::WaitDataSize;
                }
                PacketReadState::WaitDataSize => {
                    let width = self.header_of(pending)?.length_field_size();
                    if data.len() >= width {
                        let length = read_length(&mut data, width);
                        self.begin_payload(pending, length)?;
                    } else {
                        pending.size_fragment.extend_from_slice(data);
                        data.advance(data.len());
                        pending.state = PacketReadState::WaitDataSizeFragment;
                    }
                }
                PacketReadState::WaitDataSizeFragment => {
                    let width = self.header_of(pending)?.length_field_size();
                    let needed = width - pending.size_fragment.len();
                    let take = needed.min(data.len());
                    pending.size_fragment.extend_from_slice(&data[..take]);
                    data.advance(take);

                    if pending.size_fragment.len() == width {
                        let fragment = std::mem::take(&mut pending.size_fragment);
                        let length = read_length(&mut fragment.as_slice(), width);
                        self.begin_payload(pending, length)?;
                    }
                }
                PacketReadState::WaitData => {
                    let needed = pending.expected_length - pending.buffer.len();
                    let take = needed.min(data.len());
                    pending.buffer.extend_from_slice(&data[..take]);
                    data.advance(take);

                    if pending.buffer.len() == pending.expected_length {
                        let header = self.header_of(pending)?;
                        completed.push(ProcessedPacket {
                            header,
                            payload: std::mem::take(&mut pending.buffer),
                        });
                        pending.reset();
                    }
                }
            }
        }

        Ok(completed)
    }

    fn header_of(&self, pending: &PendingPacket) -> Result<PacketHeader> {
        pending.header.ok_or(NetworkError::InvalidHeader)
    }

    fn begin_payload(&self, pending: &mut PendingPacket, length: usize) -> Result<()> {
        if length > self.max_packet_size {
            return Err(NetworkError::OversizedPacket(length));
        }
        if length == 0 {
            // Nothing to deliver for an empty payload.
            pending.reset();
            return Ok(());
        }
        pending.expected_length = length;
        pending.buffer = Vec::with_capacity(length);
        pending.state = PacketReadState::WaitData;
        Ok(())
    }

    /// Decode exactly one framed packet from a self-contained buffer (one datagram or
    /// one WebSocket frame). Trailing bytes are ignored.
    pub fn read_frame(&self, data: &[u8]) -> Result<Option<ProcessedPacket>> {
        let mut buf = data;
        if buf.is_empty() {
            return Err(NetworkError::InvalidHeader);
        }
        let header = PacketHeader::from_byte(buf.get_u8())?;
        let width = header.length_field_size();
        if buf.len() < width {
            return Err(NetworkError::TruncatedPacket {
                expected: width,
                actual: buf.len(),
            });
        }
        let length = read_length(&mut buf, width);
        if length > self.max_packet_size {
            return Err(NetworkError::OversizedPacket(length));
        }
        if buf.len() < length {
            return Err(NetworkError::TruncatedPacket {
                expected: length,
                actual: buf.len(),
            });
        }
        if length == 0 {
            return Ok(None);
        }
        Ok(Some(ProcessedPacket {
            header,
            payload: buf[..length].to_vec(),
        }))
    }

    /// Undo compression and encryption, in that order.
    pub fn unwrap_payload(&self, packet: ProcessedPacket) -> Result<Vec<u8>> {
        let mut payload = packet.payload;

        if packet.header.compressed {
            let compressor = self
                .compressor
                .as_ref()
                .ok_or(NetworkError::MissingCompressor)?;
            payload = compressor.uncompress(&payload)?;
        }

        if packet.header.encrypted {
            let decryptor = self
                .decryptor
                .as_ref()
                .ok_or(NetworkError::MissingDecryptor)?;
            payload = decryptor.decrypt(&payload)?;
        }

        Ok(payload)
    }

    /// Full inverse of encode for one completed packet. Empty payloads yield `None`.
    pub fn decode(&self, packet: ProcessedPacket) -> Result<Option<DataCollection>> {
        let payload = self.unwrap_payload(packet)?;
        if payload.is_empty() {
            return Ok(None);
        }
        DataCollection::from_bytes(self.data_type, &payload).map(Some)
    }
}

fn read_length(buf: &mut &[u8], width: usize) -> usize {
    if width == 4 {
        buf.get_u32() as usize
    } else {
        buf.get_u16() as usize
    }
}

/// `tokio_util` adapter for framed streams, used by the stream client.
///
/// Items are fully unwrapped payloads (uncompressed and decrypted).
#[derive(Clone)]
pub struct PacketCodec {
    encoder: BinaryPacketEncoder,
    decoder: BinaryPacketDecoder,
}

impl PacketCodec {
    pub fn new(encoder: BinaryPacketEncoder, decoder: BinaryPacketDecoder) -> Self {
        Self { encoder, decoder }
    }
}

impl Decoder for PacketCodec {
    type Item = Vec<u8>;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }
            let header = PacketHeader::from_byte(src[0])?;
            let width = header.length_field_size();
            if src.len() < 1 + width {
                return Ok(None);
            }

            let mut length_bytes = &src[1..1 + width];
            let length = read_length(&mut length_bytes, width);
            if length > self.decoder.max_packet_size {
                return Err(NetworkError::OversizedPacket(length));
            }

            let total = 1 + width + length;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let frame = src.split_to(total);
            if length == 0 {
                continue;
            }
            let packet = ProcessedPacket {
                header,
                payload: frame[1 + width..].to_vec(),
            };
            return self.decoder.unwrap_payload(packet).map(Some);
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let packet = self.encoder.encode(item)?;
        dst.extend_from_slice(packet.data());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::utils::compression::{CompressionKind, DefaultCompressor};
    use crate::utils::crypto::Crypto;

    fn full_codec() -> (BinaryPacketEncoder, BinaryPacketDecoder) {
        let compressor: Arc<dyn PacketCompressor> =
            Arc::new(DefaultCompressor::new(CompressionKind::Lz4));
        let crypto: Arc<dyn PacketEncryptor> = Arc::new(Crypto::new(&[9u8; 32]));
        (
            BinaryPacketEncoder::new()
                .with_compressor(compressor.clone())
                .with_encryptor(crypto.clone()),
            BinaryPacketDecoder::new(DataType::Zero)
                .with_compressor(compressor)
                .with_decryptor(crypto),
        )
    }

    #[test]
    fn small_payload_frames_to_three_byte_overhead() {
        let encoder = BinaryPacketEncoder::new();
        let packet = encoder.encode(Packet::new(vec![1u8; 10])).unwrap();
        assert_eq!(packet.len(), 13);
        let header = PacketHeader::from_byte(packet.data()[0]).unwrap();
        assert!(!header.compressed);
        assert!(!header.encrypted);
        assert!(!header.big_sized);
        assert_eq!(&packet.data()[1..3], &[0, 10]);
    }

    #[test]
    fn length_field_widens_past_u16() {
        let encoder = BinaryPacketEncoder::new();

        let at_limit = encoder.encode(Packet::new(vec![0u8; 65_535])).unwrap();
        let header = PacketHeader::from_byte(at_limit.data()[0]).unwrap();
        assert!(!header.big_sized);
        assert_eq!(at_limit.len(), 1 + 2 + 65_535);

        let past_limit = encoder.encode(Packet::new(vec![0u8; 65_536])).unwrap();
        let header = PacketHeader::from_byte(past_limit.data()[0]).unwrap();
        assert!(header.big_sized);
        assert_eq!(past_limit.len(), 1 + 4 + 65_536);
    }

    #[test]
    fn compression_threshold_is_strict() {
        let compressor: Arc<dyn PacketCompressor> = Arc::new(DefaultCompressor::default());
        let encoder = BinaryPacketEncoder::new().with_compressor(compressor);

        let exact = encoder.encode(Packet::new(vec![7u8; 3000])).unwrap();
        assert!(!PacketHeader::from_byte(exact.data()[0]).unwrap().compressed);

        let over = encoder.encode(Packet::new(vec![7u8; 3001])).unwrap();
        assert!(PacketHeader::from_byte(over.data()[0]).unwrap().compressed);
        assert_eq!(over.state(), PacketState::Framed);
    }

    #[test]
    fn missing_encryptor_clears_flag() {
        let encoder = BinaryPacketEncoder::new();
        let packet = encoder
            .encode(Packet::new(b"secret".to_vec()).with_encryption(true))
            .unwrap();
        assert!(!packet.is_encrypted());
        assert!(!PacketHeader::from_byte(packet.data()[0]).unwrap().encrypted);
    }

    #[test]
    fn framed_packet_is_not_reencoded() {
        let encoder = BinaryPacketEncoder::new();
        let once = encoder.encode(Packet::new(vec![1, 2, 3])).unwrap();
        let twice = encoder.encode(once.clone()).unwrap();
        assert_eq!(once.data(), twice.data());
    }

    #[test]
    fn encrypted_and_compressed_roundtrip() {
        let (encoder, decoder) = full_codec();
        let payload = vec![5u8; 10_000];
        let packet = encoder
            .encode(Packet::new(payload.clone()).with_encryption(true))
            .unwrap();
        let header = PacketHeader::from_byte(packet.data()[0]).unwrap();
        assert!(header.encrypted);

        let mut pending = PendingPacket::new();
        let mut done = decoder.read(&mut pending, packet.data()).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(decoder.unwrap_payload(done.remove(0)).unwrap(), payload);
    }

    #[test]
    fn byte_at_a_time_reassembly() {
        let encoder = BinaryPacketEncoder::new();
        let decoder = BinaryPacketDecoder::new(DataType::Zero);
        let framed = encoder.encode(Packet::new(vec![3u8; 300])).unwrap();

        let mut pending = PendingPacket::new();
        let mut completed = Vec::new();
        for (i, byte) in framed.data().iter().enumerate() {
            completed.extend(decoder.read(&mut pending, &[*byte]).unwrap());
            if i == 1 {
                assert_eq!(pending.state(), PacketReadState::WaitDataSizeFragment);
            }
        }
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].payload, vec![3u8; 300]);
        assert_eq!(pending.state(), PacketReadState::WaitNewPacket);
    }

    #[test]
    fn several_packets_in_one_chunk() {
        let encoder = BinaryPacketEncoder::new();
        let decoder = BinaryPacketDecoder::new(DataType::Zero);
        let mut stream = Vec::new();
        for n in 1..=3u8 {
            stream.extend(encoder.encode(Packet::new(vec![n; n as usize])).unwrap().into_data());
        }
        // Split the last packet across two calls.
        let (first, second) = stream.split_at(stream.len() - 2);

        let mut pending = PendingPacket::new();
        let done = decoder.read(&mut pending, first).unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(pending.state(), PacketReadState::WaitData);
        let done = decoder.read(&mut pending, second).unwrap();
        assert_eq!(done[0].payload, vec![3u8; 3]);
    }

    #[test]
    fn compressed_packet_without_compressor_is_fatal() {
        let compressor: Arc<dyn PacketCompressor> = Arc::new(DefaultCompressor::default());
        let encoder = BinaryPacketEncoder::new().with_compressor(compressor);
        let decoder = BinaryPacketDecoder::new(DataType::Zero);
        let framed = encoder.encode(Packet::new(vec![1u8; 4000])).unwrap();

        let frame = decoder.read_frame(framed.data()).unwrap().unwrap();
        let err = decoder.unwrap_payload(frame).unwrap_err();
        assert!(matches!(err, NetworkError::MissingCompressor));
    }

    #[test]
    fn encrypted_packet_without_decryptor_is_fatal() {
        let crypto: Arc<dyn PacketEncryptor> = Arc::new(Crypto::new(&[1u8; 32]));
        let encoder = BinaryPacketEncoder::new().with_encryptor(crypto);
        let decoder = BinaryPacketDecoder::new(DataType::Zero);
        let framed = encoder
            .encode(Packet::new(vec![1u8; 16]).with_encryption(true))
            .unwrap();

        let frame = decoder.read_frame(framed.data()).unwrap().unwrap();
        assert!(matches!(
            decoder.unwrap_payload(frame),
            Err(NetworkError::MissingDecryptor)
        ));
    }

    #[test]
    fn zero_length_payload_yields_nothing() {
        let decoder = BinaryPacketDecoder::new(DataType::Zero);
        let mut pending = PendingPacket::new();
        let done = decoder.read(&mut pending, &[0x80, 0, 0]).unwrap();
        assert!(done.is_empty());
        assert!(decoder.read_frame(&[0x80, 0, 0]).unwrap().is_none());
    }

    #[test]
    fn invalid_header_resets_state() {
        let decoder = BinaryPacketDecoder::new(DataType::Zero);
        let mut pending = PendingPacket::new();
        assert!(decoder.read(&mut pending, &[0x01, 0, 1, 9]).is_err());
        assert_eq!(pending.state(), PacketReadState::WaitNewPacket);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let decoder = BinaryPacketDecoder::new(DataType::Zero).with_max_packet_size(100);
        let mut pending = PendingPacket::new();
        let err = decoder.read(&mut pending, &[0x80, 0x01, 0x00]).unwrap_err();
        assert!(matches!(err, NetworkError::OversizedPacket(256)));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let decoder = BinaryPacketDecoder::new(DataType::Zero);
        assert!(matches!(
            decoder.read_frame(&[0x80, 0, 5, 1, 2]),
            Err(NetworkError::TruncatedPacket { .. })
        ));
    }

    #[test]
    fn tokio_codec_handles_partial_frames() {
        let (encoder, decoder) = full_codec();
        let mut codec = PacketCodec::new(encoder, decoder);
        let mut buf = BytesMut::new();
        codec
            .encode(Packet::new(vec![8u8; 5000]).with_encryption(true), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(10);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), vec![8u8; 5000]);
        assert!(partial.is_empty());
    }
}
