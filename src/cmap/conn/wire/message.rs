use std::io::{Cursor, Read};

use bitflags::bitflags;
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util,
};
#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use crate::compression::Compressor;
use crate::{
    cmap::conn::command::Command,
    compression::Decoder,
    error::{Error, ErrorKind, Result},
};

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) document_payload: Document,
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) request_id: Option<i32>,
}

/// A kind-1 section: a sequence of documents identified by the command field they belong to.
#[derive(Debug)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Document>,
}

impl Message {
    /// Creates a `Message` from a given `Command`.
    pub(crate) fn from_command(command: Command, request_id: Option<i32>) -> Self {
        let mut body = command.body;
        body.insert("$db", command.target_db);

        let mut flags = MessageFlags::empty();
        if command.exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }

        Self {
            response_to: 0,
            flags,
            document_payload: body,
            document_sequences: Vec::new(),
            request_id,
        }
    }

    /// Whether the server will send further replies for this message's request without waiting
    /// for additional requests.
    pub(crate) fn is_exhaust(&self) -> bool {
        self.flags.contains(MessageFlags::MORE_TO_COME)
    }

    /// Gets the command document contained in this Message.
    pub(crate) fn get_command_document(&self) -> Document {
        self.document_payload.clone()
    }

    /// Consumes the message and returns the single command document it carries.
    pub(crate) fn single_document_response(self) -> Document {
        self.document_payload
    }

    /// Reads bytes from `reader` and deserializes them into a Message.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader).await?;

        let body_len = header.length as i64 - Header::LENGTH as i64;
        if body_len < std::mem::size_of::<u32>() as i64 {
            return Err(ErrorKind::InvalidResponse {
                message: format!("invalid wire message length: {}", header.length),
            }
            .into());
        }

        let mut buf = vec![0u8; body_len as usize];
        reader.read_exact(&mut buf).await.map_err(Error::network)?;

        match header.op_code {
            OpCode::Message => Self::parse_body(header, buf, true),
            OpCode::Compressed => Self::parse_op_compressed(header, buf),
        }
    }

    fn parse_op_compressed(header: Header, buf: Vec<u8>) -> Result<Self> {
        if buf.len() < 9 {
            return Err(ErrorKind::InvalidResponse {
                message: "truncated OP_COMPRESSED message".to_string(),
            }
            .into());
        }

        let original_opcode = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let uncompressed_size = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let compressor_id = buf[8];

        if original_opcode != OpCode::Message as i32 {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "invalid original opcode in OP_COMPRESSED message: {}",
                    original_opcode
                ),
            }
            .into());
        }

        let decoder = Decoder::from_u8(compressor_id)?;
        let decompressed = decoder.decode(&buf[9..])?;

        if decompressed.len() as i64 != uncompressed_size as i64 {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "the server indicated the uncompressed reply would be {} bytes long, but it \
                     instead was {}",
                    uncompressed_size,
                    decompressed.len(),
                ),
            }
            .into());
        }

        // The checksum, if any, was computed over the compressed frame, which no longer exists
        // in its original form here.
        Self::parse_body(header, decompressed, false)
    }

    fn parse_body(header: Header, buf: Vec<u8>, verify_checksum: bool) -> Result<Self> {
        if buf.len() < std::mem::size_of::<u32>() {
            return Err(ErrorKind::InvalidResponse {
                message: "wire message too short to contain its flags".to_string(),
            }
            .into());
        }

        let flags = MessageFlags::from_bits_truncate(u32::from_le_bytes(
            buf[0..4].try_into().unwrap(),
        ));

        let mut sections_end = buf.len();
        if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            if buf.len() < 8 {
                return Err(ErrorKind::InvalidResponse {
                    message: "wire message too short to contain its checksum".to_string(),
                }
                .into());
            }
            sections_end -= std::mem::size_of::<u32>();

            if verify_checksum {
                let checksum =
                    u32::from_le_bytes(buf[sections_end..].try_into().unwrap());
                let mut checksummed_bytes =
                    Vec::with_capacity(Header::LENGTH + sections_end);
                checksummed_bytes.extend_from_slice(&header.to_bytes());
                checksummed_bytes.extend_from_slice(&buf[..sections_end]);

                let actual = crc32c::crc32c(&checksummed_bytes);
                if actual != checksum {
                    return Err(ErrorKind::InvalidResponse {
                        message: format!(
                            "wire message checksum mismatch: expected {:#x}, got {:#x}",
                            checksum, actual
                        ),
                    }
                    .into());
                }
            }
        }

        let sections_bytes = &buf[std::mem::size_of::<u32>()..sections_end];
        let mut cursor = Cursor::new(sections_bytes);

        let mut document_payload: Option<Document> = None;
        let mut document_sequences = Vec::new();

        while (cursor.position() as usize) < sections_bytes.len() {
            let mut kind = [0u8; 1];
            std::io::Read::read_exact(&mut cursor, &mut kind)?;

            match kind[0] {
                0 => {
                    let document = Document::from_reader(&mut cursor)
                        .map_err(|e| Error::invalid_response(e.to_string()))?;
                    if document_payload.replace(document).is_some() {
                        return Err(ErrorKind::InvalidResponse {
                            message: "wire message contained multiple payload type 0 sections"
                                .to_string(),
                        }
                        .into());
                    }
                }
                1 => {
                    let mut size_bytes = [0u8; 4];
                    std::io::Read::read_exact(&mut cursor, &mut size_bytes)?;
                    let size = i32::from_le_bytes(size_bytes);
                    if size < 5 {
                        return Err(ErrorKind::InvalidResponse {
                            message: format!("invalid document sequence length: {}", size),
                        }
                        .into());
                    }
                    let end = cursor.position() + size as u64 - 4;

                    let identifier = util::read_cstring(&mut cursor)?;
                    let mut documents = Vec::new();
                    while cursor.position() < end {
                        let document = Document::from_reader(&mut cursor)
                            .map_err(|e| Error::invalid_response(e.to_string()))?;
                        documents.push(document);
                    }

                    if cursor.position() != end {
                        return Err(ErrorKind::InvalidResponse {
                            message: "document sequence length did not match its contents"
                                .to_string(),
                        }
                        .into());
                    }

                    document_sequences.push(DocumentSequence {
                        identifier,
                        documents,
                    });
                }
                other => {
                    return Err(ErrorKind::InvalidResponse {
                        message: format!("invalid payload type: {}", other),
                    }
                    .into())
                }
            }
        }

        let document_payload = document_payload.ok_or_else(|| {
            Error::from(ErrorKind::InvalidResponse {
                message: "no payload type 0 section in wire message".to_string(),
            })
        })?;

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload,
            document_sequences,
            request_id: Some(header.request_id),
        })
    }

    fn sections_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();

        bytes.push(0);
        self.document_payload.to_writer(&mut bytes)?;

        for sequence in &self.document_sequences {
            bytes.push(1);

            let mut body = Vec::new();
            util::write_cstring(&mut body, &sequence.identifier);
            for document in &sequence.documents {
                document.to_writer(&mut body)?;
            }

            bytes.extend_from_slice(&((body.len() + 4) as i32).to_le_bytes());
            bytes.extend_from_slice(&body);
        }

        Ok(bytes)
    }

    /// Serializes the Message to bytes and writes them to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<()> {
        let sections = self.sections_bytes()?;

        let total_length = Header::LENGTH + std::mem::size_of::<u32>() + sections.len();

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id.unwrap_or_else(util::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer
            .write_u32_le(self.flags.bits())
            .await
            .map_err(Error::network)?;
        writer.write_all(&sections).await.map_err(Error::network)?;
        writer.flush().await.map_err(Error::network)?;

        Ok(())
    }

    /// Serializes the Message, compresses it with `compressor`, and writes the resulting
    /// OP_COMPRESSED envelope to `writer`.
    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    pub(crate) async fn write_op_compressed_to<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        compressor: &Compressor,
    ) -> Result<()> {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&self.flags.bits().to_le_bytes());
        encoded.extend_from_slice(&self.sections_bytes()?);

        let compressed = compressor.compress(&encoded)?;

        let total_length = Header::LENGTH
            + 2 * std::mem::size_of::<i32>()
            + std::mem::size_of::<u8>()
            + compressed.len();

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id.unwrap_or_else(util::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Compressed,
        };

        header.write_to(writer).await?;
        writer
            .write_i32_le(OpCode::Message as i32)
            .await
            .map_err(Error::network)?;
        writer
            .write_i32_le(encoded.len() as i32)
            .await
            .map_err(Error::network)?;
        writer
            .write_u8(compressor.id() as u8)
            .await
            .map_err(Error::network)?;
        writer.write_all(&compressed).await.map_err(Error::network)?;
        writer.flush().await.map_err(Error::network)?;

        Ok(())
    }
}

bitflags! {
    /// The flag bits of an OP_MSG message.
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

#[cfg(test)]
mod test {
    use bson::doc;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn round_trips_over_a_stream() {
        let message = Message {
            response_to: 0,
            flags: MessageFlags::EXHAUST_ALLOWED,
            document_payload: doc! { "hello": 1, "$db": "admin" },
            document_sequences: vec![DocumentSequence {
                identifier: "documents".to_string(),
                documents: vec![doc! { "x": 1 }, doc! { "x": 2 }],
            }],
            request_id: Some(37),
        };

        let (mut client, mut server) = tokio::io::duplex(1024);
        message.write_to(&mut client).await.unwrap();

        let read_back = Message::read_from(&mut server).await.unwrap();
        assert_eq!(read_back.request_id, Some(37));
        assert!(read_back.flags.contains(MessageFlags::EXHAUST_ALLOWED));
        assert_eq!(read_back.document_payload, message.document_payload);
        assert_eq!(read_back.document_sequences.len(), 1);
        assert_eq!(read_back.document_sequences[0].identifier, "documents");
        assert_eq!(
            read_back.document_sequences[0].documents,
            vec![doc! { "x": 1 }, doc! { "x": 2 }]
        );
    }

    #[tokio::test]
    async fn rejects_unknown_opcode() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // A header with opcode 2004 (OP_QUERY), which this driver does not speak.
        client.write_all(&20i32.to_le_bytes()).await.unwrap();
        client.write_all(&1i32.to_le_bytes()).await.unwrap();
        client.write_all(&0i32.to_le_bytes()).await.unwrap();
        client.write_all(&2004i32.to_le_bytes()).await.unwrap();
        client.write_all(&0u32.to_le_bytes()).await.unwrap();

        let error = Message::read_from(&mut server).await.unwrap_err();
        assert!(
            matches!(*error.kind, crate::error::ErrorKind::InvalidResponse { .. }),
            "{:?}",
            error
        );
    }

    #[tokio::test]
    async fn verifies_crc32c_checksums() {
        let mut payload_bytes = Vec::new();
        payload_bytes.push(0u8);
        doc! { "ok": 1 }.to_writer(&mut payload_bytes).unwrap();

        let body_len = 4 + payload_bytes.len() + 4;
        let header = Header {
            length: (Header::LENGTH + body_len) as i32,
            request_id: 2,
            response_to: 1,
            op_code: OpCode::Message,
        };

        let mut frame = Vec::new();
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(&MessageFlags::CHECKSUM_PRESENT.bits().to_le_bytes());
        frame.extend_from_slice(&payload_bytes);
        let checksum = crc32c::crc32c(&frame);
        frame.extend_from_slice(&checksum.to_le_bytes());

        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&frame).await.unwrap();
        let message = Message::read_from(&mut server).await.unwrap();
        assert_eq!(message.document_payload, doc! { "ok": 1 });

        // Corrupt the checksum and expect a parse failure.
        let mut corrupted = frame.clone();
        let end = corrupted.len() - 1;
        corrupted[end] = corrupted[end].wrapping_add(1);
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&corrupted).await.unwrap();
        assert!(Message::read_from(&mut server).await.is_err());
    }
}
