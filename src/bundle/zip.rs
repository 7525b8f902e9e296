//! Streaming zip encoder.
//!
//! Members are written strictly forward: sizes and CRCs are not known when a
//! member's local header goes out, so every member carries a data descriptor
//! and the header stores zip64 placeholders. The central directory, written
//! at the end, carries the real values in zip64 extra fields.
//!
//! All timestamps are pinned to the DOS epoch and compression is
//! single-threaded, so encoding the same tree twice yields byte-identical
//! output. The sizing pass depends on that.

use async_compression::tokio::write::DeflateEncoder;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::sink::CountingWriter;
use super::MemberMode;
use crate::utils::errors::ExportError;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;

const ZIP64_EXTRA_TAG: u16 = 0x0001;
const VERSION_ZIP64: u16 = 45;
const VERSION_MADE_BY_UNIX: u16 = (3 << 8) | VERSION_ZIP64;
// bit 3: sizes in data descriptor, bit 11: UTF-8 names
const FLAGS: u16 = 0x0808;
// 1980-01-01 00:00:00, the DOS epoch
const DOS_TIME: u16 = 0x0000;
const DOS_DATE: u16 = 0x0021;
const EXTERNAL_ATTRS_REGULAR_FILE: u32 = 0o100644 << 16;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

const U16_SENTINEL: u16 = 0xFFFF;
const U32_SENTINEL: u32 = 0xFFFF_FFFF;

struct CentralEntry {
    path: String,
    method: u16,
    crc32: u32,
    compressed: u64,
    uncompressed: u64,
    header_offset: u64,
}

struct OpenMember {
    path: String,
    method: u16,
    header_offset: u64,
    data_start: u64,
    crc: crc32fast::Hasher,
    uncompressed: u64,
}

enum Output<W> {
    Plain(CountingWriter<W>),
    Deflate(DeflateEncoder<CountingWriter<W>>),
    Detached,
}

/// Forward-only zip writer.
///
/// Usage: `begin_member` / `write_member_data` / `finish_member` per file,
/// then `finish` to emit the central directory.
pub struct ZipEncoder<W> {
    out: Output<W>,
    mode: MemberMode,
    entries: Vec<CentralEntry>,
    member: Option<OpenMember>,
}

impl<W: AsyncWrite + Unpin + Send> ZipEncoder<W> {
    pub fn new(writer: W, mode: MemberMode) -> Self {
        Self {
            out: Output::Plain(CountingWriter::new(writer)),
            mode,
            entries: Vec::new(),
            member: None,
        }
    }

    fn plain_mut(&mut self) -> crate::Result<&mut CountingWriter<W>> {
        match &mut self.out {
            Output::Plain(writer) => Ok(writer),
            _ => Err(ExportError::Archive(
                "zip writer is mid-member".to_string(),
            )),
        }
    }

    /// Open the next member and emit its local header.
    pub async fn begin_member(&mut self, path: &str) -> crate::Result<()> {
        if self.member.is_some() {
            return Err(ExportError::Archive(
                "previous zip member not finished".to_string(),
            ));
        }
        if path.len() > u16::MAX as usize {
            return Err(ExportError::Archive(format!(
                "member path exceeds the zip name field: {path}"
            )));
        }
        let method = match self.mode {
            MemberMode::Deflated => METHOD_DEFLATED,
            MemberMode::Stored => METHOD_STORED,
        };
        let (header_offset, data_start) = {
            let writer = self.plain_mut()?;
            let header_offset = writer.written();
            writer.write_all(&local_header(path, method)).await?;
            (header_offset, writer.written())
        };
        self.member = Some(OpenMember {
            path: path.to_string(),
            method,
            header_offset,
            data_start,
            crc: crc32fast::Hasher::new(),
            uncompressed: 0,
        });
        if method == METHOD_DEFLATED {
            self.out = match std::mem::replace(&mut self.out, Output::Detached) {
                Output::Plain(writer) => Output::Deflate(DeflateEncoder::new(writer)),
                _ => {
                    return Err(ExportError::Archive(
                        "zip writer is mid-member".to_string(),
                    ))
                }
            };
        }
        trace!(path, offset = header_offset, "zip member opened");
        Ok(())
    }

    /// Append uncompressed member bytes.
    pub async fn write_member_data(&mut self, data: &[u8]) -> crate::Result<()> {
        let member = self
            .member
            .as_mut()
            .ok_or_else(|| ExportError::Archive("no open zip member".to_string()))?;
        member.crc.update(data);
        member.uncompressed += data.len() as u64;
        match &mut self.out {
            Output::Plain(writer) => writer.write_all(data).await?,
            Output::Deflate(writer) => writer.write_all(data).await?,
            Output::Detached => {
                return Err(ExportError::Archive("zip writer detached".to_string()))
            }
        }
        Ok(())
    }

    /// Close the current member: flush its compressor and emit the data
    /// descriptor carrying CRC and sizes.
    pub async fn finish_member(&mut self) -> crate::Result<()> {
        let member = self
            .member
            .take()
            .ok_or_else(|| ExportError::Archive("no open zip member".to_string()))?;
        self.out = match std::mem::replace(&mut self.out, Output::Detached) {
            Output::Deflate(mut encoder) => {
                encoder.shutdown().await?;
                Output::Plain(encoder.into_inner())
            }
            Output::Plain(writer) => Output::Plain(writer),
            Output::Detached => {
                return Err(ExportError::Archive("zip writer detached".to_string()))
            }
        };
        let writer = self.plain_mut()?;
        let compressed = writer.written() - member.data_start;
        let crc32 = member.crc.finalize();
        writer
            .write_all(&data_descriptor(crc32, compressed, member.uncompressed))
            .await?;
        trace!(
            path = %member.path,
            compressed,
            uncompressed = member.uncompressed,
            "zip member closed"
        );
        self.entries.push(CentralEntry {
            path: member.path,
            method: member.method,
            crc32,
            compressed,
            uncompressed: member.uncompressed,
            header_offset: member.header_offset,
        });
        Ok(())
    }

    /// Emit the central directory and end records. Returns the total archive
    /// length and the underlying writer.
    pub async fn finish(mut self) -> crate::Result<(u64, W)> {
        if self.member.is_some() {
            return Err(ExportError::Archive(
                "zip member still open at finish".to_string(),
            ));
        }
        let entries = std::mem::take(&mut self.entries);
        let writer = self.plain_mut()?;
        let cd_offset = writer.written();
        for entry in &entries {
            writer.write_all(&central_entry(entry)).await?;
        }
        let cd_size = writer.written() - cd_offset;
        let eocd64_offset = writer.written();
        writer
            .write_all(&zip64_eocd(entries.len() as u64, cd_size, cd_offset))
            .await?;
        writer.write_all(&zip64_locator(eocd64_offset)).await?;
        writer.write_all(&end_of_central_directory()).await?;
        writer.flush().await?;
        let total = writer.written();
        match std::mem::replace(&mut self.out, Output::Detached) {
            Output::Plain(writer) => Ok((total, writer.into_inner())),
            _ => Err(ExportError::Archive("zip writer detached".to_string())),
        }
    }
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn local_header(path: &str, method: u16) -> Vec<u8> {
    let name = path.as_bytes();
    let mut buf = Vec::with_capacity(50 + name.len());
    put_u32(&mut buf, LOCAL_HEADER_SIG);
    put_u16(&mut buf, VERSION_ZIP64);
    put_u16(&mut buf, FLAGS);
    put_u16(&mut buf, method);
    put_u16(&mut buf, DOS_TIME);
    put_u16(&mut buf, DOS_DATE);
    put_u32(&mut buf, 0); // crc in descriptor
    put_u32(&mut buf, U32_SENTINEL);
    put_u32(&mut buf, U32_SENTINEL);
    put_u16(&mut buf, name.len() as u16);
    put_u16(&mut buf, 20); // zip64 extra: tag + len + two u64s
    buf.extend_from_slice(name);
    put_u16(&mut buf, ZIP64_EXTRA_TAG);
    put_u16(&mut buf, 16);
    put_u64(&mut buf, 0); // real sizes follow in the descriptor
    put_u64(&mut buf, 0);
    buf
}

fn data_descriptor(crc32: u32, compressed: u64, uncompressed: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    put_u32(&mut buf, DATA_DESCRIPTOR_SIG);
    put_u32(&mut buf, crc32);
    put_u64(&mut buf, compressed);
    put_u64(&mut buf, uncompressed);
    buf
}

fn central_entry(entry: &CentralEntry) -> Vec<u8> {
    let name = entry.path.as_bytes();
    let mut buf = Vec::with_capacity(74 + name.len());
    put_u32(&mut buf, CENTRAL_HEADER_SIG);
    put_u16(&mut buf, VERSION_MADE_BY_UNIX);
    put_u16(&mut buf, VERSION_ZIP64);
    put_u16(&mut buf, FLAGS);
    put_u16(&mut buf, entry.method);
    put_u16(&mut buf, DOS_TIME);
    put_u16(&mut buf, DOS_DATE);
    put_u32(&mut buf, entry.crc32);
    put_u32(&mut buf, U32_SENTINEL);
    put_u32(&mut buf, U32_SENTINEL);
    put_u16(&mut buf, name.len() as u16);
    put_u16(&mut buf, 28); // zip64 extra: tag + len + three u64s
    put_u16(&mut buf, 0); // comment
    put_u16(&mut buf, 0); // disk start
    put_u16(&mut buf, 0); // internal attrs
    put_u32(&mut buf, EXTERNAL_ATTRS_REGULAR_FILE);
    put_u32(&mut buf, U32_SENTINEL); // header offset
    buf.extend_from_slice(name);
    put_u16(&mut buf, ZIP64_EXTRA_TAG);
    put_u16(&mut buf, 24);
    put_u64(&mut buf, entry.uncompressed);
    put_u64(&mut buf, entry.compressed);
    put_u64(&mut buf, entry.header_offset);
    buf
}

fn zip64_eocd(entries: u64, cd_size: u64, cd_offset: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(56);
    put_u32(&mut buf, ZIP64_EOCD_SIG);
    put_u64(&mut buf, 44); // size of the record past this field
    put_u16(&mut buf, VERSION_MADE_BY_UNIX);
    put_u16(&mut buf, VERSION_ZIP64);
    put_u32(&mut buf, 0); // this disk
    put_u32(&mut buf, 0); // central directory disk
    put_u64(&mut buf, entries);
    put_u64(&mut buf, entries);
    put_u64(&mut buf, cd_size);
    put_u64(&mut buf, cd_offset);
    buf
}

fn zip64_locator(eocd64_offset: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    put_u32(&mut buf, ZIP64_LOCATOR_SIG);
    put_u32(&mut buf, 0); // disk with the zip64 record
    put_u64(&mut buf, eocd64_offset);
    put_u32(&mut buf, 1); // total disks
    buf
}

fn end_of_central_directory() -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    put_u32(&mut buf, EOCD_SIG);
    put_u16(&mut buf, U16_SENTINEL);
    put_u16(&mut buf, U16_SENTINEL);
    put_u16(&mut buf, U16_SENTINEL);
    put_u16(&mut buf, U16_SENTINEL);
    put_u32(&mut buf, U32_SENTINEL);
    put_u32(&mut buf, U32_SENTINEL);
    put_u16(&mut buf, 0); // no comment
    buf
}
