//! Streaming tar encoder.
//!
//! Tar headers carry the member size up front, so each member is opened with
//! the size the tree walk reported. A file that changes size while it is
//! being read cannot produce a well-formed archive and fails the pass.
//! Headers are pinned to mtime 0 and fixed ownership so repeated passes over
//! the same tree emit identical bytes.

use tar::{EntryType, Header};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::sink::CountingWriter;
use crate::utils::errors::ExportError;

const BLOCK: usize = 512;
// classic header name field
const NAME_FIELD: usize = 100;
const LONG_LINK_NAME: &str = "././@LongLink";

struct OpenTarMember {
    path: String,
    declared: u64,
    written: u64,
}

/// Forward-only tar writer with the same member cadence as the zip encoder.
pub struct TarEncoder<W> {
    out: CountingWriter<W>,
    member: Option<OpenTarMember>,
}

impl<W: AsyncWrite + Unpin + Send> TarEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: CountingWriter::new(writer),
            member: None,
        }
    }

    /// Open the next member. `size` must be the exact number of data bytes
    /// that will follow.
    pub async fn begin_member(&mut self, path: &str, size: u64) -> crate::Result<()> {
        if self.member.is_some() {
            return Err(ExportError::Archive(
                "previous tar member not finished".to_string(),
            ));
        }
        if path.len() > NAME_FIELD {
            self.write_long_name(path).await?;
        }
        let mut header = Header::new_gnu();
        header
            .set_path(truncate_name(path))
            .map_err(|e| ExportError::Archive(format!("tar path rejected: {e}")))?;
        header.set_size(size);
        fill_fixed_fields(&mut header);
        header.set_cksum();
        self.out.write_all(header.as_bytes()).await?;
        self.member = Some(OpenTarMember {
            path: path.to_string(),
            declared: size,
            written: 0,
        });
        trace!(path, size, "tar member opened");
        Ok(())
    }

    // GNU long-name entry: a synthetic member whose data is the full path
    async fn write_long_name(&mut self, path: &str) -> crate::Result<()> {
        let name = path.as_bytes();
        let mut header = Header::new_gnu();
        header
            .set_path(LONG_LINK_NAME)
            .map_err(|e| ExportError::Archive(format!("tar long name rejected: {e}")))?;
        header.set_entry_type(EntryType::GNULongName);
        header.set_size(name.len() as u64 + 1);
        fill_fixed_fields(&mut header);
        header.set_cksum();
        self.out.write_all(header.as_bytes()).await?;
        self.out.write_all(name).await?;
        self.out.write_all(&[0]).await?;
        self.pad_block(name.len() + 1).await?;
        Ok(())
    }

    pub async fn write_member_data(&mut self, data: &[u8]) -> crate::Result<()> {
        let member = self
            .member
            .as_mut()
            .ok_or_else(|| ExportError::Archive("no open tar member".to_string()))?;
        member.written += data.len() as u64;
        if member.written > member.declared {
            return Err(ExportError::Archive(format!(
                "{} grew past its declared {} bytes while being read",
                member.path, member.declared
            )));
        }
        self.out.write_all(data).await?;
        Ok(())
    }

    pub async fn finish_member(&mut self) -> crate::Result<()> {
        let member = self
            .member
            .take()
            .ok_or_else(|| ExportError::Archive("no open tar member".to_string()))?;
        if member.written != member.declared {
            return Err(ExportError::Archive(format!(
                "{} yielded {} bytes, header declared {}",
                member.path, member.written, member.declared
            )));
        }
        self.pad_block(member.declared as usize).await?;
        Ok(())
    }

    /// Emit the end-of-archive marker. Returns the total archive length and
    /// the underlying writer.
    pub async fn finish(mut self) -> crate::Result<(u64, W)> {
        if self.member.is_some() {
            return Err(ExportError::Archive(
                "tar member still open at finish".to_string(),
            ));
        }
        self.out.write_all(&[0u8; 2 * BLOCK]).await?;
        self.out.flush().await?;
        let total = self.out.written();
        Ok((total, self.out.into_inner()))
    }

    async fn pad_block(&mut self, data_len: usize) -> crate::Result<()> {
        let rem = data_len % BLOCK;
        if rem != 0 {
            self.out.write_all(&vec![0u8; BLOCK - rem]).await?;
        }
        Ok(())
    }
}

fn fill_fixed_fields(header: &mut Header) {
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
}

// keep at most the classic header's 100 bytes, on a char boundary
fn truncate_name(path: &str) -> &str {
    if path.len() <= NAME_FIELD {
        return path;
    }
    let mut end = NAME_FIELD;
    while !path.is_char_boundary(end) {
        end -= 1;
    }
    &path[..end]
}
