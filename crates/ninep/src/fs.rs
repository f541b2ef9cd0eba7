//! A small file-tree interface over an attached connection.
//!
//! Names are slash-separated paths relative to the attached root. `""` and
//! `"."` name the root itself; `..`, `.` and empty elements are rejected.

use std::collections::VecDeque;
use std::io::SeekFrom;

use log::{debug, warn};
use tokio::runtime::Handle;

use crate::{
    client::ClientConn,
    context::Context,
    error::Error,
    fcall::*,
    io_err,
    serialize::stat_records,
    session::Root,
    utils::Result,
};

/// Split `name` into walk elements
pub fn split_path(name: &str) -> Result<Vec<&str>> {
    if name.is_empty() || name == "." {
        return Ok(Vec::new());
    }
    let elems: Vec<&str> = name.split('/').collect();
    if elems.iter().any(|e| e.is_empty() || *e == "." || *e == "..") {
        return Err(Error::InvalidPath(name.to_owned()));
    }
    Ok(elems)
}

#[derive(Debug)]
pub struct Fs {
    conn: ClientConn,
    root: Root,
}

impl Fs {
    pub fn new(conn: ClientConn, root: Root) -> Fs {
        Fs { conn, root }
    }

    pub fn conn(&self) -> &ClientConn {
        &self.conn
    }

    pub fn root(&self) -> Root {
        self.root
    }

    /// Bind a fresh fid to `name`. Walks longer than `MAXWELEM` are split.
    async fn walk(&self, ctx: &Context, name: &str) -> Result<(u32, QId)> {
        let elems = split_path(name)?;
        let newfid = self.conn.acquire_fid()?;

        let mut qid = self.root.qid;
        let mut from = self.root.fid;
        let mut chunks: Vec<&[&str]> = elems.chunks(MAXWELEM).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        for chunk in chunks {
            let walked = self.conn.walk(ctx, from, newfid, chunk).await;
            let bound = from == newfid;
            let failure = match walked {
                Ok(wqids) if wqids.len() == chunk.len() => {
                    qid = wqids.last().copied().unwrap_or(qid);
                    from = newfid;
                    continue;
                }
                Ok(_) => Error::NotFound(name.to_owned()),
                Err(e) => e,
            };

            // newfid only holds a file once a walk into it has succeeded
            if bound {
                self.clunk(ctx, newfid).await;
            } else {
                self.conn.release_fid(newfid);
            }
            return Err(failure);
        }

        Ok((newfid, qid))
    }

    async fn clunk(&self, ctx: &Context, fid: u32) {
        if let Err(e) = self.conn.clunk(ctx, fid).await {
            debug!("clunk fid {}: {}", fid, e);
        }
        self.conn.release_fid(fid);
    }

    /// Open `name` for reading
    pub async fn open(&self, ctx: &Context, name: &str) -> Result<File> {
        self.open_file(ctx, name, OpenMode::READ).await
    }

    pub async fn open_file(&self, ctx: &Context, name: &str, mode: OpenMode) -> Result<File> {
        let (fid, _) = self.walk(ctx, name).await?;
        match self.conn.open(ctx, fid, mode).await {
            Ok((qid, iounit)) => Ok(File::new(self.conn.clone(), fid, qid, iounit)),
            Err(e) => {
                self.clunk(ctx, fid).await;
                Err(e)
            }
        }
    }

    /// Create `name` with permissions `perm` and open it with `mode`
    pub async fn create(&self, ctx: &Context, name: &str, perm: u32, mode: OpenMode) -> Result<File> {
        let (dir, base) = name.rsplit_once('/').unwrap_or(("", name));
        if matches!(base, "" | "." | "..") {
            return Err(Error::InvalidPath(name.to_owned()));
        }
        let (fid, _) = self.walk(ctx, dir).await?;
        match self.conn.create(ctx, fid, base, perm, mode).await {
            Ok((qid, iounit)) => Ok(File::new(self.conn.clone(), fid, qid, iounit)),
            Err(e) => {
                self.clunk(ctx, fid).await;
                Err(e)
            }
        }
    }

    pub async fn stat(&self, ctx: &Context, name: &str) -> Result<Stat> {
        let (fid, _) = self.walk(ctx, name).await?;
        let stat = self.conn.stat(ctx, fid).await;
        self.clunk(ctx, fid).await;
        stat
    }

    pub async fn wstat(&self, ctx: &Context, name: &str, stat: &Stat) -> Result<()> {
        let (fid, _) = self.walk(ctx, name).await?;
        let result = self.conn.wstat(ctx, fid, stat).await;
        self.clunk(ctx, fid).await;
        result
    }

    /// All entries of the directory `name`
    pub async fn read_dir(&self, ctx: &Context, name: &str) -> Result<Vec<Stat>> {
        let mut dir = self.open(ctx, name).await?;
        let entries = dir.read_dir(ctx, 0).await;
        dir.close(ctx).await?;
        entries
    }

    pub async fn remove(&self, ctx: &Context, name: &str) -> Result<()> {
        let (fid, _) = self.walk(ctx, name).await?;
        // Tremove clunks the fid whether or not the removal succeeds
        let result = self.conn.remove(ctx, fid).await;
        self.conn.release_fid(fid);
        result
    }

    /// Clunk the root and close the connection
    pub async fn close(self, ctx: &Context) -> Result<()> {
        let result = self.conn.clunk(ctx, self.root.fid).await;
        self.conn.release_fid(self.root.fid);
        self.conn.close().await;
        result
    }
}

/// An open file
#[derive(Debug)]
pub struct File {
    conn: ClientConn,
    fid: u32,
    qid: QId,
    iounit: u32,
    offset: u64,
    dirents: VecDeque<Stat>,
    closed: bool,
}

impl File {
    fn new(conn: ClientConn, fid: u32, qid: QId, iounit: u32) -> File {
        let limit = conn.iounit();
        let iounit = match iounit {
            0 => limit,
            n => n.min(limit),
        };
        File {
            conn,
            fid,
            qid,
            iounit,
            offset: 0,
            dirents: VecDeque::new(),
            closed: false,
        }
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn qid(&self) -> QId {
        self.qid
    }

    /// Largest transfer a single read or write message carries
    pub fn iounit(&self) -> u32 {
        self.iounit
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// One read at the current offset. `Ok(0)` means end of file.
    pub async fn read(&mut self, ctx: &Context, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(ctx, buf, self.offset).await?;
        self.offset += n as u64;
        Ok(n)
    }

    pub async fn read_at(&self, ctx: &Context, buf: &mut [u8], offset: u64) -> Result<usize> {
        let count = buf.len().min(self.iounit as usize);
        let data = self.conn.read(ctx, self.fid, offset, count as u32).await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    pub async fn read_to_end(&mut self, ctx: &Context) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let data = self
                .conn
                .read(ctx, self.fid, self.offset, self.iounit)
                .await?;
            if data.is_empty() {
                return Ok(out);
            }
            self.offset += data.len() as u64;
            out.extend_from_slice(&data);
        }
    }

    /// Write all of `data` at the current offset
    pub async fn write(&mut self, ctx: &Context, data: &[u8]) -> Result<usize> {
        let n = self.write_at(ctx, data, self.offset).await?;
        self.offset += n as u64;
        Ok(n)
    }

    pub async fn write_at(&self, ctx: &Context, data: &[u8], offset: u64) -> Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let end = data.len().min(written + self.iounit as usize);
            let n = self
                .conn
                .write(ctx, self.fid, offset + written as u64, &data[written..end])
                .await? as usize;
            if n == 0 {
                return Err(Error::Io(io_err!(WriteZero, "server accepted no bytes")));
            }
            written += n.min(end - written);
        }
        Ok(written)
    }

    pub async fn seek(&mut self, ctx: &Context, pos: SeekFrom) -> Result<u64> {
        let offset = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.offset.checked_add_signed(d),
            SeekFrom::End(d) => self.stat(ctx).await?.length.checked_add_signed(d),
        };
        let offset = offset.ok_or_else(|| Error::Io(io_err!(InvalidInput, "seek out of range")))?;
        if offset != self.offset {
            self.dirents.clear();
        }
        self.offset = offset;
        Ok(offset)
    }

    pub async fn stat(&self, ctx: &Context) -> Result<Stat> {
        self.conn.stat(ctx, self.fid).await
    }

    /// The next `n` directory entries, or all remaining ones when `n` is 0
    pub async fn read_dir(&mut self, ctx: &Context, n: usize) -> Result<Vec<Stat>> {
        if !self.qid.is_dir() {
            return Err(Error::NotDirectory);
        }

        let mut entries = Vec::new();
        loop {
            while n == 0 || entries.len() < n {
                match self.dirents.pop_front() {
                    Some(stat) => entries.push(stat),
                    None => break,
                }
            }
            if n != 0 && entries.len() == n {
                return Ok(entries);
            }

            let data = self
                .conn
                .read(ctx, self.fid, self.offset, self.iounit)
                .await?;
            if data.is_empty() {
                return Ok(entries);
            }
            self.offset += data.len() as u64;
            self.dirents.extend(stat_records(&data)?);
        }
    }

    /// Clunk the fid and give it back
    pub async fn close(mut self, ctx: &Context) -> Result<()> {
        self.closed = true;
        let result = self.conn.clunk(ctx, self.fid).await;
        self.conn.release_fid(self.fid);
        result
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.closed || self.conn.is_closed() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("fid {} dropped outside a runtime, not clunked", self.fid);
            return;
        };
        let conn = self.conn.clone();
        let fid = self.fid;
        runtime.spawn(async move {
            if let Err(e) = conn.clunk(&Context::background(), fid).await {
                debug!("clunk of dropped fid {}: {}", fid, e);
            }
            conn.release_fid(fid);
        });
    }
}
