//! Session establishment: version negotiation, authentication and attach.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

use crate::{
    client::{codec, ClientConn},
    context::Context,
    error::Error,
    fcall::*,
    fs::Fs,
    serialize::{encode_msg, expect_msg},
    transport,
    utils::Result,
};

/// Smallest msize that leaves room for a one byte payload
const MIN_MSIZE: u32 = IOHDRSZ + HEADER_SIZE + 1;

/// Connection parameters offered during version negotiation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialOptions {
    pub version: String,
    pub msize: u32,
    /// Maximum number of requests in flight
    pub concurrency: u16,
}

impl Default for DialOptions {
    fn default() -> Self {
        DialOptions {
            version: P92000.to_owned(),
            msize: 8192,
            concurrency: 256,
        }
    }
}

impl DialOptions {
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_owned();
        self
    }

    pub fn with_msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    pub fn with_concurrency(mut self, concurrency: u16) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.msize < MIN_MSIZE {
            return Err(Error::Config(format!(
                "msize {} is below the minimum of {}",
                self.msize, MIN_MSIZE
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_owned()));
        }
        if self.version.is_empty() {
            return Err(Error::Config("empty protocol version".to_owned()));
        }
        Ok(())
    }
}

/// Read/write access to the auth file during authentication
pub struct AuthStream<'a> {
    conn: &'a ClientConn,
    ctx: &'a Context,
    afid: u32,
    aqid: QId,
    read_offset: u64,
    write_offset: u64,
}

impl AuthStream<'_> {
    pub fn afid(&self) -> u32 {
        self.afid
    }

    pub fn aqid(&self) -> QId {
        self.aqid
    }

    /// Read up to `count` bytes of the server's side of the exchange
    pub async fn read(&mut self, count: u32) -> Result<Vec<u8>> {
        let count = count.min(self.conn.iounit());
        let data = self
            .conn
            .read(self.ctx, self.afid, self.read_offset, count)
            .await?;
        self.read_offset += data.len() as u64;
        Ok(data)
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.conn.iounit() as usize) {
            let n = self
                .conn
                .write(self.ctx, self.afid, self.write_offset, chunk)
                .await?;
            if n as usize != chunk.len() {
                return Err(Error::Auth(format!(
                    "short write on auth file: {} of {} bytes",
                    n,
                    chunk.len()
                )));
            }
            self.write_offset += n as u64;
        }
        Ok(())
    }
}

/// Runs an authentication protocol over the auth file
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, stream: &mut AuthStream<'_>) -> Result<()>;
}

/// Who attaches to what, and how to prove it
#[derive(Clone)]
pub struct AttachOptions {
    pub uname: String,
    pub aname: String,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl Default for AttachOptions {
    fn default() -> Self {
        AttachOptions {
            uname: std::env::var("USER").unwrap_or_else(|_| "none".to_owned()),
            aname: String::new(),
            authenticator: None,
        }
    }
}

impl fmt::Debug for AttachOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachOptions")
            .field("uname", &self.uname)
            .field("aname", &self.aname)
            .field("authenticator", &self.authenticator.is_some())
            .finish()
    }
}

impl AttachOptions {
    pub fn with_uname(mut self, uname: &str) -> Self {
        self.uname = uname.to_owned();
        self
    }

    pub fn with_aname(mut self, aname: &str) -> Self {
        self.aname = aname.to_owned();
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct DialFsOptions {
    pub dial: DialOptions,
    pub attach: AttachOptions,
}

/// The attached root of the served tree
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Root {
    pub fid: u32,
    pub qid: QId,
}

/// Whether an error reply to `Tauth` means the server does not want authentication
fn auth_not_required(ename: &str) -> bool {
    let ename = ename.to_lowercase();
    ["not required", "no auth"]
        .iter()
        .any(|s| ename.contains(s))
}

async fn negotiate<R, W>(
    frames: &mut FramedRead<R, LengthDelimitedCodec>,
    writer: &mut W,
    opts: &DialOptions,
) -> Result<(u32, String)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = Msg {
        tag: NOTAG,
        body: FCall::TVersion {
            msize: opts.msize,
            version: opts.version.clone(),
        },
    };
    debug!("\t→ {:?}", request);
    writer.write_all(&encode_msg(&request)?).await?;
    writer.flush().await?;

    let frame = match frames.next().await {
        Some(frame) => frame?,
        None => {
            return Err(Error::ConnectionClosed(
                "end of stream during version negotiation".to_owned(),
            ));
        }
    };
    let msg = expect_msg(&frame, MsgType::RVersion)?;
    debug!("\t← {:?}", msg);
    if msg.tag != NOTAG {
        warn!("Rversion carries tag {} instead of NOTAG", msg.tag);
    }

    let FCall::RVersion { msize, version } = msg.body else {
        return Err(Error::Decode("malformed RVersion".to_owned()));
    };
    if msize > opts.msize {
        return Err(Error::MsizeTooLarge {
            offered: opts.msize,
            got: msize,
        });
    }
    if version != opts.version {
        return Err(Error::VersionMismatch {
            want: opts.version.clone(),
            got: version,
        });
    }
    if msize < MIN_MSIZE {
        return Err(Error::Decode(format!("server msize {} is unusable", msize)));
    }
    Ok((msize, version))
}

impl ClientConn {
    /// Negotiate the protocol version on `stream` and start serving requests.
    ///
    /// On failure the stream is dropped, closing it.
    pub async fn connect<S>(stream: S, opts: &DialOptions) -> Result<ClientConn>
    where
        S: 'static + AsyncRead + AsyncWrite + Send,
    {
        opts.validate()?;

        let (reader, mut writer) = tokio::io::split(stream);
        let mut frames = FramedRead::new(reader, codec(opts.msize));
        let (msize, version) = negotiate(&mut frames, &mut writer, opts).await?;
        frames.decoder_mut().set_max_frame_length(msize as usize);

        info!("negotiated {} with msize {}", version, msize);
        Ok(ClientConn::spawn(
            frames,
            writer,
            msize,
            version,
            opts.concurrency,
        ))
    }

    /// Bind a fresh FID to the root of the tree named by `opts.aname`,
    /// authenticating first if the server asks for it
    pub async fn attach_root(&self, ctx: &Context, opts: &AttachOptions) -> Result<Root> {
        let afid = self.authenticate(ctx, opts).await?;

        let attached = match self.acquire_fid() {
            Ok(fid) => self
                .attach(ctx, fid, afid.unwrap_or(NOFID), &opts.uname, &opts.aname)
                .await
                .map(|qid| Root { fid, qid })
                .inspect_err(|_| self.release_fid(fid)),
            Err(e) => Err(e),
        };

        if let Some(afid) = afid {
            self.forget_auth_fid(ctx, afid).await;
        }

        let root = attached?;
        debug!(
            "attached {:?} as {:?}: fid {} {}",
            opts.aname, opts.uname, root.fid, root.qid
        );
        Ok(root)
    }

    /// Run the auth exchange. `None` means the server does not require it.
    async fn authenticate(&self, ctx: &Context, opts: &AttachOptions) -> Result<Option<u32>> {
        let afid = self.acquire_fid()?;
        let aqid = match self.auth(ctx, afid, &opts.uname, &opts.aname).await {
            Ok(aqid) => aqid,
            Err(Error::Remote(ename)) if auth_not_required(&ename) => {
                debug!("authentication not required: {}", ename);
                self.release_fid(afid);
                return Ok(None);
            }
            Err(e) => {
                self.release_fid(afid);
                return Err(match e {
                    Error::Remote(ename) => Error::Auth(ename),
                    e => e,
                });
            }
        };

        let Some(authenticator) = &opts.authenticator else {
            self.forget_auth_fid(ctx, afid).await;
            return Err(Error::Auth(
                "server requires authentication and no authenticator is configured".to_owned(),
            ));
        };

        let mut stream = AuthStream {
            conn: self,
            ctx,
            afid,
            aqid,
            read_offset: 0,
            write_offset: 0,
        };
        if let Err(e) = authenticator.authenticate(&mut stream).await {
            self.forget_auth_fid(ctx, afid).await;
            return Err(match e {
                Error::Remote(ename) => Error::Auth(ename),
                e => e,
            });
        }
        Ok(Some(afid))
    }

    async fn forget_auth_fid(&self, ctx: &Context, afid: u32) {
        if let Err(e) = self.clunk(ctx, afid).await {
            debug!("clunk of auth fid {}: {}", afid, e);
        }
        self.release_fid(afid);
    }
}

/// Resolve `service`, connect to it and negotiate the protocol version
pub async fn dial(service: &str, opts: &DialOptions) -> Result<ClientConn> {
    opts.validate()?;
    let endpoint = transport::resolve(service)?;
    let stream = transport::connect(&endpoint).await?;
    ClientConn::connect(stream, opts).await
}

/// Dial `service` and attach to its root
pub async fn dial_fs(service: &str, opts: &DialFsOptions) -> Result<Fs> {
    let conn = dial(service, &opts.dial).await?;
    match conn.attach_root(&Context::background(), &opts.attach).await {
        Ok(root) => Ok(Fs::new(conn, root)),
        Err(e) => {
            conn.close().await;
            Err(e)
        }
    }
}
