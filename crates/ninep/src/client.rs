//! Asynchronous client side 9P library.
//!
//! # Protocol
//! 9P2000
//!
//! A [`ClientConn`] owns one transport stream. A single background task reads
//! every incoming frame and hands it to the request waiting on the frame's
//! tag; callers write their requests under one lock, so any number of tasks
//! can have requests in flight at once, bounded by the tag pool.

use {
    crate::{
        context::Context,
        error::Error,
        fcall::*,
        pool::{FidPool, TagPool},
        serialize::{self, encode_msg, expect_msg, frame_tag, Encodable},
        utils::{lock, Result},
    },
    bytes::Bytes,
    log::{debug, error, log_enabled, trace, warn, Level},
    std::{
        collections::HashMap,
        io::Cursor,
        sync::{Arc, Mutex},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite, AsyncWriteExt},
        runtime::Handle,
        sync::oneshot,
        task::JoinHandle,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{length_delimited::LengthDelimitedCodec, FramedRead},
};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reply = Result<Bytes>;

/// Length-delimited framing of 9P: the size field counts itself
pub(crate) fn codec(max_size: u32) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .max_frame_length(max_size as usize)
        .new_codec()
}

fn log_frame(dir: &str, frame: &[u8]) {
    if log_enabled!(Level::Trace) {
        match serialize::read_msg(&mut Cursor::new(frame)) {
            Ok(msg) => trace!("\t{} {:?}", dir, msg),
            Err(e) => trace!("\t{} undecodable frame: {}", dir, e),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    pending: HashMap<u16, oneshot::Sender<Reply>>,
    closed: Option<String>,
}

/// Tag → waiting request. Removing an entry is what makes delivery happen
/// at most once.
#[derive(Debug, Default)]
struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    fn register(&self, tag: u16) -> Result<oneshot::Receiver<Reply>> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.closed {
            return Err(Error::ConnectionClosed(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        if state.pending.insert(tag, tx).is_some() {
            error!("tag {} registered twice", tag);
        }
        Ok(rx)
    }

    fn take(&self, tag: u16) -> Option<oneshot::Sender<Reply>> {
        lock(&self.state).pending.remove(&tag)
    }

    /// Mark closed and fail everything still waiting
    fn fail_all(&self, reason: &str) {
        let pending = {
            let mut state = lock(&self.state);
            if state.closed.is_none() {
                state.closed = Some(reason.to_owned());
            }
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!("failing {} pending requests: {}", pending.len(), reason);
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed(reason.to_owned())));
        }
    }

    fn closed(&self) -> Option<String> {
        lock(&self.state).closed.clone()
    }
}

/// State shared between callers and the dispatch task
#[derive(Debug)]
struct Shared {
    registry: Registry,
    tags: TagPool,
}

impl Shared {
    fn shutdown(&self, reason: &str) {
        self.registry.fail_all(reason);
        self.tags.close();
    }

    /// Hand a frame to its waiter. An `Err` means framing can no longer be trusted.
    fn route(&self, frame: Bytes) -> std::result::Result<(), String> {
        let tag = frame_tag(&frame)
            .ok_or_else(|| format!("malformed message of {} bytes", frame.len() + 4))?;
        log_frame("←", &frame);

        match self.registry.take(tag) {
            Some(tx) => {
                if tx.send(Ok(frame)).is_err() {
                    debug!("tag {}: waiter went away, response dropped", tag);
                }
            }
            None => warn!(
                "response for unknown tag {} (type {}), skipped",
                tag, frame[0]
            ),
        }
        Ok(())
    }
}

async fn dispatch<R>(shared: Arc<Shared>, mut frames: FramedRead<R, LengthDelimitedCodec>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                if let Err(reason) = shared.route(frame.freeze()) {
                    break reason;
                }
            }
            Some(Err(e)) => break format!("read: {}", e),
            None => break "end of stream".to_owned(),
        }
    };

    debug!("dispatch loop exiting: {}", reason);
    shared.shutdown(&reason);
}

struct Inner {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    fids: FidPool,
    msize: u32,
    version: String,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
        self.shared.shutdown("connection dropped");
    }
}

impl Inner {
    async fn write_frame(&self, buf: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| Error::ConnectionClosed("closed by client".to_owned()))?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Per-request lifecycle.
///
/// `TagAcquired → AwaitingResponse → {ResponseDelivered | Canceled → FlushSent → FlushAcked} → TagReleased`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestState {
    TagAcquired,
    AwaitingResponse,
    ResponseDelivered,
    Canceled,
    FlushSent,
    FlushAcked,
    TagReleased,
}

/// Wait for the detached write of a request to finish
async fn written(write: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    let Some(handle) = write.as_mut() else {
        return Ok(());
    };
    let result = handle
        .await
        .unwrap_or_else(|e| Err(Error::ConnectionClosed(format!("writer task: {}", e))));
    *write = None;
    result
}

async fn recv(rx: &mut Option<oneshot::Receiver<Reply>>) -> Reply {
    let Some(pending) = rx.as_mut() else {
        return Err(Error::ConnectionClosed("response already taken".to_owned()));
    };
    let reply = pending
        .await
        .unwrap_or_else(|_| Err(Error::ConnectionClosed("dispatch loop gone".to_owned())));
    *rx = None;
    reply
}

/// A request on the wire, holding its tag until the response (or the flush
/// acknowledgement) has been received.
///
/// Dropping it while the response is outstanding flushes the tag in the
/// background before releasing it.
pub struct PendingRequest {
    conn: ClientConn,
    tag: u16,
    rx: Option<oneshot::Receiver<Reply>>,
    write: Option<JoinHandle<Result<()>>>,
    state: RequestState,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("tag", &self.tag)
            .field("state", &self.state)
            .finish()
    }
}

impl PendingRequest {
    pub fn tag(&self) -> u16 {
        self.tag
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Wait for the response frame. Cancel safe: dropping the future keeps
    /// the request awaiting.
    pub async fn wait(&mut self) -> Result<Bytes> {
        let reply = recv(&mut self.rx).await;
        self.state = RequestState::ResponseDelivered;
        reply
    }

    /// Abandon the request: flush its tag, wait for the server to acknowledge,
    /// then release. Runs to completion even if the caller goes away.
    pub async fn cancel(mut self) {
        self.state = RequestState::Canceled;
        let tag = self.tag;
        if let Err(e) = tokio::spawn(async move { self.flush().await }).await {
            warn!("flush of tag {} did not complete: {}", tag, e);
        }
    }

    async fn flush(&mut self) {
        self.state = RequestState::Canceled;
        let conn = self.conn.clone();
        let oldtag = self.tag;

        // Tflush must not overtake the request it refers to
        if let Err(e) = written(&mut self.write).await {
            debug!("tag {} never reached the server: {}", oldtag, e);
            self.state = RequestState::FlushAcked;
            return;
        }

        // The original response may still win the race for a free tag
        let flush_tag = tokio::select! {
            biased;
            _ = recv(&mut self.rx) => {
                self.state = RequestState::ResponseDelivered;
                return;
            }
            tag = conn.inner.shared.tags.acquire() => tag.ok(),
        };

        if let Some(tag) = flush_tag {
            match conn.send(tag, FCall::TFlush { oldtag }).await {
                Ok(mut flush) => {
                    self.state = RequestState::FlushSent;
                    match flush.wait().await {
                        Ok(frame) => match expect_msg(&frame, MsgType::RFlush) {
                            Ok(_) => debug!("tag {} flushed", oldtag),
                            Err(e) => warn!("flush of tag {}: {}", oldtag, e),
                        },
                        Err(e) => debug!("flush of tag {}: {}", oldtag, e),
                    }
                }
                Err(e) => debug!("flush of tag {} not sent: {}", oldtag, e),
            }
        }
        self.state = RequestState::FlushAcked;
    }

    fn release(&mut self) {
        self.conn.inner.shared.registry.take(self.tag);
        self.conn.inner.shared.tags.release(self.tag);
        self.state = RequestState::TagReleased;
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        match self.state {
            RequestState::TagReleased => {}
            RequestState::AwaitingResponse if !self.conn.is_closed() => {
                let Ok(runtime) = Handle::try_current() else {
                    warn!("tag {} abandoned outside a runtime, leaking it", self.tag);
                    return;
                };
                let mut abandoned = PendingRequest {
                    conn: self.conn.clone(),
                    tag: self.tag,
                    rx: self.rx.take(),
                    write: self.write.take(),
                    state: RequestState::AwaitingResponse,
                };
                self.state = RequestState::TagReleased;
                runtime.spawn(async move { abandoned.flush().await });
            }
            RequestState::Canceled | RequestState::FlushSent if !self.conn.is_closed() => {
                warn!("flush of tag {} interrupted, leaking it", self.tag);
            }
            _ => self.release(),
        }
    }
}

/// A 9P2000 client connection.
///
/// Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct ClientConn {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("version", &self.inner.version)
            .field("msize", &self.inner.msize)
            .field("free_tags", &self.free_tags())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientConn {
    /// Start the dispatch loop on an already negotiated stream
    pub(crate) fn spawn<R, W>(
        frames: FramedRead<R, LengthDelimitedCodec>,
        writer: W,
        msize: u32,
        version: String,
        concurrency: u16,
    ) -> ClientConn
    where
        R: 'static + AsyncRead + Send + Unpin,
        W: 'static + AsyncWrite + Send + Unpin,
    {
        let shared = Arc::new(Shared {
            registry: Registry::default(),
            tags: TagPool::new(concurrency),
        });
        let reader = tokio::spawn(dispatch(shared.clone(), frames));

        ClientConn {
            inner: Arc::new(Inner {
                shared,
                writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
                fids: FidPool::new(),
                msize,
                version,
                reader,
            }),
        }
    }

    /// Negotiated maximum message size
    pub fn msize(&self) -> u32 {
        self.inner.msize
    }

    /// Negotiated protocol version
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// Default transfer size for reads and writes: what fits in one message
    pub fn iounit(&self) -> u32 {
        self.inner.msize - IOHDRSZ
    }

    pub fn free_tags(&self) -> usize {
        self.inner.shared.tags.free()
    }

    pub fn capacity(&self) -> u16 {
        self.inner.shared.tags.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.registry.closed().is_some()
    }

    pub fn acquire_fid(&self) -> Result<u32> {
        self.inner.fids.acquire()
    }

    pub fn release_fid(&self, fid: u32) {
        self.inner.fids.release(fid)
    }

    /// Fail every pending request, stop reading and shut the stream down
    pub async fn close(&self) {
        self.inner.shared.shutdown("closed by client");
        self.inner.reader.abort();
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("shutdown: {}", e);
            }
        }
    }

    /// Acquire a tag and put `body` on the wire
    pub async fn start(&self, body: FCall) -> Result<PendingRequest> {
        let tag = self.inner.shared.tags.acquire().await?;
        self.send(tag, body).await
    }

    async fn send(&self, tag: u16, body: FCall) -> Result<PendingRequest> {
        let mut req = PendingRequest {
            conn: self.clone(),
            tag,
            rx: None,
            write: None,
            state: RequestState::TagAcquired,
        };

        let msg = Msg { tag, body };
        let len = msg.encoded_len();
        if len > self.inner.msize as usize {
            return Err(Error::Encode(format!(
                "{:?} of {} bytes exceeds msize {}",
                MsgType::from(&msg.body),
                len,
                self.inner.msize
            )));
        }
        let buf = encode_msg(&msg)?;
        req.rx = Some(self.inner.shared.registry.register(tag)?);
        req.state = RequestState::AwaitingResponse;
        log_frame("→", &buf[4..]);

        // Detached so a dropped caller cannot leave half a message on the wire
        let inner = self.inner.clone();
        req.write = Some(tokio::spawn(async move { inner.write_frame(buf).await }));

        match written(&mut req.write).await {
            Ok(()) => Ok(req),
            Err(e) => {
                if e.is_fatal() {
                    error!("write failed, closing connection: {}", e);
                    self.inner.shared.shutdown(&e.to_string());
                }
                Err(e)
            }
        }
    }

    /// One request/response round trip. On cancellation the request is
    /// flushed before the error is returned.
    async fn rpc(&self, ctx: &Context, body: FCall) -> Result<Msg> {
        let typ = MsgType::from(&body);
        let expected = typ
            .response()
            .ok_or_else(|| Error::Encode(format!("{:?} is not a request", typ)))?;
        if let Some(e) = ctx.err() {
            return Err(e);
        }

        let mut req = tokio::select! {
            biased;
            e = ctx.done() => return Err(e),
            req = self.start(body) => req?,
        };

        enum Outcome {
            Reply(Result<Bytes>),
            Done(Error),
        }
        let outcome = tokio::select! {
            biased;
            reply = req.wait() => Outcome::Reply(reply),
            e = ctx.done() => Outcome::Done(e),
        };

        match outcome {
            Outcome::Reply(reply) => {
                let frame = reply?;
                drop(req);
                expect_msg(&frame, expected)
            }
            Outcome::Done(e) => {
                debug!("{:?} on tag {} abandoned: {}", typ, req.tag(), e);
                req.cancel().await;
                Err(e)
            }
        }
    }

    pub async fn auth(&self, ctx: &Context, afid: u32, uname: &str, aname: &str) -> Result<QId> {
        let msg = self
            .rpc(
                ctx,
                FCall::TAuth {
                    afid,
                    uname: uname.to_owned(),
                    aname: aname.to_owned(),
                },
            )
            .await?;
        match msg.body {
            FCall::RAuth { aqid } => Ok(aqid),
            _ => Err(unexpected(MsgType::RAuth, &msg)),
        }
    }

    pub async fn attach(
        &self,
        ctx: &Context,
        fid: u32,
        afid: u32,
        uname: &str,
        aname: &str,
    ) -> Result<QId> {
        let msg = self
            .rpc(
                ctx,
                FCall::TAttach {
                    fid,
                    afid,
                    uname: uname.to_owned(),
                    aname: aname.to_owned(),
                },
            )
            .await?;
        match msg.body {
            FCall::RAttach { qid } => Ok(qid),
            _ => Err(unexpected(MsgType::RAttach, &msg)),
        }
    }

    /// Walk `fid` along `wnames` into `newfid`. Fewer QIDs than names means
    /// the walk stopped early and `newfid` was not bound.
    pub async fn walk<S: AsRef<str>>(
        &self,
        ctx: &Context,
        fid: u32,
        newfid: u32,
        wnames: &[S],
    ) -> Result<Vec<QId>> {
        if wnames.len() > MAXWELEM {
            return Err(Error::Encode(format!(
                "walk of {} elements exceeds {}",
                wnames.len(),
                MAXWELEM
            )));
        }
        let wnames = wnames.iter().map(|s| s.as_ref().to_owned()).collect();
        let msg = self
            .rpc(
                ctx,
                FCall::TWalk {
                    fid,
                    newfid,
                    wnames,
                },
            )
            .await?;
        match msg.body {
            FCall::RWalk { wqids } if wqids.len() > MAXWELEM => Err(Error::Decode(format!(
                "walk returned {} qids",
                wqids.len()
            ))),
            FCall::RWalk { wqids } => Ok(wqids),
            _ => Err(unexpected(MsgType::RWalk, &msg)),
        }
    }

    /// Returns the opened qid and the server's iounit
    pub async fn open(&self, ctx: &Context, fid: u32, mode: OpenMode) -> Result<(QId, u32)> {
        let msg = self.rpc(ctx, FCall::TOpen { fid, mode }).await?;
        match msg.body {
            FCall::ROpen { qid, iounit } => Ok((qid, iounit)),
            _ => Err(unexpected(MsgType::ROpen, &msg)),
        }
    }

    pub async fn create(
        &self,
        ctx: &Context,
        fid: u32,
        name: &str,
        perm: u32,
        mode: OpenMode,
    ) -> Result<(QId, u32)> {
        let msg = self
            .rpc(
                ctx,
                FCall::TCreate {
                    fid,
                    name: name.to_owned(),
                    perm,
                    mode,
                },
            )
            .await?;
        match msg.body {
            FCall::RCreate { qid, iounit } => Ok((qid, iounit)),
            _ => Err(unexpected(MsgType::RCreate, &msg)),
        }
    }

    pub async fn read(&self, ctx: &Context, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let msg = self.rpc(ctx, FCall::TRead { fid, offset, count }).await?;
        match msg.body {
            FCall::RRead { data } if data.0.len() > count as usize => Err(Error::Decode(format!(
                "read of {} bytes returned {}",
                count,
                data.0.len()
            ))),
            FCall::RRead { data } => Ok(data.0),
            _ => Err(unexpected(MsgType::RRead, &msg)),
        }
    }

    pub async fn write(&self, ctx: &Context, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let msg = self
            .rpc(
                ctx,
                FCall::TWrite {
                    fid,
                    offset,
                    data: Data(data.to_vec()),
                },
            )
            .await?;
        match msg.body {
            FCall::RWrite { count } => Ok(count),
            _ => Err(unexpected(MsgType::RWrite, &msg)),
        }
    }

    pub async fn clunk(&self, ctx: &Context, fid: u32) -> Result<()> {
        self.rpc(ctx, FCall::TClunk { fid }).await.map(|_| ())
    }

    pub async fn remove(&self, ctx: &Context, fid: u32) -> Result<()> {
        self.rpc(ctx, FCall::TRemove { fid }).await.map(|_| ())
    }

    pub async fn stat(&self, ctx: &Context, fid: u32) -> Result<Stat> {
        let msg = self.rpc(ctx, FCall::TStat { fid }).await?;
        match msg.body {
            FCall::RStat { stat } => Ok(stat),
            _ => Err(unexpected(MsgType::RStat, &msg)),
        }
    }

    pub async fn wstat(&self, ctx: &Context, fid: u32, stat: &Stat) -> Result<()> {
        self.rpc(
            ctx,
            FCall::TWStat {
                fid,
                stat: stat.clone(),
            },
        )
        .await
        .map(|_| ())
    }

    /// Ask the server to abandon the request on `oldtag`. The caller remains
    /// responsible for that tag; see [`PendingRequest::cancel`].
    pub async fn flush(&self, ctx: &Context, oldtag: u16) -> Result<()> {
        self.rpc(ctx, FCall::TFlush { oldtag }).await.map(|_| ())
    }
}

fn unexpected(expected: MsgType, msg: &Msg) -> Error {
    Error::UnexpectedMessage {
        expected,
        got: MsgType::from(&msg.body) as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;
    use std::time::Duration;

    fn qid(path: u64) -> QId {
        QId {
            typ: QIdType::FILE,
            version: 0,
            path,
        }
    }

    async fn eventually(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn read_error_releases_tag() {
        let (conn, mut server) = mock::connected(8192, 4).await;

        let client = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.read(&Context::background(), 1, 0, 100).await })
        };

        let req = server.recv().await.unwrap();
        assert_eq!(
            req.body,
            FCall::TRead {
                fid: 1,
                offset: 0,
                count: 100
            }
        );
        assert_eq!(conn.free_tags(), 3);
        server
            .reply(
                req.tag,
                FCall::RError {
                    ename: "no such file".to_owned(),
                },
            )
            .await;

        match client.await.unwrap() {
            Err(Error::Remote(ename)) => assert_eq!(ename, "no such file"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(conn.free_tags(), 4);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn responses_route_by_tag_out_of_order() {
        let (conn, mut server) = mock::connected(8192, 8).await;

        let calls: Vec<_> = (0..3u32)
            .map(|fid| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.stat(&Context::background(), fid).await })
            })
            .collect();

        let mut reqs = Vec::new();
        for _ in 0..3 {
            reqs.push(server.recv().await.unwrap());
        }
        for req in reqs.iter().rev() {
            let FCall::TStat { fid } = req.body else {
                panic!("unexpected {:?}", req)
            };
            let mut stat = Stat::unchanged();
            stat.name = format!("f{}", fid);
            stat.qid = qid(fid as u64);
            server.reply(req.tag, FCall::RStat { stat }).await;
        }

        for (fid, call) in calls.into_iter().enumerate() {
            let stat = call.await.unwrap().unwrap();
            assert_eq!(stat.name, format!("f{}", fid));
        }
        assert_eq!(conn.free_tags(), 8);
    }

    #[tokio::test]
    async fn full_pool_reuse_has_no_crosstalk() {
        let (conn, server) = mock::connected(8192, 4).await;
        let _server = server.serve(|req| match req {
            FCall::TClunk { .. } => FCall::RClunk,
            FCall::TRead { fid, count, .. } => FCall::RRead {
                data: Data(vec![*fid as u8; *count as usize]),
            },
            other => panic!("unexpected {:?}", other),
        });

        for round in 0..2u32 {
            let calls = (0..4u32).map(|i| {
                let conn = conn.clone();
                async move {
                    let fid = round * 4 + i;
                    let data = conn
                        .read(&Context::background(), fid, 0, 10 + fid)
                        .await
                        .unwrap();
                    assert_eq!(data, vec![fid as u8; 10 + fid as usize]);
                }
            });
            futures::future::join_all(calls).await;
            assert_eq!(conn.free_tags(), 4);
        }
    }

    #[tokio::test]
    async fn tag_pool_bounds_in_flight_requests() {
        let (conn, mut server) = mock::connected(8192, 2).await;

        let calls: Vec<_> = (0..3u32)
            .map(|fid| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.clunk(&Context::background(), fid).await })
            })
            .collect();

        let first = server.recv().await.unwrap();
        let second = server.recv().await.unwrap();
        assert_ne!(first.tag, second.tag);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), server.recv())
                .await
                .is_err()
        );

        server.reply(first.tag, FCall::RClunk).await;
        let third = server.recv().await.unwrap();
        assert_eq!(third.tag, first.tag);
        server.reply(second.tag, FCall::RClunk).await;
        server.reply(third.tag, FCall::RClunk).await;

        for call in calls {
            call.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn cancel_flushes_before_releasing_tag() {
        let (conn, mut server) = mock::connected(8192, 4).await;
        let ctx = Context::background();

        let client = {
            let conn = conn.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { conn.read(&ctx, 1, 0, 100).await })
        };

        let read = server.recv().await.unwrap();
        ctx.cancel();

        let flush = server.recv().await.unwrap();
        assert_eq!(flush.body, FCall::TFlush { oldtag: read.tag });
        assert_ne!(flush.tag, read.tag);
        assert_eq!(conn.free_tags(), 2);

        server.reply(flush.tag, FCall::RFlush).await;
        assert!(matches!(client.await.unwrap(), Err(Error::Canceled)));
        assert_eq!(conn.free_tags(), 4);

        // exactly one flush
        assert!(
            tokio::time::timeout(Duration::from_millis(50), server.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn deadline_triggers_flush() {
        let (conn, mut server) = mock::connected(8192, 4).await;
        let client = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.stat(&Context::with_timeout(Duration::from_millis(20)), 1)
                    .await
            })
        };

        let stat = server.recv().await.unwrap();
        let flush = server.recv().await.unwrap();
        assert_eq!(flush.body, FCall::TFlush { oldtag: stat.tag });
        // late original response, then the flush acknowledgement
        server
            .reply(
                stat.tag,
                FCall::RStat {
                    stat: Stat::unchanged(),
                },
            )
            .await;
        server.reply(flush.tag, FCall::RFlush).await;

        assert!(matches!(
            client.await.unwrap(),
            Err(Error::DeadlineExceeded)
        ));
        assert_eq!(conn.free_tags(), 4);
    }

    #[tokio::test]
    async fn dropped_request_is_flushed_in_background() {
        let (conn, mut server) = mock::connected(8192, 4).await;

        let req = conn.start(FCall::TClunk { fid: 7 }).await.unwrap();
        assert_eq!(req.state(), RequestState::AwaitingResponse);
        let tag = req.tag();
        let sent = server.recv().await.unwrap();
        assert_eq!(sent.tag, tag);

        drop(req);
        let flush = server.recv().await.unwrap();
        assert_eq!(flush.body, FCall::TFlush { oldtag: tag });
        assert_eq!(conn.free_tags(), 2);

        server.reply(flush.tag, FCall::RFlush).await;
        eventually(|| conn.free_tags() == 4).await;
    }

    #[tokio::test]
    async fn request_state_transitions() {
        let (conn, mut server) = mock::connected(8192, 4).await;

        let mut req = conn.start(FCall::TStat { fid: 1 }).await.unwrap();
        assert_eq!(req.state(), RequestState::AwaitingResponse);
        let sent = server.recv().await.unwrap();
        server
            .reply(
                sent.tag,
                FCall::RStat {
                    stat: Stat::unchanged(),
                },
            )
            .await;

        let frame = req.wait().await.unwrap();
        assert_eq!(req.state(), RequestState::ResponseDelivered);
        assert!(expect_msg(&frame, MsgType::RStat).is_ok());
        assert_eq!(conn.free_tags(), 3);
        drop(req);
        assert_eq!(conn.free_tags(), 4);

        let mut req = conn.start(FCall::TStat { fid: 2 }).await.unwrap();
        let sent = server.recv().await.unwrap();
        let flushing = tokio::spawn(async move {
            req.flush().await;
            req
        });
        let flush = server.recv().await.unwrap();
        assert_eq!(flush.body, FCall::TFlush { oldtag: sent.tag });
        server.reply(flush.tag, FCall::RFlush).await;
        let req = flushing.await.unwrap();
        assert_eq!(req.state(), RequestState::FlushAcked);
        drop(req);
        assert_eq!(conn.free_tags(), 4);
    }

    #[tokio::test]
    async fn unknown_tag_is_skipped() {
        let (conn, mut server) = mock::connected(8192, 4).await;
        server.reply(3, FCall::RClunk).await;

        let client = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.clunk(&Context::background(), 5).await })
        };
        let req = server.recv().await.unwrap();
        server.reply(req.tag, FCall::RClunk).await;
        client.await.unwrap().unwrap();
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn decode_error_is_request_scoped() {
        let (conn, mut server) = mock::connected(8192, 4).await;

        let client = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.stat(&Context::background(), 1).await })
        };
        let req = server.recv().await.unwrap();
        server.reply(req.tag, FCall::RClunk).await;
        assert!(matches!(
            client.await.unwrap(),
            Err(Error::UnexpectedMessage {
                expected: MsgType::RStat,
                ..
            })
        ));

        let client = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.clunk(&Context::background(), 1).await })
        };
        let req = server.recv().await.unwrap();
        server.reply(req.tag, FCall::RClunk).await;
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn eof_fails_every_waiter() {
        let (conn, mut server) = mock::connected(8192, 4).await;

        let calls: Vec<_> = (0..3u32)
            .map(|fid| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.clunk(&Context::background(), fid).await })
            })
            .collect();
        for _ in 0..3 {
            server.recv().await.unwrap();
        }
        drop(server);

        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(Error::ConnectionClosed(_))
            ));
        }
        assert!(conn.is_closed());
        assert!(matches!(
            conn.clunk(&Context::background(), 1).await,
            Err(Error::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn close_wakes_tag_waiters() {
        let (conn, mut server) = mock::connected(8192, 1).await;

        let busy = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.clunk(&Context::background(), 1).await })
        };
        server.recv().await.unwrap();
        let queued = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.clunk(&Context::background(), 2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.close().await;
        assert!(busy.await.unwrap().unwrap_err().is_fatal());
        assert!(queued.await.unwrap().unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn oversized_request_is_rejected_before_writing() {
        let (conn, mut server) = mock::connected(256, 4).await;
        let result = conn
            .write(&Context::background(), 1, 0, &[0u8; 300])
            .await;
        assert!(matches!(result, Err(Error::Encode(_))));
        assert_eq!(conn.free_tags(), 4);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), server.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn oversized_response_closes_connection() {
        let (conn, mut server) = mock::connected(256, 4).await;
        let client = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.read(&Context::background(), 1, 0, 200).await })
        };
        let req = server.recv().await.unwrap();
        server
            .reply(
                req.tag,
                FCall::RRead {
                    data: Data(vec![0; 300]),
                },
            )
            .await;
        assert!(matches!(
            client.await.unwrap(),
            Err(Error::ConnectionClosed(_))
        ));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn walk_rejects_too_many_names() {
        let (conn, _server) = mock::connected(8192, 4).await;
        let names = vec!["x"; MAXWELEM + 1];
        assert!(matches!(
            conn.walk(&Context::background(), 0, 1, &names).await,
            Err(Error::Encode(_))
        ));
    }

    #[tokio::test]
    async fn precanceled_context_sends_nothing() {
        let (conn, mut server) = mock::connected(8192, 4).await;
        let ctx = Context::background();
        ctx.cancel();
        assert!(matches!(
            conn.clunk(&ctx, 1).await,
            Err(Error::Canceled)
        ));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), server.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn flush_waits_for_queued_request() {
        let (conn, mut server) = mock::connected(8192, 4).await;

        // Hold the writer so the request is still queued when its caller goes away
        let held = conn.inner.writer.lock().await;
        let started =
            tokio::time::timeout(Duration::from_millis(20), conn.start(FCall::TClunk { fid: 7 }))
                .await;
        assert!(started.is_err());
        tokio::task::yield_now().await;
        drop(held);

        let clunk = server.recv().await.unwrap();
        assert_eq!(clunk.body, FCall::TClunk { fid: 7 });
        let flush = server.recv().await.unwrap();
        assert_eq!(flush.body, FCall::TFlush { oldtag: clunk.tag });

        server.reply(clunk.tag, FCall::RClunk).await;
        server.reply(flush.tag, FCall::RFlush).await;
        eventually(|| conn.free_tags() == 4).await;
    }

    #[tokio::test]
    async fn write_failure_fails_every_waiter() {
        let (requests, server_end) = tokio::io::duplex(1 << 16);
        let (responses, _responder) = tokio::io::duplex(1 << 16);
        let conn = ClientConn::spawn(
            FramedRead::new(responses, codec(8192)),
            requests,
            8192,
            P92000.to_owned(),
            4,
        );
        let mut incoming = FramedRead::new(server_end, codec(8192));

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.clunk(&Context::background(), 1).await })
        };
        let frame = incoming.next().await.unwrap().unwrap();
        assert!(expect_msg(&frame, MsgType::TClunk).is_ok());

        // the peer stops reading: the next write fails
        drop(incoming);
        assert!(matches!(
            conn.clunk(&Context::background(), 2).await,
            Err(Error::Io(_))
        ));

        assert!(matches!(
            pending.await.unwrap(),
            Err(Error::ConnectionClosed(_))
        ));
        assert!(conn.is_closed());
        assert!(conn.stat(&Context::background(), 1).await.unwrap_err().is_fatal());
    }
}
