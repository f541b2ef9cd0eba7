//! In-process 9P server end for tests.

use std::io::Cursor;

use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

use crate::client::{codec, ClientConn};
use crate::fcall::*;
use crate::serialize::{encode_msg, read_msg};
use crate::session::DialOptions;

pub(crate) struct MockServer {
    frames: FramedRead<ReadHalf<DuplexStream>, LengthDelimitedCodec>,
    writer: WriteHalf<DuplexStream>,
}

impl MockServer {
    /// The client end of a fresh pipe, and the server end wrapped
    pub(crate) fn pair() -> (DuplexStream, MockServer) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (reader, writer) = tokio::io::split(server);
        let server = MockServer {
            frames: FramedRead::new(reader, codec(u32::MAX)),
            writer,
        };
        (client, server)
    }

    /// Next request, or `None` once the client hung up
    pub(crate) async fn recv(&mut self) -> Option<Msg> {
        let frame = self.frames.next().await?.ok()?;
        Some(read_msg(&mut Cursor::new(&frame[..])).expect("client sent a malformed message"))
    }

    pub(crate) async fn reply(&mut self, tag: u16, body: FCall) {
        let buf = encode_msg(&Msg { tag, body }).unwrap();
        self.send_raw(&buf).await;
    }

    pub(crate) async fn send_raw(&mut self, buf: &[u8]) {
        // the client may already be gone
        let _ = self.writer.write_all(buf).await;
    }

    /// Answer the version request with `msize` and `version`
    pub(crate) async fn handshake(&mut self, msize: u32, version: &str) -> u32 {
        let msg = self.recv().await.expect("no version request");
        let FCall::TVersion { msize: offered, .. } = msg.body else {
            panic!("expected TVersion, got {:?}", msg)
        };
        assert_eq!(msg.tag, NOTAG);
        self.reply(
            NOTAG,
            FCall::RVersion {
                msize,
                version: version.to_owned(),
            },
        )
        .await;
        offered
    }

    /// Answer every request with `handler` until the client hangs up
    pub(crate) fn serve<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(&FCall) -> FCall + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(msg) = self.recv().await {
                let reply = handler(&msg.body);
                self.reply(msg.tag, reply).await;
            }
        })
    }
}

/// A negotiated connection to a mock server
pub(crate) async fn connected(msize: u32, concurrency: u16) -> (ClientConn, MockServer) {
    let (stream, mut server) = MockServer::pair();
    let opts = DialOptions::default()
        .with_msize(msize)
        .with_concurrency(concurrency);
    let (conn, _) = tokio::join!(
        ClientConn::connect(stream, &opts),
        server.handshake(msize, P92000)
    );
    (conn.unwrap(), server)
}
