// Hand-driven mock device.
//
// Each test accepts the client's connection and scripts the wire directly,
// so reply ordering and interleaving are fully controlled -- the raw-TCP
// counterpart of mocking an HTTP server per request.

#![allow(dead_code)] // each test binary uses a different subset

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use roswire_proto::codec;

/// Bind a throwaway listener on localhost.
pub async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Accept the next client as a scriptable peer.
pub async fn accept(listener: &TcpListener) -> MockPeer {
    let (stream, _) = listener.accept().await.unwrap();
    MockPeer {
        stream,
        buf: BytesMut::new(),
    }
}

/// One accepted client connection, driven sentence by sentence.
pub struct MockPeer {
    stream: TcpStream,
    buf: BytesMut,
}

impl MockPeer {
    /// Read the next complete sentence from the client.
    pub async fn read_sentence(&mut self) -> Vec<String> {
        loop {
            if let Some((words, consumed)) =
                codec::decode_sentence(&self.buf, codec::DEFAULT_MAX_SENTENCE).unwrap()
            {
                self.buf.advance(consumed);
                if words.is_empty() {
                    continue;
                }
                return words;
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "client closed while the mock expected a sentence");
        }
    }

    /// Write one framed sentence to the client.
    pub async fn write_sentence<W: AsRef<[u8]>>(&mut self, words: &[W]) {
        let mut frame = BytesMut::new();
        codec::encode_sentence(words, &mut frame);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Write raw bytes, bypassing the framing (for corrupt-stream tests).
    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }
}

/// Extract the `.tag=` value of a request sentence.
pub fn tag_of(words: &[String]) -> String {
    words
        .iter()
        .find_map(|w| w.strip_prefix(".tag="))
        .expect("request sentence has no tag")
        .to_string()
}

/// Extract a `=key=value` parameter of a request sentence.
pub fn param_of<'a>(words: &'a [String], key: &str) -> Option<&'a str> {
    let prefix = format!("={key}=");
    words.iter().find_map(|w| w.strip_prefix(prefix.as_str()))
}
