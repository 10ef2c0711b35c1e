use crate::process::BoxedWriter;
use crate::protocol::{Incoming, Request, parse_line};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};

/// Lines longer than this are flushed as log output without waiting for a
/// terminator.
pub const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Splits a byte stream on `\n`.
///
/// Partial lines stay buffered until their terminator arrives; several lines
/// in one read come out as several frames. Invalid UTF-8 is replaced rather
/// than failing the stream.
#[derive(Debug, Default)]
pub struct LineCodec {
    // bytes already scanned for a terminator
    scanned: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_line(src: &mut BytesMut, len: usize, skip: usize) -> String {
        let raw = src.split_to(len);
        src.advance(skip);
        let mut line = String::from_utf8_lossy(&raw).into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.scanned..].iter().position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let len = self.scanned + offset;
                    self.scanned = 0;
                    let line = Self::take_line(src, len, 1);
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Ok(Some(line));
                }
                None if src.len() >= MAX_LINE_LENGTH => {
                    self.scanned = 0;
                    let len = src.len();
                    return Ok(Some(Self::take_line(src, len, 0)));
                }
                None => {
                    self.scanned = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.scanned = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let len = src.len();
        let line = Self::take_line(src, len, 0);
        if line.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    }
}

/// [`LineCodec`] followed by envelope classification
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    lines: LineCodec,
}

impl Decoder for EnvelopeCodec {
    type Item = Incoming;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.lines.decode(src)?.map(|line| parse_line(&line)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.lines.decode_eof(src)?.map(|line| parse_line(&line)))
    }
}

pub fn envelope_frames<R: AsyncRead>(reader: R) -> FramedRead<R, EnvelopeCodec> {
    FramedRead::with_capacity(reader, EnvelopeCodec::default(), 8 * 1024)
}

pub fn line_frames<R: AsyncRead>(reader: R) -> FramedRead<R, LineCodec> {
    FramedRead::with_capacity(reader, LineCodec::new(), 1024)
}

/// Serialize a request to exactly one `\n`-terminated line
pub fn encode_request(request: &Request) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(request)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Sole writer to the child's stdin.
///
/// Every send writes one full line and flushes before releasing the lock,
/// so concurrent callers never interleave partial lines.
pub struct LineWriter {
    inner: Mutex<BoxedWriter>,
}

impl LineWriter {
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    pub async fn send(&self, request: &Request) -> std::io::Result<()> {
        let bytes = encode_request(request)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut writer = self.inner.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await
    }
}
