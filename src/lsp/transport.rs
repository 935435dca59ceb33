use super::types::Message;
use anyhow::Context as _;
use serde::Serialize;
use std::io::{BufRead, BufReader, Read, Write};

/// Base-protocol framing over a byte stream: `Content-Length` headers
/// followed by a JSON-RPC body.
pub struct Transport {
    _thread: std::thread::JoinHandle<()>,
    writer: Box<dyn Write + Send>,
}

impl Transport {
    pub fn start<R, W>(
        reader: R,
        writer: W,
    ) -> anyhow::Result<(Self, crossbeam_channel::Receiver<Message>)>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let mut reader = BufReader::new(reader);
        let (tx, rx) = crossbeam_channel::unbounded();

        let thread = std::thread::Builder::new()
            .name("worker reader".to_string())
            .spawn(move || loop {
                let body = match read_frame(&mut reader) {
                    Ok(body) => body,
                    Err(e) => {
                        log::warn!("worker: stream closed ({:#})", e);
                        break;
                    }
                };
                // the framing is still intact, only this one frame is lost
                let msg = match serde_json::from_str::<Message>(&body) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("worker sent an invalid message ({}): {}", e, body);
                        continue;
                    }
                };

                log::trace!("worker -> {:?}", msg);
                if tx.send(msg).is_err() {
                    break;
                }
            })
            .context("failed to spawn worker reader thread")?;

        Ok((
            Self {
                _thread: thread,
                writer: Box::new(writer),
            },
            rx,
        ))
    }

    pub fn send(&mut self, message: Message) -> anyhow::Result<()> {
        log::trace!("worker <- {:?}", message);
        write_message(&mut self.writer, message)
    }
}

pub fn write_message<W: Write + ?Sized>(writer: &mut W, message: Message) -> anyhow::Result<()> {
    #[derive(Serialize)]
    struct JsonRpc {
        jsonrpc: &'static str,
        #[serde(flatten)]
        message: Message,
    }

    let text = serde_json::to_string(&JsonRpc {
        jsonrpc: "2.0",
        message,
    })?;

    writer.write_all(format!("Content-Length: {}\r\n\r\n", text.len()).as_bytes())?;
    writer.write_all(text.as_bytes())?;
    writer.flush()?;

    Ok(())
}

pub fn read_message<R>(reader: &mut R) -> anyhow::Result<Message>
where
    R: BufRead,
{
    let body = read_frame(reader)?;
    serde_json::from_str::<Message>(&body).context("worker sent an invalid message")
}

/// Reads one frame body. Errors here mean the stream can't be resynchronized.
fn read_frame<R>(reader: &mut R) -> anyhow::Result<String>
where
    R: BufRead,
{
    let mut buf = String::new();
    let mut size = None;
    loop {
        buf.clear();

        if reader.read_line(&mut buf)? == 0 {
            anyhow::bail!("stream closed");
        }
        if !buf.ends_with("\r\n") {
            anyhow::bail!("malformed header line {:?}", buf);
        }

        let header = buf.trim();
        if header.is_empty() {
            break;
        }

        if let Some((name, value)) = header.split_once(": ") {
            if name.eq_ignore_ascii_case("Content-Length") {
                size = Some(value.parse::<usize>().context("invalid content length")?);
            }
        }
    }

    let size = size.context("missing content length")?;

    let mut buf = buf.into_bytes();
    buf.resize(size, 0);
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).context("worker sent invalid utf8")
}
