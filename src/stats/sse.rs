//! Server-sent events over a streamed http response.

use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    pub name: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder, fed one line at a time.
#[derive(Debug, Default)]
pub struct Decoder {
    name: Option<String>,
    data: Vec<String>,
}

impl Decoder {
    /// Returns an event when `line` terminates one.
    pub fn feed(&mut self, line: &str) -> Option<Event> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if line.is_empty() {
            if self.data.is_empty() {
                self.name = None;
                return None;
            }
            return Some(Event {
                name: self.name.take(),
                data: self.data.drain(..).collect::<Vec<_>>().join("\n"),
            });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.find(':') {
            Some(i) => {
                let v = &line[i + 1..];
                (&line[..i], v.strip_prefix(' ').unwrap_or(v))
            }
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.name = Some(value.to_string()),
            _ => (),
        }
        None
    }
}

pub struct EventStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: BytesMut,
    decoder: Decoder,
}

impl EventStream {
    /// Subscribes to `url`, fails unless the server answers with a success status.
    pub async fn connect(client: &reqwest::Client, url: &str) -> reqwest::Result<Self> {
        let resp = client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?
            .error_for_status()?;
        Ok(Self {
            body: resp.bytes_stream().boxed(),
            buf: BytesMut::new(),
            decoder: Decoder::default(),
        })
    }

    /// Next complete event, `None` once the server closed the stream.
    pub async fn next_event(&mut self) -> reqwest::Result<Option<Event>> {
        loop {
            while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                if let Some(ev) = self.decoder.feed(&String::from_utf8_lossy(&line)) {
                    return Ok(Some(ev));
                }
            }
            match self.body.next().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk?),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode() {
        let mut d = Decoder::default();
        let mut events = Vec::new();
        for line in vec![
            ": keepalive",
            "event: stats",
            "data: {\"Execs\":1,",
            "data:\"Uptime\":\"1s\"}",
            "",
            "",
            "retry: 1000",
            "data: second\r",
            "\r",
        ] {
            events.extend(d.feed(line));
        }
        assert_eq!(
            events,
            vec![
                Event {
                    name: Some("stats".to_string()),
                    data: "{\"Execs\":1,\n\"Uptime\":\"1s\"}".to_string(),
                },
                Event {
                    name: None,
                    data: "second".to_string(),
                },
            ]
        );
    }
}
