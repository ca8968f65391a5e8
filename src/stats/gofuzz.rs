use super::{
    sse::{Event, EventStream},
    GoFuzzEvent,
};
use crate::{
    supervisor::{ServeFuture, Service, ServiceError, Stop},
    target::TargetStats,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

const EVENT_PATH: &str = "/eventsource";
const MIN_RETRY: Duration = Duration::from_millis(500);
const MAX_RETRY: Duration = Duration::from_secs(10);

/// Subscribes to go-fuzz's event stream, reconnecting whenever it drops.
pub struct GoFuzzStatsService {
    target: String,
    url: String,
    client: reqwest::Client,
    tx: mpsc::UnboundedSender<TargetStats>,
}

impl GoFuzzStatsService {
    pub fn new(target: &str, port: u16, tx: mpsc::UnboundedSender<TargetStats>) -> Self {
        Self {
            target: target.to_string(),
            url: format!("http://127.0.0.1:{}{}", port, EVENT_PATH),
            client: reqwest::Client::new(),
            tx,
        }
    }

    fn forward(&self, ev: Event) {
        let stats = GoFuzzEvent::parse(&ev.data).and_then(|e| e.to_stats(&self.target));
        match stats {
            Ok(stats) => {
                if self.tx.send(stats).is_err() {
                    target_warn!(self.target, "stats aggregator is gone");
                }
            }
            Err(e) => target_error!(self.target, "go-fuzz stats: {}", e),
        }
    }

    /// Consumes one connection until it ends. Returns true on stop.
    async fn consume(&self, mut stream: EventStream, stop: &mut Stop) -> bool {
        loop {
            tokio::select! {
                _ = stop.wait() => return true,
                next = stream.next_event() => match next {
                    Ok(Some(ev)) => self.forward(ev),
                    Ok(None) => {
                        target_debug!(self.target, "event stream closed");
                        return false;
                    }
                    Err(e) => {
                        target_warn!(self.target, "event stream broken: {}", e);
                        return false;
                    }
                },
            }
        }
    }

    async fn subscribe(&self, stop: &mut Stop) -> Result<(), ServiceError> {
        let mut retry = MIN_RETRY;
        loop {
            let conn = tokio::select! {
                _ = stop.wait() => return Ok(()),
                conn = EventStream::connect(&self.client, &self.url) => conn,
            };
            match conn {
                Ok(stream) => {
                    target_info!(self.target, "subscribed to go-fuzz stats at {}", self.url);
                    retry = MIN_RETRY;
                    if self.consume(stream, stop).await {
                        return Ok(());
                    }
                }
                Err(e) => target_debug!(self.target, "stats endpoint not ready: {}", e),
            }
            if stop.sleep(retry).await {
                return Ok(());
            }
            retry = (retry * 2).min(MAX_RETRY);
        }
    }
}

impl Service for GoFuzzStatsService {
    fn name(&self) -> String {
        format!("gofuzz-stats:{}", self.target)
    }

    fn serve(self: Arc<Self>, mut stop: Stop) -> ServeFuture {
        Box::pin(async move { self.subscribe(&mut stop).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::stop_pair;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    async fn accept(listener: &TcpListener) -> TcpStream {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let n = sock.read(&mut buf).await.unwrap();
        let req = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(req.starts_with("GET /eventsource HTTP/1.1"));
        assert!(req.to_lowercase().contains("accept: text/event-stream"));
        sock
    }

    /// Body delimited by the connection close.
    async fn serve_once(listener: &TcpListener, events: Vec<&str>) {
        let mut sock = accept(listener).await;
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        for ev in events {
            sock.write_all(format!("data: {}\n\n", ev).as_bytes())
                .await
                .unwrap();
        }
    }

    async fn serve_chunked(listener: &TcpListener, events: Vec<&str>) {
        let mut sock = accept(listener).await;
        sock.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await
        .unwrap();
        for ev in events {
            // split one event across two chunks
            let text = format!(": ping\ndata: {}\n\n", ev);
            let (a, b) = text.split_at(text.len() / 2);
            for part in vec![a, b] {
                sock.write_all(format!("{:x}\r\n{}\r\n", part.len(), part).as_bytes())
                    .await
                    .unwrap();
            }
        }
        sock.write_all(b"0\r\n\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let svc = Arc::new(GoFuzzStatsService::new("json", port, tx));
        let (handle, stop) = stop_pair();
        let task = tokio::spawn(Arc::clone(&svc).serve(stop));

        serve_once(
            &listener,
            vec![
                r#"{"Execs":100,"Crashers":1,"Uptime":"10s"}"#,
                "garbage",
                r#"{"Execs":600,"Crashers":2,"Uptime":"1m"}"#,
            ],
        )
        .await;
        let a = rx.recv().await.unwrap();
        assert_eq!((a.tests_per_second, a.bugs_found), (10.0, 1));
        let b = rx.recv().await.unwrap();
        assert_eq!((b.tests_per_second, b.bugs_found), (10.0, 2));

        // the first connection is closed once serve_once returns
        serve_chunked(&listener, vec![r#"{"Execs":7200,"Crashers":4,"Uptime":"1h"}"#]).await;
        let c = rx.recv().await.unwrap();
        assert_eq!((c.tests_per_second, c.bugs_found), (2.0, 4));

        handle.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_while_endpoint_is_down() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (tx, _rx) = mpsc::unbounded_channel();
        let svc = Arc::new(GoFuzzStatsService::new("json", port, tx));
        let (handle, stop) = stop_pair();
        let task = tokio::spawn(Arc::clone(&svc).serve(stop));
        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.stop();
        task.await.unwrap().unwrap();
    }
}
