//! Byte counters reported as periodic tracing events.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::Instant;
use tracing::{event, Level};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Progress {
    description: String,
    total: Option<u64>,
    current: u64,
    started: Instant,
    last_report: Instant,
}

impl Progress {
    pub fn new(description: impl Into<String>, total: Option<u64>, current: u64) -> Self {
        let now = Instant::now();
        Progress {
            description: description.into(),
            total,
            current,
            started: now,
            last_report: now,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn advance(&mut self, n: u64) {
        self.current += n;
        if self.last_report.elapsed() >= REPORT_INTERVAL {
            self.last_report = Instant::now();
            self.report();
        }
    }

    fn report(&self) {
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let rate = (self.current as f64 / elapsed) as u64;
        match self.total {
            Some(total) if total > 0 => event!(
                Level::INFO,
                description = %self.description,
                current = self.current,
                total,
                bytes_per_sec = rate,
                "{}: {}/{} bytes ({}%)",
                self.description,
                self.current,
                total,
                self.current * 100 / total,
            ),
            _ => event!(
                Level::INFO,
                description = %self.description,
                current = self.current,
                bytes_per_sec = rate,
                "{}: {} bytes",
                self.description,
                self.current,
            ),
        }
    }

    pub fn finish(&self) {
        self.report();
    }
}

/// Reader that feeds every byte read through a [`Progress`].
pub struct ProgressReader<R> {
    inner: R,
    progress: Progress,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, progress: Progress) -> Self {
        ProgressReader { inner, progress }
    }

    pub fn into_progress(self) -> Progress {
        self.progress
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len() - before;
            self.progress.advance(n as u64);
        }
        res
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_progress_reader_counts_bytes() {
        let data = vec![7u8; 10_000];
        let mut reader = ProgressReader::new(&data[..], Progress::new("test", Some(10_000), 0));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.into_progress().current(), 10_000);
    }
}
