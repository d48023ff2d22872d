use std::time::Duration;

use cloudhop_services::ByteStream;
use futures::{stream, StreamExt};
use tokio::time::Instant;
use tracing::info;

/// Wraps image downloads with progress reporting and an optional rate limit.
#[derive(Debug, Clone, Default)]
pub struct CopyProxy {
    speed_limit: Option<u64>,
}

struct Progress {
    inner: ByteStream,
    image_id: String,
    image_name: String,
    total: Option<u64>,
    copied: u64,
    next_percent: u64,
    started: Instant,
}

impl Progress {
    fn report(&mut self) {
        let Some(total) = self.total.filter(|total| *total > 0) else {
            return;
        };
        let percent = self.copied.saturating_mul(100) / total;
        if percent < self.next_percent {
            return;
        }
        info!(
            image_id = %self.image_id,
            image_name = %self.image_name,
            copied = self.copied,
            total,
            percent,
            "image copy progress"
        );
        self.next_percent = (percent / 10 + 1) * 10;
    }
}

impl CopyProxy {
    pub fn new(speed_limit: Option<u64>) -> Self {
        Self { speed_limit }
    }

    pub fn wrap(
        &self,
        inner: ByteStream,
        total: Option<u64>,
        image_id: &str,
        image_name: &str,
    ) -> ByteStream {
        let speed_limit = self.speed_limit.filter(|limit| *limit > 0);
        let progress = Progress {
            inner,
            image_id: image_id.to_string(),
            image_name: image_name.to_string(),
            total,
            copied: 0,
            next_percent: 10,
            started: Instant::now(),
        };

        stream::unfold(progress, move |mut progress| async move {
            let chunk = progress.inner.next().await?;
            if let Ok(bytes) = &chunk {
                progress.copied += bytes.len() as u64;
                progress.report();
                if let Some(limit) = speed_limit {
                    let due = Duration::from_secs_f64(progress.copied as f64 / limit as f64);
                    let elapsed = progress.started.elapsed();
                    if due > elapsed {
                        tokio::time::sleep(due - elapsed).await;
                    }
                }
            }
            Some((chunk, progress))
        })
        .boxed()
    }
}
