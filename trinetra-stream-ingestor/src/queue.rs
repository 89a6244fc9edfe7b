//! Bounded hand-off queue between the blocking reader and the publisher.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// One decoded frame with its capture timestamp.
pub struct CapturedFrame {
    pub image: image::RgbImage,
    /// Seconds since epoch at capture time.
    pub ingest_ts: f64,
}

/// FIFO of capacity `capacity`; pushing into a full queue drops the oldest
/// entry. The reader side is a plain thread, the consumer side a tokio task.
pub struct FrameQueue {
    inner: Mutex<VecDeque<CapturedFrame>>,
    capacity: usize,
    notify: Notify,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        FrameQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Push a frame. Returns true if an older frame was evicted to make room.
    pub fn push(&self, frame: CapturedFrame) -> bool {
        let dropped = {
            let mut inner = self.inner.lock();
            let dropped = if inner.len() == self.capacity {
                inner.pop_front();
                true
            } else {
                false
            };
            inner.push_back(frame);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Wait up to `timeout` for the next frame.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<CapturedFrame> {
        tokio::time::timeout(timeout, async {
            loop {
                // Register interest before checking, so a push between the
                // check and the await is not lost.
                let notified = self.notify.notified();
                if let Some(frame) = self.inner.lock().pop_front() {
                    return frame;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
fn test_frame(tag: u8) -> CapturedFrame {
    CapturedFrame {
        image: image::RgbImage::from_pixel(4, 4, image::Rgb([tag, tag, tag])),
        ingest_ts: tag as f64,
    }
}

#[tokio::test]
async fn test_queue_fifo() {
    let q = FrameQueue::new(4);
    assert!(!q.push(test_frame(1)));
    assert!(!q.push(test_frame(2)));
    let a = q.pop_timeout(Duration::from_millis(10)).await.unwrap();
    let b = q.pop_timeout(Duration::from_millis(10)).await.unwrap();
    assert_eq!(a.ingest_ts, 1.0);
    assert_eq!(b.ingest_ts, 2.0);
    assert!(q.pop_timeout(Duration::from_millis(10)).await.is_none());
}

#[tokio::test]
async fn test_queue_drops_oldest_when_full() {
    let q = FrameQueue::new(2);
    assert!(!q.push(test_frame(1)));
    assert!(!q.push(test_frame(2)));
    assert!(q.push(test_frame(3)));
    assert_eq!(q.len(), 2);
    // Frame 1 was evicted; 2 and 3 remain in order.
    let first = q.pop_timeout(Duration::from_millis(10)).await.unwrap();
    assert_eq!(first.ingest_ts, 2.0);
    let second = q.pop_timeout(Duration::from_millis(10)).await.unwrap();
    assert_eq!(second.ingest_ts, 3.0);
}

#[tokio::test]
async fn test_pop_wakes_on_push() {
    use std::sync::Arc;
    let q = Arc::new(FrameQueue::new(2));
    let q2 = q.clone();
    let waiter = tokio::spawn(async move { q2.pop_timeout(Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.push(test_frame(9));
    let got = waiter.await.unwrap().unwrap();
    assert_eq!(got.ingest_ts, 9.0);
}
