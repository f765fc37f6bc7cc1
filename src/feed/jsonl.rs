//! Newline-delimited JSON sample feed.
//!
//! Lines are parsed on a background thread and handed over a bounded
//! channel. A line that fails to parse is reported, never fatal.

use crate::feed::types::MotionSample;
use crossbeam_channel::{bounded, Receiver};
use std::io::BufRead;
use std::thread::{self, JoinHandle};

/// One item read from the feed.
#[derive(Debug, Clone)]
pub enum FeedItem {
    Sample(Box<MotionSample>),
    /// A line that could not be decoded as a `MotionSample`
    Invalid { line: usize, error: String },
}

/// Reads `MotionSample` records from a line-oriented reader.
pub struct JsonlFeed {
    receiver: Receiver<FeedItem>,
    handle: Option<JoinHandle<usize>>,
}

impl JsonlFeed {
    /// Start reading from `reader` on a background thread.
    ///
    /// `capacity` bounds how far the reader may run ahead of the consumer.
    pub fn spawn<R>(reader: R, capacity: usize) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (sender, receiver) = bounded(capacity.max(1));

        let handle = thread::spawn(move || {
            let mut read = 0usize;
            for (index, line) in reader.lines().enumerate() {
                let line_no = index + 1;
                let item = match line {
                    Ok(text) => {
                        let text = text.trim();
                        if text.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<MotionSample>(text) {
                            Ok(sample) => FeedItem::Sample(Box::new(sample)),
                            Err(e) => FeedItem::Invalid {
                                line: line_no,
                                error: e.to_string(),
                            },
                        }
                    }
                    Err(e) => FeedItem::Invalid {
                        line: line_no,
                        error: e.to_string(),
                    },
                };
                read += 1;
                // Consumer went away
                if sender.send(item).is_err() {
                    break;
                }
            }
            read
        });

        Self {
            receiver,
            handle: Some(handle),
        }
    }

    /// Get the receiver for feed items.
    pub fn receiver(&self) -> &Receiver<FeedItem> {
        &self.receiver
    }

    /// Wait for the reader thread and return how many lines it delivered.
    pub fn join(mut self) -> usize {
        self.handle
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_feed_reports_invalid_lines() {
        let input = concat!(
            r#"{"subject_id":"S1","timestamp":"2024-01-22T10:00:00Z","sampling_rate_hz":50.0,"features":{"gait_speed":1.1}}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"subject_id":"S1","timestamp":"2024-01-22T10:00:01Z","sampling_rate_hz":50.0,"features":{"gait_speed":1.3}}"#,
            "\n"
        );

        let feed = JsonlFeed::spawn(Cursor::new(input.to_string()), 4);
        let items: Vec<FeedItem> = feed.receiver().iter().collect();
        assert_eq!(feed.join(), 3);

        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], FeedItem::Sample(_)));
        assert!(matches!(items[1], FeedItem::Invalid { line: 2, .. }));
        assert!(matches!(items[2], FeedItem::Sample(_)));
    }
}
