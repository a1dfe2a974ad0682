// SPDX-License-Identifier: MIT
//! The output multiplexer — a bounded channel that carries tagged, line-split
//! progress output from concurrently running build commands to whoever is
//! watching an install.
//!
//! A bounded `tokio::sync::mpsc` rather than `broadcast`, since install
//! output has exactly one consumer: the RPC call that triggered it.

use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 256;

/// One line of progress output, already trimmed and prefixed with its
/// originating package.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub tag: String,
    pub line: String,
}

impl std::fmt::Display for OutputLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\t{}", self.tag, self.line)
    }
}

/// The writing half: commands write raw, possibly multi-line chunks here;
/// each chunk is trimmed and split into individual `OutputLine`s before
/// being forwarded.
#[derive(Clone)]
pub struct OutputSender {
    tag: String,
    tx: mpsc::Sender<OutputLine>,
}

impl OutputSender {
    /// A clone of this sender tagged for a different package — used by the
    /// engine to give each task its own prefix over one shared channel.
    pub fn tagged(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            tx: self.tx.clone(),
        }
    }

    pub async fn send(&self, chunk: &str) {
        let trimmed = chunk.trim();
        if trimmed.is_empty() {
            return;
        }

        for line in trimmed.split('\n') {
            let _ = self
                .tx
                .send(OutputLine {
                    tag: self.tag.clone(),
                    line: line.to_string(),
                })
                .await;
        }
    }
}

pub fn channel() -> (OutputSender, mpsc::Receiver<OutputLine>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        OutputSender {
            tag: String::new(),
            tx,
        },
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_multiline_chunks_into_separate_lines() {
        let (tx, mut rx) = channel();
        let tagged = tx.tagged("app-utils 1.0.3");

        tagged.send("  line one\nline two  \n").await;
        drop(tagged);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.tag, "app-utils 1.0.3");
        assert_eq!(first.line, "line one");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.line, "line two");

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn blank_chunks_produce_no_lines() {
        let (tx, mut rx) = channel();
        let tagged = tx.tagged("x");
        tagged.send("   \n  \n").await;
        drop(tagged);

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn display_formats_as_tag_tab_line() {
        let line = OutputLine {
            tag: "sample-app 1.0.0".to_string(),
            line: "configure: checking build system".to_string(),
        };
        assert_eq!(
            line.to_string(),
            "sample-app 1.0.0\tconfigure: checking build system"
        );
    }
}
