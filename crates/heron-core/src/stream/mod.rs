//! Think-tag separation for chunked model output.
//!
//! Models may wrap reasoning in `<think>...</think>`. The delimiters can be
//! split at any chunk boundary, so [`ThinkFilter`] runs a small buffering
//! state machine over characters and emits [`Segment`]s as soon as they are
//! unambiguous.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, TextStream};

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// Parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkState {
    /// Plain visible text.
    Outside,
    /// Saw a prefix of `<think>`.
    MaybeOpen,
    /// Inside a thinking block.
    InsideThink,
    /// Inside a thinking block and saw a prefix of `</think>`.
    MaybeClose,
}

/// A resolved piece of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Visible(String),
    Thought(String),
}

/// Incremental `<think>` tag filter.
#[derive(Debug)]
pub struct ThinkFilter {
    state: ThinkState,
    partial: String,
    thought: String,
    visible: String,
}

impl Default for ThinkFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkFilter {
    pub fn new() -> Self {
        Self {
            state: ThinkState::Outside,
            partial: String::new(),
            thought: String::new(),
            visible: String::new(),
        }
    }

    pub fn state(&self) -> ThinkState {
        self.state
    }

    /// Feed one chunk and return the segments it resolved, in stream order.
    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        let mut out = Vec::new();
        for c in chunk.chars() {
            self.step(c, &mut out);
        }
        self.flush_visible(&mut out);
        out
    }

    /// End of input. An unterminated thinking block, and any dangling
    /// partial tag, is released as visible text.
    pub fn finish(mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        match self.state {
            ThinkState::Outside => {}
            ThinkState::MaybeOpen => {
                let partial = std::mem::take(&mut self.partial);
                self.visible.push_str(&partial);
            }
            ThinkState::InsideThink => {
                let thought = std::mem::take(&mut self.thought);
                self.visible.push_str(&thought);
            }
            ThinkState::MaybeClose => {
                let thought = std::mem::take(&mut self.thought);
                let partial = std::mem::take(&mut self.partial);
                self.visible.push_str(&thought);
                self.visible.push_str(&partial);
            }
        }
        if self.state != ThinkState::Outside {
            tracing::debug!(state = ?self.state, "stream ended inside a think tag");
        }
        self.flush_visible(&mut out);
        out
    }

    fn step(&mut self, c: char, out: &mut Vec<Segment>) {
        match self.state {
            ThinkState::Outside => {
                if c == '<' {
                    self.partial.push(c);
                    self.state = ThinkState::MaybeOpen;
                } else {
                    self.visible.push(c);
                }
            }
            ThinkState::MaybeOpen => {
                self.partial.push(c);
                if self.partial == OPEN_TAG {
                    self.partial.clear();
                    self.state = ThinkState::InsideThink;
                } else if !OPEN_TAG.starts_with(self.partial.as_str()) {
                    // Not a tag after all: release what was held back and
                    // reconsider `c`, which may start a new tag.
                    self.partial.pop();
                    let held = std::mem::take(&mut self.partial);
                    self.visible.push_str(&held);
                    self.state = ThinkState::Outside;
                    self.step(c, out);
                }
            }
            ThinkState::InsideThink => {
                if c == '<' {
                    self.partial.push(c);
                    self.state = ThinkState::MaybeClose;
                } else {
                    self.thought.push(c);
                }
            }
            ThinkState::MaybeClose => {
                self.partial.push(c);
                if self.partial == CLOSE_TAG {
                    self.partial.clear();
                    self.state = ThinkState::Outside;
                    self.flush_visible(out);
                    let thought = std::mem::take(&mut self.thought);
                    if !thought.is_empty() {
                        out.push(Segment::Thought(thought));
                    }
                } else if !CLOSE_TAG.starts_with(self.partial.as_str()) {
                    self.partial.pop();
                    let held = std::mem::take(&mut self.partial);
                    self.thought.push_str(&held);
                    self.state = ThinkState::InsideThink;
                    self.step(c, out);
                }
            }
        }
    }

    fn flush_visible(&mut self, out: &mut Vec<Segment>) {
        if !self.visible.is_empty() {
            out.push(Segment::Visible(std::mem::take(&mut self.visible)));
        }
    }
}

/// Visible text and thinking segments of a complete response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedText {
    pub visible: String,
    pub thoughts: Vec<String>,
}

impl AggregatedText {
    pub fn absorb(&mut self, segment: Segment) {
        match segment {
            Segment::Visible(text) => self.visible.push_str(&text),
            Segment::Thought(text) => self.thoughts.push(text),
        }
    }
}

/// Split a complete response into visible text and thoughts.
pub fn strip_think_tags(text: &str) -> AggregatedText {
    let mut filter = ThinkFilter::new();
    let mut aggregated = AggregatedText::default();
    for segment in filter.push(text) {
        aggregated.absorb(segment);
    }
    for segment in filter.finish() {
        aggregated.absorb(segment);
    }
    aggregated
}

pub type SegmentStream = Pin<Box<dyn Stream<Item = Result<Segment, BackendError>> + Send>>;

enum Step {
    Chunk(Option<Result<String, BackendError>>),
    Cancelled,
}

/// Run a backend text stream through a [`ThinkFilter`].
///
/// The returned stream is lazy and finite. It ends after the first error,
/// and yields [`BackendError::Cancelled`] if `cancel` fires first.
pub fn aggregate(mut chunks: TextStream, cancel: CancellationToken) -> SegmentStream {
    Box::pin(async_stream::stream! {
        let mut filter = ThinkFilter::new();
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                item = chunks.next() => Step::Chunk(item),
            };
            match step {
                Step::Cancelled => {
                    yield Err(BackendError::Cancelled);
                    return;
                }
                Step::Chunk(Some(Ok(chunk))) => {
                    for segment in filter.push(&chunk) {
                        yield Ok(segment);
                    }
                }
                Step::Chunk(Some(Err(e))) => {
                    yield Err(e);
                    return;
                }
                Step::Chunk(None) => break,
            }
        }
        for segment in filter.finish() {
            yield Ok(segment);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> AggregatedText {
        let mut filter = ThinkFilter::new();
        let mut out = AggregatedText::default();
        for chunk in chunks {
            for segment in filter.push(chunk) {
                out.absorb(segment);
            }
        }
        for segment in filter.finish() {
            out.absorb(segment);
        }
        out
    }

    #[test]
    fn open_tag_split_across_chunks() {
        let out = run(&["<th", "ink>hidden</think>visible"]);
        assert_eq!(out.visible, "visible");
        assert_eq!(out.thoughts, vec!["hidden".to_string()]);
    }

    #[test]
    fn every_split_point_gives_the_same_result() {
        let text = "before <think>plan a < b</think> after <b>bold</b>";
        let expected = strip_think_tags(text);
        assert_eq!(expected.visible, "before  after <b>bold</b>");
        assert_eq!(expected.thoughts, vec!["plan a < b".to_string()]);

        let chars: Vec<char> = text.chars().collect();
        for i in 0..=chars.len() {
            for j in i..=chars.len() {
                let a: String = chars[..i].iter().collect();
                let b: String = chars[i..j].iter().collect();
                let c: String = chars[j..].iter().collect();
                assert_eq!(run(&[&a, &b, &c]), expected, "split at {i}/{j}");
            }
        }
    }

    #[test]
    fn false_start_is_released_as_visible() {
        let out = run(&["a <thin", "g> and <<think>x</think>"]);
        assert_eq!(out.visible, "a <thing> and <");
        assert_eq!(out.thoughts, vec!["x".to_string()]);
    }

    #[test]
    fn near_miss_close_tag_stays_in_thought() {
        let out = run(&["<think>x</thin>y</think>z"]);
        assert_eq!(out.visible, "z");
        assert_eq!(out.thoughts, vec!["x</thin>y".to_string()]);
    }

    #[test]
    fn unterminated_block_becomes_visible() {
        let out = run(&["answer <think>still thinking"]);
        assert_eq!(out.visible, "answer still thinking");
        assert!(out.thoughts.is_empty());

        let out = run(&["<think>half </thi"]);
        assert_eq!(out.visible, "half </thi");
    }

    #[test]
    fn dangling_partial_open_tag_is_visible() {
        let out = run(&["x <thi"]);
        assert_eq!(out.visible, "x <thi");
    }

    #[test]
    fn visible_before_thought_keeps_order() {
        let mut filter = ThinkFilter::new();
        let segments = filter.push("a<think>b</think>c");
        assert_eq!(
            segments,
            vec![
                Segment::Visible("a".to_string()),
                Segment::Thought("b".to_string()),
                Segment::Visible("c".to_string()),
            ]
        );
        assert_eq!(filter.state(), ThinkState::Outside);
    }

    #[test]
    fn multiple_thoughts_are_collected() {
        let out = strip_think_tags("<think>one</think>A<think>two</think>B");
        assert_eq!(out.visible, "AB");
        assert_eq!(out.thoughts, vec!["one".to_string(), "two".to_string()]);
    }

    fn chunk_stream(items: Vec<Result<String, BackendError>>) -> TextStream {
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn aggregate_streams_segments() {
        let chunks = chunk_stream(vec![
            Ok("<th".to_string()),
            Ok("ink>hidden</think>visible".to_string()),
        ]);
        let segments: Vec<_> = aggregate(chunks, CancellationToken::new()).collect().await;
        let segments: Vec<Segment> = segments.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            segments,
            vec![
                Segment::Thought("hidden".to_string()),
                Segment::Visible("visible".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn aggregate_stops_after_stream_error() {
        let chunks = chunk_stream(vec![
            Ok("partial".to_string()),
            Err(BackendError::Stream("connection reset".to_string())),
            Ok("never".to_string()),
        ]);
        let items: Vec<_> = aggregate(chunks, CancellationToken::new()).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(Segment::Visible("partial".to_string())));
        assert!(matches!(items[1], Err(BackendError::Stream(_))));
    }

    #[tokio::test]
    async fn aggregate_honors_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let chunks: TextStream = Box::pin(futures::stream::pending());
        let items: Vec<_> = aggregate(chunks, cancel).collect().await;
        assert!(matches!(items.as_slice(), [Err(BackendError::Cancelled)]));
    }
}
