//! Live classification of a phase-1 response as prose or tool-call JSON.
//!
//! Chunks are held back until `window` characters have arrived after any
//! leading whitespace. If the response then starts with `{` or `"` it
//! is JSON-shaped and buffered to the end; otherwise every held chunk is
//! released and later chunks pass straight through.

use tracing::trace;

/// Shape of a phase-1 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Text,
    Json,
}

/// What is left once the response is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Prose; these chunks were still held back and must be forwarded.
    Text(Vec<String>),
    /// JSON-shaped; the complete buffered response.
    Json(String),
    /// Nothing but whitespace arrived.
    Empty,
}

#[derive(Debug)]
pub struct StreamClassifier {
    window: usize,
    shape: Option<Shape>,
    held: Vec<String>,
    seen: String,
}

impl StreamClassifier {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            shape: None,
            held: Vec::new(),
            seen: String::new(),
        }
    }

    pub fn shape(&self) -> Option<Shape> {
        self.shape
    }

    /// Feed one chunk; returns the chunks that may be forwarded now.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        match self.shape {
            Some(Shape::Text) => return vec![chunk.to_string()],
            Some(Shape::Json) => {
                self.seen.push_str(chunk);
                return Vec::new();
            }
            None => {}
        }

        self.seen.push_str(chunk);
        self.held.push(chunk.to_string());

        let observed = self.seen.trim_start().chars().count();
        if observed < self.window {
            return Vec::new();
        }

        let shape = Self::classify(&self.seen);
        trace!(?shape, observed, "phase-1 response classified");
        self.shape = Some(shape);
        match shape {
            Shape::Text => std::mem::take(&mut self.held),
            Shape::Json => {
                self.held.clear();
                Vec::new()
            }
        }
    }

    /// End of response. Classifies short responses that never filled the
    /// window.
    pub fn finish(self) -> Classified {
        match self.shape {
            Some(Shape::Text) => Classified::Text(Vec::new()),
            Some(Shape::Json) => Classified::Json(self.seen),
            None if self.seen.trim().is_empty() => Classified::Empty,
            None => match Self::classify(&self.seen) {
                Shape::Text => Classified::Text(self.held),
                Shape::Json => Classified::Json(self.seen),
            },
        }
    }

    fn classify(text: &str) -> Shape {
        match text.trim_start().chars().next() {
            Some('{') | Some('"') => Shape::Json,
            _ => Shape::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_is_released_once_window_fills() {
        let mut c = StreamClassifier::new(10);
        assert!(c.push("Tim ").is_empty());
        assert!(c.push("to ").is_empty());
        assert_eq!(
            c.push("là gì"),
            vec!["Tim ".to_string(), "to ".to_string(), "là gì".to_string()]
        );
        assert_eq!(c.shape(), Some(Shape::Text));
        assert_eq!(c.push(" vậy?"), vec![" vậy?".to_string()]);
        assert_eq!(c.finish(), Classified::Text(Vec::new()));
    }

    #[test]
    fn test_leading_whitespace_does_not_count() {
        let mut c = StreamClassifier::new(3);
        assert!(c.push("   \n").is_empty());
        assert!(c.push("{\"a").is_empty());
        assert_eq!(c.shape(), Some(Shape::Json));
    }

    #[test]
    fn test_quoted_start_is_json_shaped() {
        let mut c = StreamClassifier::new(2);
        c.push("\"tool_call\": {}");
        assert_eq!(c.shape(), Some(Shape::Json));
    }

    #[test]
    fn test_blank_response_is_empty() {
        let mut c = StreamClassifier::new(10);
        c.push("  ");
        assert_eq!(c.finish(), Classified::Empty);
    }
}
