//! Incremental sentence assembly over a token stream.
//!
//! Tokens arrive as arbitrary fragments. A sentence is flushed when the
//! previous token ends with a terminator and the current token starts with
//! whitespace — delaying the decision by one token so "Mr." followed by
//! "Smith" does not split. The splitter also owns the two side channels of
//! the stream protocol: `^` silences the response outright, and everything
//! after a `|` accumulates as tool-message bytes instead of speech.

use std::mem;

const SENTENCE_ENDS: [char; 7] = ['.', '!', '?', ';', ':', '-', '\n'];
const QUOTE_CHARS: [char; 5] = ['"', '\u{201D}', '\u{201C}', '`', '\''];

/// What the splitter decided about the latest token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitAction {
    /// Keep feeding tokens.
    Buffered,
    /// A full sentence is ready for synthesis.
    Sentence(String),
    /// The model declined to speak; the response ends now.
    Silence,
}

#[derive(Debug, Default)]
pub struct TokenSplitter {
    sentence: String,
    previous: String,
    tool_buffer: String,
    in_tool_message: bool,
    silenced: bool,
}

impl TokenSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, token: &str) -> SplitAction {
        if self.silenced {
            return SplitAction::Silence;
        }
        if token.contains('^') {
            self.silenced = true;
            return SplitAction::Silence;
        }

        if self.in_tool_message {
            self.tool_buffer.push_str(token);
            return SplitAction::Buffered;
        }

        if let Some(pipe) = token.find('|') {
            self.in_tool_message = true;
            self.sentence.push_str(&self.previous);
            self.previous.clear();
            self.tool_buffer.push_str(&token[pipe + 1..]);
            let sentence = mem::take(&mut self.sentence);
            return if sentence.trim().is_empty() {
                SplitAction::Buffered
            } else {
                SplitAction::Sentence(sentence)
            };
        }

        let mut action = SplitAction::Buffered;
        if !self.previous.is_empty() {
            self.sentence.push_str(&self.previous);
            if ends_sentence(&self.previous) && starts_with_whitespace(token) {
                let sentence = mem::take(&mut self.sentence);
                if !sentence.trim().is_empty() {
                    action = SplitAction::Sentence(sentence);
                }
            }
        }
        self.previous = token.to_string();
        action
    }

    /// Flushes the stream end: any remaining sentence plus the raw
    /// tool-message bytes accumulated after the delimiter.
    pub fn finish(mut self) -> (Option<String>, Option<String>) {
        let sentence = if self.silenced {
            None
        } else {
            if !self.in_tool_message {
                self.sentence.push_str(&self.previous);
            }
            let remaining = self.sentence;
            if remaining.trim().is_empty() {
                None
            } else {
                Some(remaining)
            }
        };

        let tool_buffer = if self.tool_buffer.trim().is_empty() {
            None
        } else {
            Some(self.tool_buffer)
        };

        (sentence, tool_buffer)
    }

    pub fn is_silenced(&self) -> bool {
        self.silenced
    }
}

fn ends_sentence(token: &str) -> bool {
    let mut chars = token.chars().rev();
    let Some(last) = chars.next() else {
        return false;
    };
    if SENTENCE_ENDS.contains(&last) {
        return true;
    }
    if QUOTE_CHARS.contains(&last) {
        if let Some(prior) = chars.next() {
            return SENTENCE_ENDS.contains(&prior);
        }
    }
    false
}

fn starts_with_whitespace(token: &str) -> bool {
    token.chars().next().is_some_and(|c| c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(tokens: &[&str]) -> (Vec<String>, Option<String>, Option<String>) {
        let mut splitter = TokenSplitter::new();
        let mut sentences = Vec::new();
        for token in tokens {
            match splitter.push(token) {
                SplitAction::Sentence(s) => sentences.push(s),
                SplitAction::Silence => {
                    let (_, tool) = splitter.finish();
                    return (sentences, None, tool);
                }
                SplitAction::Buffered => {}
            }
        }
        let (rest, tool) = splitter.finish();
        (sentences, rest, tool)
    }

    #[test]
    fn splits_on_terminator_followed_by_whitespace() {
        let (sentences, rest, _) = run(&["It", " is", " sunny", ".", " The", " end", "."]);
        assert_eq!(sentences, vec!["It is sunny."]);
        assert_eq!(rest.unwrap(), " The end.");
    }

    #[test]
    fn does_not_split_inside_abbreviations() {
        let (sentences, rest, _) = run(&["Mr.", "Smith", " arrived", "."]);
        assert!(sentences.is_empty());
        assert_eq!(rest.unwrap(), "Mr.Smith arrived.");
    }

    #[test]
    fn terminator_with_closing_quote_splits() {
        let (sentences, rest, _) = run(&["He said \"hi.\"", " Then", " left."]);
        assert_eq!(sentences, vec!["He said \"hi.\""]);
        assert_eq!(rest.unwrap(), " Then left.");
    }

    #[test]
    fn never_emits_an_empty_sentence() {
        let (sentences, rest, _) = run(&[".", " ", ".", " "]);
        for s in &sentences {
            assert!(!s.trim().is_empty());
        }
        assert!(rest.is_none() || !rest.unwrap().trim().is_empty());
    }

    #[test]
    fn caret_silences_the_stream() {
        let mut splitter = TokenSplitter::new();
        assert_eq!(splitter.push("^"), SplitAction::Silence);
        assert!(splitter.is_silenced());
        assert_eq!(splitter.push(" more"), SplitAction::Silence);
        let (sentence, tool) = splitter.finish();
        assert!(sentence.is_none());
        assert!(tool.is_none());
    }

    #[test]
    fn pipe_flushes_sentence_and_starts_tool_buffer() {
        let (sentences, rest, tool) = run(&[
            "It",
            " is",
            " sunny",
            ".",
            " |",
            "[{\"name\":\"Weather\",",
            "\"input\":\"now\"}]",
        ]);
        assert_eq!(sentences, vec!["It is sunny."]);
        assert!(rest.is_none());
        assert_eq!(tool.unwrap(), "[{\"name\":\"Weather\",\"input\":\"now\"}]");
    }

    #[test]
    fn characters_after_pipe_in_the_same_token_start_the_buffer() {
        let (sentences, _, tool) = run(&["Sure", ".", " |[{\"name\"", ":\"X\",\"input\":\"Y\"}]"]);
        assert_eq!(sentences, vec!["Sure."]);
        assert_eq!(tool.unwrap(), "[{\"name\":\"X\",\"input\":\"Y\"}]");
    }

    #[test]
    fn eof_flushes_the_last_token() {
        let (sentences, rest, _) = run(&["Hello", " there"]);
        assert!(sentences.is_empty());
        assert_eq!(rest.unwrap(), "Hello there");
    }
}
