//! Concatenated JSON-array stream parser. The upstream sends a
//! single top-level `[ obj, obj, ... ]` split arbitrarily across TCP
//! frames. A "balanced braces" regex shortcut is explicitly the wrong
//! approach since string content may itself contain `{`/`}`/`[`/`]`; this
//! is an explicit depth/quote/escape state machine fed one byte chunk at a
//! time, yielding each object as soon as its closing brace is seen.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Between top-level array elements: looking for `[`, `,`, whitespace,
    /// or the start of an object.
    Seeking,
    /// Inside an object; `depth` counts unmatched `{`/`[`.
    InObject,
}

pub struct JsonArrayStreamParser {
    mode: Mode,
    depth: u32,
    in_string: bool,
    escape_next: bool,
    buffer: String,
}

impl Default for JsonArrayStreamParser {
    fn default() -> Self {
        JsonArrayStreamParser {
            mode: Mode::Seeking,
            depth: 0,
            in_string: false,
            escape_next: false,
            buffer: String::new(),
        }
    }
}

impl JsonArrayStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes (assumed valid UTF-8 once reassembled; callers
    /// should only call this with complete `str` chunks, e.g. from an
    /// already UTF-8-safe byte stream reader). Returns every object that
    /// closed within this chunk, in order.
    pub fn feed(&mut self, chunk: &str) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        for ch in chunk.chars() {
            match self.mode {
                Mode::Seeking => {
                    if ch == '{' {
                        self.mode = Mode::InObject;
                        self.depth = 1;
                        self.buffer.clear();
                        self.buffer.push(ch);
                    }
                    // `[`, `,`, `]`, and whitespace between elements are
                    // simply skipped while seeking the next object.
                }
                Mode::InObject => {
                    self.buffer.push(ch);
                    if self.in_string {
                        if self.escape_next {
                            self.escape_next = false;
                        } else if ch == '\\' {
                            self.escape_next = true;
                        } else if ch == '"' {
                            self.in_string = false;
                        }
                        continue;
                    }
                    match ch {
                        '"' => self.in_string = true,
                        '{' | '[' => self.depth += 1,
                        '}' | ']' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&self.buffer) {
                                    out.push(value);
                                }
                                self.buffer.clear();
                                self.mode = Mode::Seeking;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_objects_split_across_chunks() {
        let mut parser = JsonArrayStreamParser::new();
        let mut got = Vec::new();
        got.extend(parser.feed("[{\"a\":1"));
        got.extend(parser.feed("},{\"b\":"));
        got.extend(parser.feed("2}]"));
        assert_eq!(got.len(), 2);
        assert_eq!(got[0]["a"], 1);
        assert_eq!(got[1]["b"], 2);
    }

    #[test]
    fn tolerates_braces_and_brackets_inside_strings() {
        let mut parser = JsonArrayStreamParser::new();
        let input = r#"[{"text":"a { b [ c } d ] e","n":1}]"#;
        let got = parser.feed(input);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["text"], "a { b [ c } d ] e");
    }

    #[test]
    fn tolerates_escaped_quotes_inside_strings() {
        let mut parser = JsonArrayStreamParser::new();
        let input = r#"[{"text":"she said \"hi\""}]"#;
        let got = parser.feed(input);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["text"], "she said \"hi\"");
    }

    #[test]
    fn yields_same_sequence_for_arbitrary_whitespace_and_chunking() {
        let objects = [
            serde_json::json!({"i": 0}),
            serde_json::json!({"i": 1, "nested": {"x": [1,2,3]}}),
            serde_json::json!({"i": 2}),
        ];
        let full = format!(
            "[ \n {} , \n {} ,{} ]",
            objects[0], objects[1], objects[2]
        );
        for chunk_size in [1usize, 3, 7, 64] {
            let mut parser = JsonArrayStreamParser::new();
            let mut got = Vec::new();
            let chars: Vec<char> = full.chars().collect();
            for chunk in chars.chunks(chunk_size) {
                let s: String = chunk.iter().collect();
                got.extend(parser.feed(&s));
            }
            assert_eq!(got, objects, "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn empty_array_yields_nothing() {
        let mut parser = JsonArrayStreamParser::new();
        assert!(parser.feed("[]").is_empty());
    }
}
