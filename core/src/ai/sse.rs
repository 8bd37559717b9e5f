//! Incremental decoder for `text/event-stream` chat completion responses.

use serde::Deserialize;

use super::GeneratorError;

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds raw bytes and returns the text fragments completed by them.
    /// Bytes are buffered until a full line arrives, so multi-byte characters
    /// split across network chunks decode intact.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, GeneratorError>> {
        self.buffer.extend_from_slice(bytes);

        let mut fragments = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(fragment) = self.decode_line(line.trim_end_matches(['\r', '\n'])) {
                fragments.push(fragment);
            }
        }
        fragments
    }

    /// Decodes whatever is left once the body ends without a final newline.
    pub fn finish(&mut self) -> Option<Result<String, GeneratorError>> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest).into_owned();
        self.decode_line(rest.trim())
    }

    fn decode_line(&mut self, line: &str) -> Option<Result<String, GeneratorError>> {
        if self.done {
            return None;
        }
        let payload = line.strip_prefix("data:")?.trim();
        if payload.is_empty() {
            return None;
        }
        if payload == "[DONE]" {
            self.done = true;
            return None;
        }

        match serde_json::from_str::<StreamChunk>(payload) {
            Ok(chunk) => chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta)
                .and_then(|delta| delta.content)
                .filter(|content| !content.is_empty())
                .map(Ok),
            Err(err) => Some(Err(GeneratorError::InvalidResponse(format!(
                "malformed stream event: {err}"
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(results: Vec<Result<String, GeneratorError>>) -> Vec<String> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn decodes_content_deltas() {
        let mut decoder = SseDecoder::new();
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"末影\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"珍珠\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        assert_eq!(texts(decoder.push(body.as_bytes())), vec!["末影", "珍珠"]);
        assert!(decoder.is_done());
    }

    #[test]
    fn buffers_lines_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let first = decoder.push(b"data: {\"choices\":[{\"delta\":{\"con");
        assert!(first.is_empty());
        let second = decoder.push(b"tent\":\"hello\"}}]}\n");
        assert_eq!(texts(second), vec!["hello"]);
    }

    #[test]
    fn keeps_multibyte_characters_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"珍珠\"}}]}\n".as_bytes();
        let cut = line.iter().position(|b| *b >= 0x80).unwrap() + 1;
        assert!(decoder.push(&line[..cut]).is_empty());
        assert_eq!(texts(decoder.push(&line[cut..])), vec!["珍珠"]);
    }

    #[test]
    fn ignores_comments_and_events_after_done() {
        let mut decoder = SseDecoder::new();
        let body = ": keep-alive\ndata: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n";
        assert!(decoder.push(body.as_bytes()).is_empty());
    }

    #[test]
    fn reports_malformed_events() {
        let mut decoder = SseDecoder::new();
        let results = decoder.push(b"data: {not json}\n");
        assert!(matches!(results[0], Err(GeneratorError::InvalidResponse(_))));
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder
            .push(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}")
            .is_empty());
        assert_eq!(decoder.finish().unwrap().unwrap(), "tail");
    }
}
