//! # Legacy Query Response Encoding
//!
//! Builds the single-part multipart body the client firmware parses after a
//! recognition request. The firmware's parser is strict about the exact
//! bytes, so the body is written by hand rather than through a generic
//! multipart serializer.
//!
//! ## Body Layout (all line endings CRLF):
//! ```text
//! <CRLF>
//! ----Nuance_NMSP_vutc5w1XobDdefsYG3wq
//! Content-Type: application/JSON; charset=utf-8
//! Content-Disposition: form-data; name="QueryResult"
//! <CRLF>
//! {"words": [[{"word": "Hello\\*no-space-before", "confidence": 1.0}]]}
//! ----Nuance_NMSP_vutc5w1XobDdefsYG3wq--
//! ```

use serde::Serialize;
use serde_json::ser::Formatter;
use std::io;

/// Boundary token of the response body; delimiter lines are `--` + this token.
pub const RESPONSE_BOUNDARY: &str = "--Nuance_NMSP_vutc5w1XobDdefsYG3wq";

/// Layout hint appended to the first recognized word.
pub const NO_SPACE_BEFORE: &str = "\\*no-space-before";

pub const RETRY_CAUSE: u32 = 1;
pub const RETRY_NAME: &str = "AUDIO_INFO";
pub const RETRY_PROMPT: &str = "Sorry, speech not recognized. Please try again.";

const PART_CONTENT_TYPE: &str = "application/JSON; charset=utf-8";
const CRLF: &str = "\r\n";

/// A recognized token with its confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Word {
    pub word: String,
    pub confidence: f64,
}

impl Word {
    pub fn new(word: impl Into<String>) -> Self {
        Self {
            word: word.into(),
            confidence: 1.0,
        }
    }
}

/// What the client is told after a recognition attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Recognized words in spoken order.
    Result { words: Vec<Word> },
    /// No usable speech; the client should prompt the user to try again.
    Retry {
        cause: u32,
        name: String,
        prompt: String,
    },
}

#[derive(Serialize)]
struct ResultBody<'a> {
    words: [&'a [Word]; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RetryBody<'a> {
    cause: u32,
    name: &'a str,
    prompt: &'a str,
}

impl ResponsePayload {
    /// Build the payload for a recognition outcome.
    ///
    /// `None` means every backend failed; it produces the same `Retry`
    /// payload as a transcript with no words.
    pub fn from_transcript(transcript: Option<&str>) -> Self {
        let mut words: Vec<Word> = transcript
            .unwrap_or_default()
            .split(is_word_separator)
            .filter(|word| !word.is_empty())
            .map(Word::new)
            .collect();

        match words.first_mut() {
            Some(first) => {
                first.word.push_str(NO_SPACE_BEFORE);
                first.word = capitalize_first(&first.word);
                ResponsePayload::Result { words }
            }
            None => ResponsePayload::retry(),
        }
    }

    /// The fixed no-speech-detected payload.
    pub fn retry() -> Self {
        ResponsePayload::Retry {
            cause: RETRY_CAUSE,
            name: RETRY_NAME.to_string(),
            prompt: RETRY_PROMPT.to_string(),
        }
    }

    /// Name of the form-data part carrying this payload.
    pub fn part_name(&self) -> &'static str {
        match self {
            ResponsePayload::Result { .. } => "QueryResult",
            ResponsePayload::Retry { .. } => "QueryRetry",
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, ResponsePayload::Retry { .. })
    }

    /// Serialize the JSON part body in the legacy byte shape.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::with_capacity(128);
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, LegacyJsonFormatter);

        match self {
            ResponsePayload::Result { words } => ResultBody { words: [words.as_slice()] }.serialize(&mut serializer)?,
            ResponsePayload::Retry { cause, name, prompt } => RetryBody {
                cause: *cause,
                name,
                prompt,
            }
            .serialize(&mut serializer)?,
        }

        Ok(out)
    }

    /// Encode the complete response body.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let json = self.to_json()?;
        let delimiter = format!("--{}", RESPONSE_BOUNDARY);

        let mut body = Vec::with_capacity(json.len() + 256);
        body.extend_from_slice(CRLF.as_bytes());
        body.extend_from_slice(delimiter.as_bytes());
        body.extend_from_slice(CRLF.as_bytes());
        body.extend_from_slice(format!("Content-Type: {}{}", PART_CONTENT_TYPE, CRLF).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"{}", self.part_name(), CRLF).as_bytes(),
        );
        body.extend_from_slice(CRLF.as_bytes());
        body.extend_from_slice(&json);
        body.extend_from_slice(CRLF.as_bytes());
        body.extend_from_slice(delimiter.as_bytes());
        body.extend_from_slice(b"--");
        body.extend_from_slice(CRLF.as_bytes());
        Ok(body)
    }
}

/// Value of the outer HTTP `Content-Type` header.
pub fn response_content_type() -> String {
    format!("multipart/form-data; boundary={}", RESPONSE_BOUNDARY)
}

/// Unicode whitespace plus the ASCII file/group/record/unit separators,
/// which the legacy tokenizer also split on.
fn is_word_separator(ch: char) -> bool {
    ch.is_whitespace() || ('\u{1c}'..='\u{1f}').contains(&ch)
}

/// Uppercase only the first character; the rest is untouched.
fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// JSON formatter matching the legacy service's output: `", "` and `": "`
/// separators, every non-ASCII character escaped as `\uXXXX`.
struct LegacyJsonFormatter;

impl Formatter for LegacyJsonFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (index, ch) in fragment.char_indices() {
            if ch.is_ascii() && ch != '\u{7f}' {
                continue;
            }
            writer.write_all(fragment[start..index].as_bytes())?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = index + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_multipart::Multipart;
    use actix_web::http::header::{self, HeaderMap, HeaderValue};
    use actix_web::error::PayloadError;
    use actix_web::web::Bytes;
    use futures_util::StreamExt;

    #[test]
    fn test_first_word_gets_marker_and_capital() {
        let payload = ResponsePayload::from_transcript(Some("hello world"));

        match payload {
            ResponsePayload::Result { words } => {
                assert_eq!(words.len(), 2);
                assert_eq!(words[0], Word { word: "Hello\\*no-space-before".to_string(), confidence: 1.0 });
                assert_eq!(words[1], Word { word: "world".to_string(), confidence: 1.0 });
            }
            other => panic!("expected Result, got {:?}", other),
        }
    }

    #[test]
    fn test_only_first_character_is_uppercased() {
        let payload = ResponsePayload::from_transcript(Some("éCOLE  iPhone\tsays\nhi"));

        let ResponsePayload::Result { words } = payload else {
            panic!("expected Result");
        };
        let texts: Vec<&str> = words.iter().map(|w| w.word.as_str()).collect();
        assert_eq!(texts, vec!["ÉCOLE\\*no-space-before", "iPhone", "says", "hi"]);
    }

    #[test]
    fn test_empty_and_failed_transcripts_retry() {
        for transcript in [Some(""), Some("   \n "), None] {
            let payload = ResponsePayload::from_transcript(transcript);
            assert_eq!(
                payload,
                ResponsePayload::Retry {
                    cause: 1,
                    name: "AUDIO_INFO".to_string(),
                    prompt: RETRY_PROMPT.to_string(),
                }
            );
            assert_eq!(payload.part_name(), "QueryRetry");
        }
    }

    #[test]
    fn test_result_json_shape() {
        let json = ResponsePayload::from_transcript(Some("hello world")).to_json().unwrap();

        assert_eq!(
            String::from_utf8(json).unwrap(),
            r#"{"words": [[{"word": "Hello\\*no-space-before", "confidence": 1.0}, {"word": "world", "confidence": 1.0}]]}"#
        );
    }

    #[test]
    fn test_retry_json_shape() {
        let json = ResponsePayload::retry().to_json().unwrap();

        assert_eq!(
            String::from_utf8(json).unwrap(),
            r#"{"Cause": 1, "Name": "AUDIO_INFO", "Prompt": "Sorry, speech not recognized. Please try again."}"#
        );
    }

    #[test]
    fn test_non_ascii_is_escaped() {
        let json = ResponsePayload::from_transcript(Some("café 🎉")).to_json().unwrap();
        let text = String::from_utf8(json).unwrap();

        assert!(text.is_ascii());
        assert!(text.contains(r#""Caf\u00e9\\*no-space-before""#));
        assert!(text.contains(r#""\ud83c\udf89""#));
    }

    #[test]
    fn test_delete_character_is_escaped() {
        let json = ResponsePayload::from_transcript(Some("a\u{7f}b")).to_json().unwrap();
        let text = String::from_utf8(json).unwrap();

        assert!(!text.contains('\u{7f}'));
        assert!(text.contains(r#""A\u007fb\\*no-space-before""#));
    }

    #[test]
    fn test_ascii_separators_split_words() {
        match ResponsePayload::from_transcript(Some("one\u{1c}two\u{1f}three\u{0}four")) {
            ResponsePayload::Result { words } => {
                let texts: Vec<&str> = words.iter().map(|w| w.word.as_str()).collect();
                assert_eq!(texts, vec!["One\\*no-space-before", "two", "three\u{0}four"]);
            }
            other => panic!("expected words, got {:?}", other),
        }
    }

    #[test]
    fn test_exact_body_bytes() {
        let body = ResponsePayload::retry().encode().unwrap();

        let expected = concat!(
            "\r\n",
            "----Nuance_NMSP_vutc5w1XobDdefsYG3wq\r\n",
            "Content-Type: application/JSON; charset=utf-8\r\n",
            "Content-Disposition: form-data; name=\"QueryRetry\"\r\n",
            "\r\n",
            "{\"Cause\": 1, \"Name\": \"AUDIO_INFO\", \"Prompt\": \"Sorry, speech not recognized. Please try again.\"}\r\n",
            "----Nuance_NMSP_vutc5w1XobDdefsYG3wq--\r\n",
        );
        assert_eq!(String::from_utf8(body).unwrap(), expected);
    }

    #[test]
    fn test_no_bare_line_feeds() {
        let body = ResponsePayload::from_transcript(Some("one two three")).encode().unwrap();

        for (index, byte) in body.iter().enumerate() {
            if *byte == b'\n' {
                assert!(index > 0 && body[index - 1] == b'\r', "bare LF at {}", index);
            }
        }
    }

    #[test]
    fn test_content_type_header() {
        assert_eq!(
            response_content_type(),
            "multipart/form-data; boundary=--Nuance_NMSP_vutc5w1XobDdefsYG3wq"
        );
    }

    async fn read_single_part(payload: &ResponsePayload) -> (String, serde_json::Value) {
        let body = Bytes::from(payload.encode().unwrap());
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&response_content_type()).unwrap(),
        );

        let stream = futures_util::stream::once(async move { Ok::<_, PayloadError>(body) });
        let mut multipart = Multipart::new(&headers, stream);

        let mut parts = Vec::new();
        while let Some(field) = multipart.next().await {
            let mut field = field.unwrap();
            let name = field.name().unwrap().to_string();
            let mut data = Vec::new();
            while let Some(chunk) = field.next().await {
                data.extend_from_slice(&chunk.unwrap());
            }
            parts.push((name, serde_json::from_slice(&data).unwrap()));
        }

        assert_eq!(parts.len(), 1);
        parts.remove(0)
    }

    #[actix_web::test]
    async fn test_generic_reader_sees_query_result() {
        let payload = ResponsePayload::from_transcript(Some("set a timer"));
        let (name, json) = read_single_part(&payload).await;

        assert_eq!(name, "QueryResult");
        let words = json["words"][0].as_array().unwrap();
        assert_eq!(words.len(), 3);
        assert_eq!(words[0]["word"], "Set\\*no-space-before");
        assert_eq!(words[2]["word"], "timer");
        assert_eq!(words[2]["confidence"], 1.0);
    }

    #[actix_web::test]
    async fn test_generic_reader_sees_query_retry() {
        let (name, json) = read_single_part(&ResponsePayload::retry()).await;

        assert_eq!(name, "QueryRetry");
        assert_eq!(json["Cause"], 1);
        assert_eq!(json["Name"], "AUDIO_INFO");
        assert_eq!(json["Prompt"], RETRY_PROMPT);
    }
}
