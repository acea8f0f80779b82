//! Wyoming protocol client.
//!
//! Every event is one JSON header line, optionally followed by
//! `data_length` bytes of JSON data and `payload_length` bytes of binary
//! payload. A transcription exchange is:
//!
//! ```text
//! → transcribe {language?}
//! → audio-start {rate, width, channels}
//! → audio-chunk {rate, width, channels} + PCM payload   (repeated)
//! → audio-stop
//! ← transcript {text}
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;

use super::{BackendError, SpeechBackend};
use crate::audio::Utterance;
use crate::config::WyomingConfig;

const PROTOCOL_VERSION: &str = "1.5.2";

/// One second of 16kHz 16-bit mono audio per chunk.
const CHUNK_BYTES: usize = 32000;

/// Headers longer than this are treated as a broken stream.
const MAX_HEADER_BYTES: usize = 64 * 1024;

pub struct WyomingBackend {
    address: String,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventHeader {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    data_length: Option<usize>,
    #[serde(default)]
    payload_length: Option<usize>,
}

/// A received event with inline and trailing data merged.
#[derive(Debug)]
struct Event {
    kind: String,
    data: Map<String, Value>,
}

impl WyomingBackend {
    pub fn new(config: &WyomingConfig, language: Option<String>) -> Result<Self, BackendError> {
        let host = config
            .host
            .as_deref()
            .filter(|host| !host.trim().is_empty())
            .ok_or(BackendError::NotConfigured("Wyoming server host"))?;

        Ok(Self {
            address: format!("{}:{}", host, config.port),
            language,
        })
    }

    async fn exchange<S>(&self, stream: S, utterance: &Utterance) -> Result<String, BackendError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        let format = json!({ "rate": utterance.sample_rate(), "width": 2, "channels": 1 });

        let transcribe = match &self.language {
            Some(language) => json!({ "language": language }),
            None => json!({}),
        };
        write_event(stream.get_mut(), "transcribe", &transcribe, &[]).await?;
        write_event(stream.get_mut(), "audio-start", &format, &[]).await?;
        for chunk in utterance.pcm_bytes().chunks(CHUNK_BYTES) {
            write_event(stream.get_mut(), "audio-chunk", &format, chunk).await?;
        }
        write_event(stream.get_mut(), "audio-stop", &json!({}), &[]).await?;
        stream.get_mut().flush().await?;

        loop {
            let event = read_event(&mut stream)
                .await?
                .ok_or_else(|| BackendError::Protocol("connection closed before transcript".to_string()))?;

            if event.kind == "transcript" {
                let text = event
                    .data
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                return Ok(text.trim().to_string());
            }

            if event.kind == "error" {
                let message = event
                    .data
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(BackendError::Protocol(format!("server error: {}", message)));
            }

            tracing::trace!(event = %event.kind, "Ignoring Wyoming event");
        }
    }
}

#[async_trait]
impl SpeechBackend for WyomingBackend {
    fn name(&self) -> &'static str {
        "wyoming"
    }

    async fn transcribe(&self, utterance: &Utterance) -> Result<String, BackendError> {
        tracing::debug!(address = %self.address, "Connecting to Wyoming server");
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        self.exchange(stream, utterance).await
    }
}

async fn write_event<W>(writer: &mut W, kind: &str, data: &Value, payload: &[u8]) -> Result<(), BackendError>
where
    W: AsyncWrite + Unpin,
{
    let data_bytes = serde_json::to_vec(data).map_err(|e| BackendError::Protocol(e.to_string()))?;

    let mut header = json!({
        "type": kind,
        "version": PROTOCOL_VERSION,
        "data_length": data_bytes.len(),
    });
    if !payload.is_empty() {
        header["payload_length"] = json!(payload.len());
    }

    let mut line = serde_json::to_vec(&header).map_err(|e| BackendError::Protocol(e.to_string()))?;
    line.push(b'\n');

    writer.write_all(&line).await?;
    writer.write_all(&data_bytes).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    Ok(())
}

/// Read one event. `Ok(None)` on a clean end of stream.
async fn read_event<R>(reader: &mut R) -> Result<Option<Event>, BackendError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_HEADER_BYTES as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        return Err(BackendError::Protocol("unterminated event header".to_string()));
    }

    let header: EventHeader = serde_json::from_slice(&line)
        .map_err(|e| BackendError::Protocol(format!("bad event header: {}", e)))?;

    let mut data = header.data.unwrap_or_default();

    if let Some(length) = header.data_length.filter(|&n| n > 0) {
        let mut raw = vec![0u8; length];
        reader.read_exact(&mut raw).await?;
        let extra: Map<String, Value> = serde_json::from_slice(&raw)
            .map_err(|e| BackendError::Protocol(format!("bad event data: {}", e)))?;
        data.extend(extra);
    }

    if let Some(length) = header.payload_length.filter(|&n| n > 0) {
        let skipped = tokio::io::copy(&mut (&mut *reader).take(length as u64), &mut tokio::io::sink()).await?;
        if skipped < length as u64 {
            return Err(BackendError::Protocol("truncated event payload".to_string()));
        }
    }

    Ok(Some(Event {
        kind: header.kind,
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn event_line(kind: &str, data: &Value) -> Vec<u8> {
        let data_bytes = serde_json::to_vec(data).unwrap();
        let mut out = serde_json::to_vec(&json!({ "type": kind, "data_length": data_bytes.len() })).unwrap();
        out.push(b'\n');
        out.extend(data_bytes);
        out
    }

    #[tokio::test]
    async fn test_full_exchange_with_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut kinds = Vec::new();

            while let Some(event) = read_event(&mut reader).await.unwrap() {
                if event.kind == "audio-chunk" {
                    assert_eq!(event.data["rate"], 16000);
                    assert_eq!(event.data["width"], 2);
                }
                kinds.push(event.kind.clone());
                if event.kind == "audio-stop" {
                    break;
                }
            }

            let socket = reader.get_mut();
            socket
                .write_all(&event_line("transcript", &json!({ "text": " set a timer " })))
                .await
                .unwrap();
            kinds
        });

        let backend = WyomingBackend::new(
            &WyomingConfig {
                host: Some("127.0.0.1".to_string()),
                port,
            },
            Some("en".to_string()),
        )
        .unwrap();

        // 1.5 seconds of audio splits into two chunks
        let text = backend
            .transcribe(&Utterance::from_samples(vec![0; 24000]))
            .await
            .unwrap();
        assert_eq!(text, "set a timer");

        let kinds = server.await.unwrap();
        assert_eq!(
            kinds,
            vec!["transcribe", "audio-start", "audio-chunk", "audio-chunk", "audio-stop"]
        );
    }

    #[tokio::test]
    async fn test_reads_inline_data_and_skips_payload() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"{\"type\": \"info\", \"data\": {\"asr\": []}, \"payload_length\": 3}\nabc");
        wire.extend(event_line("transcript", &json!({ "text": "ok" })));

        let mut reader = BufReader::new(wire.as_slice());
        let first = read_event(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.kind, "info");
        assert!(first.data.contains_key("asr"));

        let second = read_event(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.kind, "transcript");
        assert_eq!(second.data["text"], "ok");

        assert!(read_event(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_connection_is_a_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            while let Some(event) = read_event(&mut reader).await.unwrap() {
                if event.kind == "audio-stop" {
                    break;
                }
            }
        });

        let backend = WyomingBackend::new(
            &WyomingConfig {
                host: Some("127.0.0.1".to_string()),
                port,
            },
            None,
        )
        .unwrap();

        let err = backend
            .transcribe(&Utterance::from_samples(vec![0; 320]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
    }

    #[test]
    fn test_requires_host() {
        let config = WyomingConfig { host: None, port: 10300 };
        assert!(matches!(
            WyomingBackend::new(&config, None),
            Err(BackendError::NotConfigured(_))
        ));
    }
}
