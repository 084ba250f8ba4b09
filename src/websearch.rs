//! Web-search events in chat completion streams
//!
//! With web search enabled the enclave interleaves `web_search_call`
//! progress events with ordinary completion chunks in the same SSE stream.
//! Citations and reasoning arrive as extra fields on the chunk deltas, or
//! on the message of a non-streaming response.

use bytes::Bytes;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebSearchStatus {
    InProgress,
    Completed,
    Failed,
    /// Refused because the query contained personal data
    Blocked,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WebSearchCall {
    pub id: String,
    pub status: WebSearchStatus,
    /// Set when the search failed or was blocked
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub action: Option<WebSearchAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WebSearchAction {
    #[serde(rename = "type")]
    pub type_: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Annotation {
    #[serde(rename = "type")]
    pub type_: String,
    pub url_citation: UrlCitation,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UrlCitation {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub published_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReasoningItem {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub summary: Vec<SummaryPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SummaryPart {
    #[serde(rename = "type")]
    pub type_: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockedSearch {
    pub id: String,
    pub query: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Chunk delta, including web-search metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WebSearchDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub search_reasoning: Option<String>,
    #[serde(default)]
    pub reasoning_items: Vec<ReasoningItem>,
}

/// Assistant message of a non-streaming web-search response
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WebSearchMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub search_reasoning: Option<String>,
    #[serde(default)]
    pub reasoning_items: Vec<ReasoningItem>,
    #[serde(default)]
    pub blocked_searches: Vec<BlockedSearch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Option<WebSearchDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    WebSearchCall(WebSearchCall),
    Chunk(ChatChunk),
}

impl StreamEvent {
    fn parse(data: &str) -> Result<Self> {
        let invalid = |e: serde_json::Error| Error::Stream(format!("invalid stream event: {}", e));

        let value: serde_json::Value = serde_json::from_str(data).map_err(invalid)?;
        let is_call = value.get("type").and_then(|t| t.as_str()) == Some("web_search_call");
        if is_call {
            serde_json::from_value(value)
                .map(Self::WebSearchCall)
                .map_err(invalid)
        } else {
            serde_json::from_value(value).map(Self::Chunk).map_err(invalid)
        }
    }

    pub fn is_web_search_call(&self) -> bool {
        matches!(self, Self::WebSearchCall(_))
    }

    pub fn as_web_search_call(&self) -> Option<&WebSearchCall> {
        match self {
            Self::WebSearchCall(call) => Some(call),
            Self::Chunk(_) => None,
        }
    }

    pub fn as_chunk(&self) -> Option<&ChatChunk> {
        match self {
            Self::Chunk(chunk) => Some(chunk),
            Self::WebSearchCall(_) => None,
        }
    }
}

/// Event stream of a streaming chat completion.
///
/// Ends at `data: [DONE]` or when the body ends.
pub struct WebSearchStream {
    events: BoxStream<'static, Result<Event>>,
    done: bool,
}

impl WebSearchStream {
    pub fn new(response: reqwest::Response) -> Self {
        Self::from_byte_stream(response.bytes_stream())
    }

    /// Stream over already-received SSE data
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::from_byte_stream(futures::stream::once(async move {
            Ok::<_, reqwest::Error>(data)
        }))
    }

    fn from_byte_stream<S>(bytes: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
    {
        let events = bytes
            .eventsource()
            .map(|event| {
                event.map_err(|e| match e {
                    EventStreamError::Transport(e) => Error::Transport(e),
                    other => Error::Stream(other.to_string()),
                })
            })
            .boxed();
        Self {
            events,
            done: false,
        }
    }

    /// Next event, or `None` once the stream is finished
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        while !self.done {
            let Some(event) = self.events.next().await.transpose()? else {
                self.done = true;
                break;
            };
            match event.data.as_str() {
                "[DONE]" => self.done = true,
                "" => continue,
                data => return StreamEvent::parse(data).map(Some),
            }
        }
        Ok(None)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<StreamEvent>> {
        futures::stream::try_unfold(self, |mut stream| async move {
            let event = stream.next_event().await?;
            Ok::<_, Error>(event.map(|event| (event, stream)))
        })
    }
}

/// Message of the first choice of a non-streaming completion
pub fn parse_web_search_message(body: &[u8]) -> Result<WebSearchMessage> {
    #[derive(Deserialize)]
    struct Choice {
        message: WebSearchMessage,
    }

    #[derive(Deserialize)]
    struct Completion {
        #[serde(default)]
        choices: Vec<Choice>,
    }

    let completion: Completion = serde_json::from_slice(body)
        .map_err(|e| Error::Stream(format!("failed to parse response: {}", e)))?;
    completion
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .ok_or_else(|| Error::Stream("no choices in response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    const SEARCH_STREAM: &str = r#"data: {"type":"web_search_call","id":"ws_abc123","status":"in_progress","action":{"type":"search","query":"latest quantum computing news 2026"}}

data: {"type":"web_search_call","id":"ws_abc123","status":"completed","action":{"type":"search","query":"latest quantum computing news 2026"}}

data: {"choices":[{"index":0,"delta":{"annotations":[{"type":"url_citation","url_citation":{"title":"Quantum News","url":"https://example.com/quantum"}}]}}]}

data: {"choices":[{"index":0,"delta":{"content":"Here are the latest developments..."}}]}

data: {"choices":[{"index":0,"delta":{"content":" in quantum computing."},"finish_reason":"stop"}]}

data: [DONE]
"#;

    async fn collect(data: &str) -> Result<Vec<StreamEvent>> {
        WebSearchStream::from_bytes(data.to_owned()).into_stream().try_collect().await
    }

    fn delta(event: &StreamEvent) -> &WebSearchDelta {
        event.as_chunk().unwrap().choices[0].delta.as_ref().unwrap()
    }

    #[tokio::test]
    async fn search_calls_then_chunks() {
        let events = collect(SEARCH_STREAM).await.unwrap();
        assert_eq!(events.len(), 5);

        let call = events[0].as_web_search_call().unwrap();
        assert_eq!(call.status, WebSearchStatus::InProgress);
        assert_eq!(
            call.action.as_ref().unwrap().query,
            "latest quantum computing news 2026"
        );
        assert_eq!(
            events[1].as_web_search_call().unwrap().status,
            WebSearchStatus::Completed
        );

        assert!(!events[2].is_web_search_call());
        let annotation = &delta(&events[2]).annotations[0];
        assert_eq!(annotation.type_, "url_citation");
        assert_eq!(annotation.url_citation.title, "Quantum News");

        assert_eq!(
            delta(&events[3]).content.as_deref(),
            Some("Here are the latest developments...")
        );
        assert_eq!(delta(&events[4]).content.as_deref(), Some(" in quantum computing."));
        assert_eq!(
            events[4].as_chunk().unwrap().choices[0].finish_reason.as_deref(),
            Some("stop")
        );
    }

    #[tokio::test]
    async fn blocked_search_carries_reason() {
        let events = collect(
            "data: {\"type\":\"web_search_call\",\"id\":\"ws_def456\",\"status\":\"blocked\",\"reason\":\"SSN detected\",\"action\":{\"type\":\"search\",\"query\":\"q\"}}\n\ndata: [DONE]\n",
        )
        .await
        .unwrap();

        let call = events[0].as_web_search_call().unwrap();
        assert_eq!(call.status, WebSearchStatus::Blocked);
        assert_eq!(call.reason.as_deref(), Some("SSN detected"));
    }

    #[tokio::test]
    async fn done_only_stream_is_empty() {
        assert!(collect("data: [DONE]\n").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn comments_are_skipped() {
        let events = collect(
            ": keepalive\ndata: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"}}]}\n\n: another\ndata: [DONE]\n",
        )
        .await
        .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].as_web_search_call().is_none());
    }

    #[tokio::test]
    async fn malformed_event_is_an_error() {
        let err = collect("data: {not json}\n\n").await.unwrap_err();
        assert!(matches!(err, Error::Stream(_)));
    }

    #[tokio::test]
    async fn events_split_across_chunks() {
        let chunks: Vec<std::result::Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"con")),
            Ok(Bytes::from_static(b"tent\":\"hi\"}}]}\r\n\r\ndata: [DO")),
            Ok(Bytes::from_static(b"NE]\n\ndata: {\"ignored\":true}\n\n")),
        ];
        let mut stream = WebSearchStream::from_byte_stream(futures::stream::iter(chunks));

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(delta(&event).content.as_deref(), Some("hi"));
        assert!(stream.next_event().await.unwrap().is_none());
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[test]
    fn message_with_citations_and_reasoning() {
        let message = parse_web_search_message(
            br#"{"choices":[{"message":{
                "content":"The capital of France is Paris.",
                "annotations":[{"type":"url_citation","url_citation":{
                    "title":"France Wikipedia","url":"https://en.wikipedia.org/wiki/France",
                    "content":"Paris is the capital..."}}],
                "search_reasoning":"User asked about geography.",
                "reasoning_items":[{"id":"reason_123","type":"reasoning",
                    "summary":[{"type":"summary_text","text":"Looking up capital city information"}]}]
            }}]}"#,
        )
        .unwrap();

        assert_eq!(message.content, "The capital of France is Paris.");
        assert_eq!(message.annotations[0].url_citation.title, "France Wikipedia");
        assert_eq!(
            message.search_reasoning.as_deref(),
            Some("User asked about geography.")
        );
        assert_eq!(message.reasoning_items[0].type_, "reasoning");
        assert_eq!(
            message.reasoning_items[0].summary[0].text,
            "Looking up capital city information"
        );
    }

    #[test]
    fn message_with_blocked_searches() {
        let message = parse_web_search_message(
            br#"{"choices":[{"message":{"content":"I cannot search for that information.",
                "blocked_searches":[{"id":"ws_blocked1","query":"account 1234567890",
                    "reason":"Bank account number detected"}]}}]}"#,
        )
        .unwrap();

        let blocked = &message.blocked_searches[0];
        assert_eq!(blocked.query, "account 1234567890");
        assert_eq!(blocked.reason.as_deref(), Some("Bank account number detected"));
    }

    #[test]
    fn message_without_choices_is_an_error() {
        assert!(matches!(
            parse_web_search_message(br#"{"choices":[]}"#),
            Err(Error::Stream(_))
        ));
    }
}
