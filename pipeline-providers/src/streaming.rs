//! ABOUTME: The streaming layer — a lazy, single-pass, cancellable sequence
//! ABOUTME: of provider messages, the closed set of consumer handlers, and
//! ABOUTME: per-stream metrics (§4.6).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_core::{PipelineError, Result, StepResult, Value};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One message in a provider's streaming response. The sequence is
/// terminated by exactly one `Result` message.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    System {
        subtype: String,
    },
    Assistant {
        text: String,
    },
    ToolUse {
        name: String,
        input: Value,
    },
    ToolResult {
        output: Value,
    },
    Result {
        success: bool,
        cost: f64,
        metadata: BTreeMap<String, Value>,
    },
}

impl StreamMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamMessage::System { .. } => "system",
            StreamMessage::Assistant { .. } => "assistant",
            StreamMessage::ToolUse { .. } => "tool_use",
            StreamMessage::ToolResult { .. } => "tool_result",
            StreamMessage::Result { .. } => "result",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            StreamMessage::System { subtype } => {
                serde_json::json!({"type": "system", "subtype": subtype})
            }
            StreamMessage::Assistant { text } => {
                serde_json::json!({"type": "assistant", "text": text})
            }
            StreamMessage::ToolUse { name, input } => {
                serde_json::json!({"type": "tool_use", "name": name, "input": serde_json::Value::from(input.clone())})
            }
            StreamMessage::ToolResult { output } => {
                serde_json::json!({"type": "tool_result", "output": serde_json::Value::from(output.clone())})
            }
            StreamMessage::Result {
                success,
                cost,
                metadata,
            } => {
                let meta: serde_json::Map<String, serde_json::Value> = metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v.clone())))
                    .collect();
                serde_json::json!({"type": "result", "success": success, "cost": cost, "metadata": meta})
            }
        }
    }
}

/// A cold producer / consumer pair connected by a bounded channel
/// (`stream_buffer_size` deep). Dropping the stream signals the producer to
/// stop within a bounded grace period; consuming it past the terminal
/// `Result` message yields `None` forever after.
pub struct MessageStream {
    receiver: mpsc::Receiver<StreamMessage>,
    cancelled: Arc<AtomicBool>,
}

impl MessageStream {
    pub async fn next(&mut self) -> Option<StreamMessage> {
        self.receiver.recv().await
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Spawn a producer task feeding `messages` through a bounded channel,
/// honoring backpressure (the channel blocks the producer when full) and
/// stopping early if the consumer drops the stream or cancels explicitly.
pub fn spawn_producer(messages: Vec<StreamMessage>, buffer_size: usize) -> MessageStream {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let cancelled = Arc::new(AtomicBool::new(false));
    let producer_cancelled = Arc::clone(&cancelled);

    tokio::spawn(async move {
        for message in messages {
            if producer_cancelled.load(Ordering::SeqCst) {
                debug!("stream producer observed cancellation, stopping early");
                return;
            }
            if tx.send(message).await.is_err() {
                return;
            }
        }
    });

    MessageStream {
        receiver: rx,
        cancelled,
    }
}

/// Per-stream metrics tracked while a stream is consumed (§4.6).
#[derive(Debug, Clone)]
pub struct StreamMetrics {
    pub message_count: u64,
    pub stream_started_at: DateTime<Utc>,
    pub first_token_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub interrupted_at: Option<DateTime<Utc>>,
    pub cost: f64,
}

impl StreamMetrics {
    fn new() -> Self {
        Self {
            message_count: 0,
            stream_started_at: Utc::now(),
            first_token_at: None,
            completed_at: None,
            interrupted_at: None,
            cost: 0.0,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted_at.is_some()
    }
}

/// The closed set of stream consumers (§4.6). Implementations are free to
/// fail `handle`; a handler failure marks the stream `interrupted` and the
/// owning step fails with `stream_interrupted`.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&mut self, message: &StreamMessage) -> Result<()>;

    async fn finish(&mut self, _metrics: &StreamMetrics) -> Result<()> {
        Ok(())
    }
}

/// Drive `stream` through `handler` to completion or interruption, updating
/// and returning `StreamMetrics`.
pub async fn run_stream(
    mut stream: MessageStream,
    handler: &mut dyn StreamHandler,
) -> Result<StreamMetrics> {
    let mut metrics = StreamMetrics::new();
    loop {
        let Some(message) = stream.next().await else {
            metrics.interrupted_at = Some(Utc::now());
            warn!("stream ended without a terminal Result message");
            handler.finish(&metrics).await?;
            return Err(PipelineError::StreamInterrupted {
                message: "stream producer ended before a terminal result message".to_string(),
            });
        };

        metrics.message_count += 1;
        if metrics.first_token_at.is_none() {
            metrics.first_token_at = Some(Utc::now());
        }

        if let Err(e) = handler.handle(&message).await {
            metrics.interrupted_at = Some(Utc::now());
            let _ = handler.finish(&metrics).await;
            return Err(PipelineError::StreamInterrupted {
                message: format!("stream handler failed: {e}"),
            });
        }

        if let StreamMessage::Result { cost, .. } = &message {
            metrics.cost = *cost;
            metrics.completed_at = Some(Utc::now());
            handler.finish(&metrics).await?;
            return Ok(metrics);
        }
    }
}

/// `collect_stream=true` (§4.6): concatenate assistant-message text into
/// `text` and capture the terminal `Result` metadata into a synchronous
/// `StepResult`.
pub async fn collect_stream(stream: MessageStream) -> Result<StepResult> {
    let mut collector = CollectHandler::default();
    let metrics = run_stream(stream, &mut collector).await?;
    let mut result = StepResult::text(collector.text).with_cost(metrics.cost);
    result.success = collector.success;
    result.metadata.insert(
        "message_count".to_string(),
        Value::Number(metrics.message_count as f64),
    );
    Ok(result)
}

#[derive(Default)]
struct CollectHandler {
    text: String,
    success: bool,
}

#[async_trait]
impl StreamHandler for CollectHandler {
    async fn handle(&mut self, message: &StreamMessage) -> Result<()> {
        match message {
            StreamMessage::Assistant { text } => self.text.push_str(text),
            StreamMessage::Result { success, .. } => self.success = *success,
            _ => {}
        }
        Ok(())
    }
}

/// Writes a human-readable transcript to stdout with a header, one line per
/// message body, and a statistics footer on completion.
#[derive(Default)]
pub struct ConsoleHandler {
    lines: Vec<String>,
}

#[async_trait]
impl StreamHandler for ConsoleHandler {
    async fn handle(&mut self, message: &StreamMessage) -> Result<()> {
        if self.lines.is_empty() {
            println!("=== stream started ===");
        }
        let line = match message {
            StreamMessage::System { subtype } => format!("[system:{subtype}]"),
            StreamMessage::Assistant { text } => text.clone(),
            StreamMessage::ToolUse { name, .. } => format!("[tool_use:{name}]"),
            StreamMessage::ToolResult { .. } => "[tool_result]".to_string(),
            StreamMessage::Result { success, .. } => format!("[result success={success}]"),
        };
        println!("{line}");
        self.lines.push(line);
        Ok(())
    }

    async fn finish(&mut self, metrics: &StreamMetrics) -> Result<()> {
        let duration_ms = metrics
            .completed_at
            .or(metrics.interrupted_at)
            .map(|end| (end - metrics.stream_started_at).num_milliseconds())
            .unwrap_or(0)
            .max(0) as f64;
        let avg = if metrics.message_count > 0 {
            duration_ms / metrics.message_count as f64
        } else {
            0.0
        };
        println!(
            "=== {} messages in {}ms (avg {:.1}ms/msg) ===",
            metrics.message_count, duration_ms, avg
        );
        Ok(())
    }
}

/// Line-by-line with optional timestamps, no header/footer decoration.
pub struct SimpleHandler {
    pub with_timestamps: bool,
}

#[async_trait]
impl StreamHandler for SimpleHandler {
    async fn handle(&mut self, message: &StreamMessage) -> Result<()> {
        let body = match message {
            StreamMessage::Assistant { text } => text.clone(),
            other => other.type_name().to_string(),
        };
        if self.with_timestamps {
            println!("[{}] {body}", Utc::now().to_rfc3339());
        } else {
            println!("{body}");
        }
        Ok(())
    }
}

/// Dumps every message type with its full metadata — for debugging.
#[derive(Default)]
pub struct DebugHandler;

#[async_trait]
impl StreamHandler for DebugHandler {
    async fn handle(&mut self, message: &StreamMessage) -> Result<()> {
        debug!(message = %message.to_json(), "stream message");
        Ok(())
    }
}

/// Appends each message as one JSON object per line, rotating to a new
/// numbered segment when the active file exceeds `max_size_mb`, keeping at
/// most `max_files` segments (§6).
pub struct FileHandler {
    base_path: PathBuf,
    max_size_mb: u64,
    max_files: u32,
    current_segment: u32,
    current_size: u64,
}

impl FileHandler {
    pub fn new(base_path: PathBuf, max_size_mb: u64, max_files: u32) -> Self {
        Self {
            base_path,
            max_size_mb,
            max_files,
            current_segment: 0,
            current_size: 0,
        }
    }

    fn segment_path(&self) -> PathBuf {
        if self.current_segment == 0 {
            self.base_path.clone()
        } else {
            self.base_path.with_extension(format!("{}.jsonl", self.current_segment))
        }
    }
}

#[async_trait]
impl StreamHandler for FileHandler {
    async fn handle(&mut self, message: &StreamMessage) -> Result<()> {
        use std::io::Write;
        let line = serde_json::to_string(&message.to_json()).map_err(|e| PipelineError::File {
            message: e.to_string(),
            path: Some(self.base_path.display().to_string()),
        })?;

        if self.current_size >= self.max_size_mb * 1_000_000 && self.current_segment + 1 < self.max_files {
            self.current_segment += 1;
            self.current_size = 0;
        }

        let path = self.segment_path();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PipelineError::File {
                message: e.to_string(),
                path: Some(path.display().to_string()),
            })?;
        writeln!(file, "{line}").map_err(|e| PipelineError::File {
            message: e.to_string(),
            path: Some(path.display().to_string()),
        })?;
        self.current_size += line.len() as u64 + 1;
        Ok(())
    }
}

/// Accumulates messages in memory, optionally as a fixed-size ring buffer
/// (drop oldest instead of blocking) with optional exact-text dedup.
pub struct BufferHandler {
    buffer: VecDeque<StreamMessage>,
    max_size: usize,
    ring_buffer: bool,
    dedup: bool,
    seen_text: std::collections::HashSet<String>,
}

impl BufferHandler {
    pub fn new(max_size: usize, ring_buffer: bool, dedup: bool) -> Self {
        Self {
            buffer: VecDeque::new(),
            max_size,
            ring_buffer,
            dedup,
            seen_text: std::collections::HashSet::new(),
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &StreamMessage> {
        self.buffer.iter()
    }
}

#[async_trait]
impl StreamHandler for BufferHandler {
    async fn handle(&mut self, message: &StreamMessage) -> Result<()> {
        if self.dedup {
            if let StreamMessage::Assistant { text } = message {
                if !self.seen_text.insert(text.clone()) {
                    return Ok(());
                }
            }
        }

        if self.buffer.len() >= self.max_size {
            if self.ring_buffer {
                self.buffer.pop_front();
            } else {
                return Ok(());
            }
        }
        self.buffer.push_back(message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStrategy {
    Stop,
    Continue,
}

/// Delivers messages to a caller-supplied callback, filtered by message
/// type and rate-limited to at most `rate_limit_per_sec` deliveries/second;
/// `error_strategy` decides whether a callback error stops the stream.
pub struct CallbackHandler<F>
where
    F: FnMut(&StreamMessage) -> Result<()> + Send,
{
    callback: F,
    type_filter: Option<std::collections::HashSet<&'static str>>,
    rate_limit_per_sec: Option<u32>,
    error_strategy: ErrorStrategy,
    last_delivery: Option<std::time::Instant>,
    delivered_this_window: u32,
}

impl<F> CallbackHandler<F>
where
    F: FnMut(&StreamMessage) -> Result<()> + Send,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            type_filter: None,
            rate_limit_per_sec: None,
            error_strategy: ErrorStrategy::Continue,
            last_delivery: None,
            delivered_this_window: 0,
        }
    }

    pub fn with_filter(mut self, types: std::collections::HashSet<&'static str>) -> Self {
        self.type_filter = Some(types);
        self
    }

    pub fn with_rate_limit(mut self, per_sec: u32) -> Self {
        self.rate_limit_per_sec = Some(per_sec);
        self
    }

    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }
}

#[async_trait]
impl<F> StreamHandler for CallbackHandler<F>
where
    F: FnMut(&StreamMessage) -> Result<()> + Send + Sync,
{
    async fn handle(&mut self, message: &StreamMessage) -> Result<()> {
        if let Some(filter) = &self.type_filter {
            if !filter.contains(message.type_name()) {
                return Ok(());
            }
        }

        if let Some(limit) = self.rate_limit_per_sec {
            let now = std::time::Instant::now();
            match self.last_delivery {
                Some(last) if now.duration_since(last) < std::time::Duration::from_secs(1) => {
                    if self.delivered_this_window >= limit {
                        return Ok(());
                    }
                    self.delivered_this_window += 1;
                }
                _ => {
                    self.last_delivery = Some(now);
                    self.delivered_this_window = 1;
                }
            }
        }

        match (self.callback)(message) {
            Ok(()) => Ok(()),
            Err(e) => match self.error_strategy {
                ErrorStrategy::Stop => Err(e),
                ErrorStrategy::Continue => {
                    warn!(error = %e, "callback handler error, continuing per error_strategy");
                    Ok(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<StreamMessage> {
        vec![
            StreamMessage::System {
                subtype: "init".to_string(),
            },
            StreamMessage::Assistant {
                text: "hello ".to_string(),
            },
            StreamMessage::Assistant {
                text: "world".to_string(),
            },
            StreamMessage::Result {
                success: true,
                cost: 0.002,
                metadata: BTreeMap::new(),
            },
        ]
    }

    #[tokio::test]
    async fn collect_stream_concatenates_assistant_text_in_order() {
        let stream = spawn_producer(sample_messages(), 8);
        let result = collect_stream(stream).await.unwrap();
        assert_eq!(result.text, "hello world");
        assert!(result.success);
        assert_eq!(result.cost, 0.002);
        assert_eq!(
            result.metadata.get("message_count").and_then(Value::as_f64),
            Some(4.0)
        );
    }

    #[tokio::test]
    async fn stream_without_terminal_result_is_interrupted() {
        let messages = vec![StreamMessage::Assistant {
            text: "partial".to_string(),
        }];
        let stream = spawn_producer(messages, 8);
        let err = collect_stream(stream).await.unwrap_err();
        assert_eq!(err.kind(), "stream_interrupted");
    }

    #[tokio::test]
    async fn buffer_handler_ring_mode_drops_oldest() {
        let mut handler = BufferHandler::new(2, true, false);
        for msg in sample_messages() {
            handler.handle(&msg).await.unwrap();
        }
        assert_eq!(handler.messages().count(), 2);
    }

    #[tokio::test]
    async fn buffer_handler_dedup_skips_repeated_text() {
        let mut handler = BufferHandler::new(10, false, true);
        let msg = StreamMessage::Assistant {
            text: "same".to_string(),
        };
        handler.handle(&msg).await.unwrap();
        handler.handle(&msg).await.unwrap();
        assert_eq!(handler.messages().count(), 1);
    }

    #[tokio::test]
    async fn callback_handler_stop_strategy_propagates_error() {
        let mut handler = CallbackHandler::new(|_| {
            Err(PipelineError::Internal {
                message: "boom".to_string(),
            })
        })
        .with_error_strategy(ErrorStrategy::Stop);
        let msg = StreamMessage::Assistant {
            text: "x".to_string(),
        };
        assert!(handler.handle(&msg).await.is_err());
    }

    #[tokio::test]
    async fn dropping_stream_signals_cancellation() {
        let stream = spawn_producer(sample_messages(), 1);
        let flag = Arc::clone(&stream.cancelled);
        drop(stream);
        assert!(flag.load(Ordering::SeqCst));
    }
}
