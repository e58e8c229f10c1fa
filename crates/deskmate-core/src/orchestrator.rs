//! Two-phase chat turns.
//!
//! Phase one is buffered: nothing the model writes reaches the caller until the stream ends and
//! the text has been checked for tool directives. Without tool calls the masked text is sent as
//! the answer. With tool calls the tools run in order, their results go back to the model, and
//! the second response is streamed to the caller as it arrives.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use deskmate_observability::{emit_event, ObservabilityEvent, ProcessKind};
use deskmate_providers::{ModelEvent, ModelEventStream, ModelProvider};
use deskmate_runtime::ToolBackend;
use deskmate_tools::{
    extract_directives, follow_up_prompt, format_tool_results, native_calls, select_calls,
    system_prompt, tool_catalog, visible_text, ParameterNormalizer, RawToolCall,
};
use deskmate_types::{ChatMessage, NativeToolCall, TokenUsage, ToolResults, ToolSchema};

const OUTPUT_BUFFER: usize = 64;

/// Everything phase one produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedResponse {
    pub content: String,
    pub native_calls: Vec<NativeToolCall>,
    pub done_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl AccumulatedResponse {
    pub fn apply(&mut self, event: ModelEvent) -> anyhow::Result<()> {
        match event {
            ModelEvent::ContentFragment(text) => self.content.push_str(&text),
            ModelEvent::NativeToolCall(call) => self.native_calls.push(call),
            ModelEvent::Done { reason, usage } => {
                self.done_reason = Some(reason);
                self.usage = usage;
            }
            ModelEvent::UpstreamError(detail) => anyhow::bail!("model stream error: {detail}"),
        }
        Ok(())
    }

    /// The text shown when no tool runs: directives removed, including one the model never
    /// closed.
    pub fn masked(&self) -> String {
        visible_text(&self.content)
    }

    /// Directive calls if the text has any, otherwise the native calls.
    pub fn raw_calls(&self) -> Vec<RawToolCall> {
        select_calls(
            extract_directives(&self.content),
            native_calls(&self.native_calls),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Phase one answered directly.
    Answered,
    /// Tools ran and the follow-up response was streamed.
    AnsweredWithTools,
    /// The receiver went away before the turn finished.
    Cancelled,
    /// A model stream failed; the caller got a terminal error item.
    Failed,
}

impl TurnOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnOutcome::Answered => "answered",
            TurnOutcome::AnsweredWithTools => "answered_with_tools",
            TurnOutcome::Cancelled => "cancelled",
            TurnOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub correlation_id: String,
    pub outcome: TurnOutcome,
    pub tool_calls: usize,
    pub failed_tool_calls: usize,
    pub phase_one_usage: Option<TokenUsage>,
    pub phase_two_usage: Option<TokenUsage>,
}

pub struct ChatOrchestrator {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<dyn ToolBackend>,
    normalizer: ParameterNormalizer,
    system_prompt: String,
    native_tool_schemas: Option<Vec<ToolSchema>>,
    process: ProcessKind,
}

impl ChatOrchestrator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<dyn ToolBackend>,
        normalizer: ParameterNormalizer,
    ) -> Self {
        Self {
            provider,
            tools,
            normalizer,
            system_prompt: system_prompt(&tool_catalog()),
            native_tool_schemas: None,
            process: ProcessKind::Engine,
        }
    }

    pub fn with_native_tools(mut self, schemas: Vec<ToolSchema>) -> Self {
        self.native_tool_schemas = Some(schemas).filter(|s| !s.is_empty());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    pub fn tools(&self) -> Arc<dyn ToolBackend> {
        self.tools.clone()
    }

    /// Opens the phase-one stream. An error here means nothing was sent to the caller yet.
    pub async fn begin_turn(
        &self,
        thread_id: Option<&str>,
        messages: Vec<ChatMessage>,
    ) -> anyhow::Result<PendingTurn> {
        let correlation_id = Uuid::new_v4().to_string();
        emit_event(
            Level::INFO,
            self.process,
            ObservabilityEvent {
                event: "chat.turn.start",
                component: "orchestrator",
                correlation_id: Some(&correlation_id),
                thread_id,
                model_id: Some(self.provider.model_id()),
                ..Default::default()
            },
        );

        let mut prompt = Vec::with_capacity(messages.len() + 1);
        prompt.push(ChatMessage::system(self.system_prompt.clone()));
        prompt.extend(messages.iter().cloned());

        let cancel = CancellationToken::new();
        let phase_one = match self
            .provider
            .stream(prompt, self.native_tool_schemas.clone(), cancel.clone())
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                let detail = format!("{err:#}");
                emit_event(
                    Level::ERROR,
                    self.process,
                    ObservabilityEvent {
                        event: "chat.turn.error",
                        component: "orchestrator",
                        correlation_id: Some(&correlation_id),
                        thread_id,
                        model_id: Some(self.provider.model_id()),
                        error_code: Some("MODEL_UNAVAILABLE"),
                        detail: Some(&detail),
                        ..Default::default()
                    },
                );
                return Err(err);
            }
        };

        Ok(PendingTurn {
            provider: self.provider.clone(),
            tools: self.tools.clone(),
            normalizer: self.normalizer.clone(),
            messages,
            phase_one,
            cancel,
            correlation_id,
            thread_id: thread_id.map(str::to_string),
            process: self.process,
        })
    }
}

/// A turn whose phase-one stream is open.
pub struct PendingTurn {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<dyn ToolBackend>,
    normalizer: ParameterNormalizer,
    messages: Vec<ChatMessage>,
    phase_one: ModelEventStream,
    cancel: CancellationToken,
    correlation_id: String,
    thread_id: Option<String>,
    process: ProcessKind,
}

impl PendingTurn {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Runs the turn on its own task and hands back the caller-visible text.
    pub fn into_stream(self) -> ReceiverStream<anyhow::Result<String>> {
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        tokio::spawn(async move {
            self.run(tx).await;
        });
        ReceiverStream::new(rx)
    }

    /// Drives the whole turn into `sink`. A failure is delivered as one final `Err` item; the
    /// sender is dropped when this returns.
    pub async fn run(self, sink: mpsc::Sender<anyhow::Result<String>>) -> TurnReport {
        let mut report = TurnReport {
            correlation_id: self.correlation_id.clone(),
            outcome: TurnOutcome::Failed,
            tool_calls: 0,
            failed_tool_calls: 0,
            phase_one_usage: None,
            phase_two_usage: None,
        };
        let process = self.process;
        let thread_id = self.thread_id.clone();
        let model_id = self.provider.model_id().to_string();

        match self.drive(&sink, &mut report).await {
            Ok(outcome) => report.outcome = outcome,
            Err(err) => {
                let detail = format!("{err:#}");
                emit_event(
                    Level::ERROR,
                    process,
                    ObservabilityEvent {
                        event: "chat.turn.error",
                        component: "orchestrator",
                        correlation_id: Some(&report.correlation_id),
                        thread_id: thread_id.as_deref(),
                        model_id: Some(&model_id),
                        error_code: Some("MODEL_STREAM_FAILED"),
                        detail: Some(&detail),
                        ..Default::default()
                    },
                );
                report.outcome = TurnOutcome::Failed;
                let _ = sink.send(Err(err)).await;
            }
        }

        let tool_calls = report.tool_calls.to_string();
        emit_event(
            Level::INFO,
            process,
            ObservabilityEvent {
                event: "chat.turn.finish",
                component: "orchestrator",
                correlation_id: Some(&report.correlation_id),
                thread_id: thread_id.as_deref(),
                model_id: Some(&model_id),
                status: Some(report.outcome.as_str()),
                detail: Some(&tool_calls),
                ..Default::default()
            },
        );
        report
    }

    async fn drive(
        mut self,
        sink: &mpsc::Sender<anyhow::Result<String>>,
        report: &mut TurnReport,
    ) -> anyhow::Result<TurnOutcome> {
        let mut accumulated = AccumulatedResponse::default();
        while let Some(event) = self.phase_one.next().await {
            if sink.is_closed() {
                self.cancel.cancel();
                return Ok(TurnOutcome::Cancelled);
            }
            accumulated.apply(event?)?;
        }
        report.phase_one_usage = accumulated.usage;

        let raw_calls = accumulated.raw_calls();
        let phase_detail = format!(
            "chars={} native_calls={} calls={}",
            accumulated.content.chars().count(),
            accumulated.native_calls.len(),
            raw_calls.len()
        );
        self.emit(Level::INFO, "chat.phase1.done", None, None, Some(&phase_detail));

        if raw_calls.is_empty() {
            let visible = accumulated.masked();
            if !visible.trim().is_empty() && sink.send(Ok(visible)).await.is_err() {
                return Ok(TurnOutcome::Cancelled);
            }
            return Ok(TurnOutcome::Answered);
        }

        let calls = self.normalizer.normalize_all(raw_calls);
        report.tool_calls = calls.len();
        let results = self.tools.invoke_sequence(&calls).await;
        report.failed_tool_calls = results.failed_count();
        tracing::debug!(
            correlation_id = %self.correlation_id,
            labels = ?results.labels(),
            "tool results ready for follow-up"
        );
        self.emit_tool_results(&results);

        if sink.is_closed() {
            return Ok(TurnOutcome::Cancelled);
        }

        let follow_up = follow_up_messages(&self.messages, &accumulated.content, &results);
        let mut phase_two = self
            .provider
            .stream(follow_up, None, self.cancel.clone())
            .await?;
        while let Some(event) = phase_two.next().await {
            match event? {
                ModelEvent::ContentFragment(text) => {
                    if sink.send(Ok(text)).await.is_err() {
                        self.cancel.cancel();
                        return Ok(TurnOutcome::Cancelled);
                    }
                }
                ModelEvent::Done { usage, .. } => report.phase_two_usage = usage,
                ModelEvent::NativeToolCall(call) => {
                    tracing::debug!(tool = %call.name, "ignoring tool call in follow-up response");
                }
                ModelEvent::UpstreamError(detail) => anyhow::bail!("model stream error: {detail}"),
            }
        }
        Ok(TurnOutcome::AnsweredWithTools)
    }

    fn emit_tool_results(&self, results: &ToolResults) {
        for (label, result) in results.iter() {
            let (level, status) = if result.success {
                (Level::INFO, "ok")
            } else {
                (Level::WARN, "error")
            };
            self.emit(
                level,
                "tool.call.finish",
                Some(label),
                Some(status),
                result.error.as_deref(),
            );
        }
    }

    fn emit(
        &self,
        level: Level,
        event: &str,
        tool_name: Option<&str>,
        status: Option<&str>,
        detail: Option<&str>,
    ) {
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                event,
                component: "orchestrator",
                correlation_id: Some(&self.correlation_id),
                thread_id: self.thread_id.as_deref(),
                tool_name,
                model_id: Some(self.provider.model_id()),
                status,
                detail,
                ..Default::default()
            },
        );
    }
}

/// The conversation for phase two: the caller's messages, the raw phase-one reply, and the
/// formatted tool results.
pub fn follow_up_messages(
    messages: &[ChatMessage],
    phase_one_content: &str,
    results: &ToolResults,
) -> Vec<ChatMessage> {
    let mut follow_up = Vec::with_capacity(messages.len() + 2);
    follow_up.extend(messages.iter().cloned());
    follow_up.push(ChatMessage::assistant(phase_one_content));
    follow_up.push(ChatMessage::user(follow_up_prompt(&format_tool_results(
        results,
    ))));
    follow_up
}
