//! Turn-loop behavior against a scripted provider: plain turns, parallel
//! tool dispatch with order preservation, thinking-block continuation,
//! paid-tool pre-checks, and mid-stream cancellation.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use courier_agent::cost::CostTracker;
use courier_agent::files_api::FilesApiClient;
use courier_agent::prompt::SystemPrompt;
use courier_agent::provider::{ChatRequest, LlmProvider, StreamEvent};
use courier_agent::tools::{
    ToolContext, ToolDescriptor, ToolExecutor, ToolOutcome, ToolRegistry,
};
use courier_agent::turn::{run_turn, TurnSink};
use courier_cache::CacheClient;
use courier_core::metrics::Metrics;
use courier_core::{TokenUsage, Usd};
use courier_store::models::User;
use courier_store::repo::users;
use courier_store::{BalancePolicy, Database};

/// Provider that replays scripted event sequences, one per stream call,
/// and records every request it receives.
struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Vec<StreamEvent>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request(&self, index: usize) -> ChatRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> courier_core::Result<()> {
        self.requests.lock().unwrap().push(req.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no script left for stream call");
        for event in script {
            // Small pause so cancellation tests interleave realistically.
            tokio::time::sleep(Duration::from_millis(2)).await;
            if tx.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Echo tool that waits `delay_ms` then reports its own name.
struct EchoTool {
    descriptor: &'static ToolDescriptor,
    delay_ms: u64,
}

static ECHO_SLOW: ToolDescriptor = ToolDescriptor {
    name: "echo_slow",
    emoji: "🐢",
    description: "Echo after a delay",
    paid: false,
    allowed_mime_prefixes: &[],
};
static ECHO_FAST: ToolDescriptor = ToolDescriptor {
    name: "echo_fast",
    emoji: "🐇",
    description: "Echo quickly",
    paid: false,
    allowed_mime_prefixes: &[],
};

#[async_trait]
impl ToolExecutor for EchoTool {
    fn descriptor(&self) -> &'static ToolDescriptor {
        self.descriptor
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _ctx: &ToolContext, _input: Value) -> ToolOutcome {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        ToolOutcome::success_with_cost(
            format!("result from {}", self.descriptor.name),
            Usd::from_str("0.0010").unwrap(),
        )
    }
}

/// Sink that records deltas and optionally cancels after N text deltas.
#[derive(Default)]
struct RecordingSink {
    text: String,
    thinking: String,
    markers: Vec<String>,
    finished: Vec<(String, bool)>,
    cancel_after_deltas: Option<(usize, CancellationToken)>,
    deltas_seen: usize,
}

#[async_trait]
impl TurnSink for RecordingSink {
    async fn text_delta(&mut self, text: &str) {
        self.text.push_str(text);
        self.deltas_seen += 1;
        if let Some((limit, token)) = &self.cancel_after_deltas {
            if self.deltas_seen >= *limit {
                token.cancel();
            }
        }
    }

    async fn thinking_delta(&mut self, text: &str) {
        self.thinking.push_str(text);
    }

    async fn tool_started(&mut self, marker: &str) {
        self.markers.push(marker.to_string());
    }

    async fn tool_finished(&mut self, name: &str, success: bool) {
        self.finished.push((name.to_string(), success));
    }
}

struct Harness {
    db: Arc<Database>,
    cache: Arc<CacheClient>,
    metrics: Arc<Metrics>,
    policy: BalancePolicy,
}

impl Harness {
    fn new() -> Self {
        let metrics = Arc::new(Metrics::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = Arc::new(CacheClient::disconnected(Arc::clone(&metrics)));
        let policy = BalancePolicy::new(Arc::clone(&db), Arc::clone(&cache), Usd::ZERO);
        Self {
            db,
            cache,
            metrics,
            policy,
        }
    }

    async fn seed_user(&self, user_id: i64, balance: &str) {
        let mut user = User::new(user_id, "claude-sonnet-4-5");
        user.balance = Usd::from_str(balance).unwrap();
        self.db
            .with_conn(move |conn| users::upsert(conn, &user))
            .await
            .unwrap();
    }

    fn tool_ctx(&self, provider: Arc<dyn LlmProvider>, user_id: i64) -> ToolContext {
        ToolContext {
            cache: Arc::clone(&self.cache),
            db: Arc::clone(&self.db),
            provider,
            files: Arc::new(FilesApiClient::new(
                "test-key".into(),
                "http://localhost:9".into(),
                24,
            )),
            sandbox: None,
            transcription: None,
            delivery: None,
            user_id,
            chat_id: 100,
            thread_id: 1,
            topic_id: 0,
            model_id: "claude-sonnet-4-5".into(),
        }
    }
}

fn request() -> ChatRequest {
    ChatRequest {
        model: "claude-sonnet-4-5".into(),
        max_tokens: 8192,
        system: SystemPrompt::new("You are helpful.", None, None),
        messages: vec![json!({"role": "user", "content": "Hello"})],
        tools: vec![],
        thinking_budget: None,
    }
}

fn input_usage(input: u32) -> StreamEvent {
    StreamEvent::Usage {
        usage: TokenUsage {
            input,
            ..Default::default()
        },
    }
}

fn output_usage(output: u32) -> StreamEvent {
    StreamEvent::Usage {
        usage: TokenUsage {
            output,
            ..Default::default()
        },
    }
}

fn done(stop: &str) -> StreamEvent {
    StreamEvent::Done {
        stop_reason: stop.into(),
    }
}

#[tokio::test]
async fn plain_text_turn() {
    let harness = Harness::new();
    harness.seed_user(1, "1.0000").await;

    let provider = ScriptedProvider::new(vec![vec![
        input_usage(120),
        StreamEvent::TextDelta { text: "Hel".into() },
        StreamEvent::TextDelta { text: "lo!".into() },
        output_usage(8),
        done("end_turn"),
    ]]);
    let registry = ToolRegistry::builtin();
    let ctx = harness.tool_ctx(provider.clone(), 1);
    let mut tracker = CostTracker::new("claude-sonnet-4-5", 1);
    let mut sink = RecordingSink::default();
    let cancel = CancellationToken::new();

    let outcome = run_turn(
        provider.clone(),
        &registry,
        &harness.policy,
        &harness.metrics,
        &ctx,
        request(),
        &mut tracker,
        &mut sink,
        &cancel,
        true,
    )
    .await
    .unwrap();

    assert_eq!(outcome.text, "Hello!");
    assert_eq!(outcome.stop_reason, "end_turn");
    assert!(!outcome.cancelled);
    assert_eq!(outcome.iterations, 1);
    assert!(outcome.tool_executions.is_empty());
    assert_eq!(sink.text, "Hello!");
    // Usage accumulated for the charge.
    assert_eq!(tracker.usage().input, 120);
    assert_eq!(tracker.usage().output, 8);
    assert!(tracker.total_cost().unwrap() > Usd::ZERO);
}

#[tokio::test]
async fn parallel_tools_preserve_input_order() {
    let harness = Harness::new();
    harness.seed_user(1, "1.0000").await;

    let thinking_block = json!({
        "type": "thinking",
        "thinking": "I should call both tools.",
        "signature": "c2lnbmF0dXJl",
    });
    let provider = ScriptedProvider::new(vec![
        vec![
            input_usage(200),
            StreamEvent::ThinkingComplete {
                block: thinking_block.clone(),
            },
            StreamEvent::ToolUseStart {
                id: "tu_1".into(),
                name: "echo_slow".into(),
            },
            StreamEvent::ToolUse {
                id: "tu_1".into(),
                name: "echo_slow".into(),
                input: json!({}),
            },
            StreamEvent::ToolUseStart {
                id: "tu_2".into(),
                name: "echo_fast".into(),
            },
            StreamEvent::ToolUse {
                id: "tu_2".into(),
                name: "echo_fast".into(),
                input: json!({}),
            },
            output_usage(40),
            done("tool_use"),
        ],
        vec![
            input_usage(300),
            StreamEvent::TextDelta {
                text: "Both tools ran.".into(),
            },
            output_usage(12),
            done("end_turn"),
        ],
    ]);

    // The slow tool comes first in input order but finishes last.
    let registry = ToolRegistry::new(vec![
        Arc::new(EchoTool {
            descriptor: &ECHO_SLOW,
            delay_ms: 60,
        }),
        Arc::new(EchoTool {
            descriptor: &ECHO_FAST,
            delay_ms: 1,
        }),
    ]);
    let ctx = harness.tool_ctx(provider.clone(), 1);
    let mut tracker = CostTracker::new("claude-sonnet-4-5", 1);
    let mut sink = RecordingSink::default();
    let cancel = CancellationToken::new();

    let outcome = run_turn(
        provider.clone(),
        &registry,
        &harness.policy,
        &harness.metrics,
        &ctx,
        request(),
        &mut tracker,
        &mut sink,
        &cancel,
        true,
    )
    .await
    .unwrap();

    assert_eq!(outcome.text, "Both tools ran.");
    assert_eq!(outcome.iterations, 2);

    // Input order preserved despite the fast tool finishing first.
    let names: Vec<_> = outcome
        .tool_executions
        .iter()
        .map(|e| e.name.as_str())
        .collect();
    assert_eq!(names, vec!["echo_slow", "echo_fast"]);

    // Both tool costs tracked.
    assert_eq!(tracker.tool_cost_total(), Usd::from_str("0.0020").unwrap());

    // The continuation request carries the thinking block verbatim and the
    // tool results in input order.
    let continuation = provider.request(1);
    let assistant = &continuation.messages[1];
    assert_eq!(assistant["role"], "assistant");
    assert_eq!(assistant["content"][0], thinking_block);
    let results = &continuation.messages[2];
    assert_eq!(results["role"], "user");
    assert_eq!(results["content"][0]["tool_use_id"], "tu_1");
    assert_eq!(results["content"][1]["tool_use_id"], "tu_2");
    assert!(results["content"][0]["content"]
        .as_str()
        .unwrap()
        .contains("echo_slow"));

    // Markers surfaced during streaming.
    assert_eq!(sink.markers, vec!["[🐢 echo_slow]", "[🐇 echo_fast]"]);
}

#[tokio::test]
async fn paid_tool_rejected_on_negative_balance() {
    let harness = Harness::new();
    harness.seed_user(1, "-0.0100").await;

    let provider = ScriptedProvider::new(vec![
        vec![
            input_usage(100),
            StreamEvent::ToolUse {
                id: "tu_1".into(),
                name: "execute_python".into(),
                input: json!({"code": "print(1)"}),
            },
            output_usage(30),
            done("tool_use"),
        ],
        vec![
            input_usage(150),
            StreamEvent::TextDelta {
                text: "You need to top up first.".into(),
            },
            output_usage(10),
            done("end_turn"),
        ],
    ]);
    let registry = ToolRegistry::builtin();
    let ctx = harness.tool_ctx(provider.clone(), 1);
    let mut tracker = CostTracker::new("claude-sonnet-4-5", 1);
    let mut sink = RecordingSink::default();
    let cancel = CancellationToken::new();

    let outcome = run_turn(
        provider.clone(),
        &registry,
        &harness.policy,
        &harness.metrics,
        &ctx,
        request(),
        &mut tracker,
        &mut sink,
        &cancel,
        true,
    )
    .await
    .unwrap();

    // The sandbox was never invoked (none is configured; an invocation
    // would produce a different error), the pre-check rejected first.
    let execution = &outcome.tool_executions[0];
    let payload: Value = serde_json::from_str(&execution.outcome.content).unwrap();
    assert_eq!(payload["error"], "insufficient_balance");
    assert_eq!(payload["balance_usd"], "-0.0100");
    assert_eq!(payload["tool_name"], "execute_python");

    // Rejection metric incremented exactly once.
    assert_eq!(
        harness.metrics.tool_precheck_rejected_count("execute_python"),
        1
    );

    // No tool cost was charged.
    assert_eq!(tracker.tool_cost_total(), Usd::ZERO);
}

#[tokio::test]
async fn paid_tool_allowed_at_exactly_zero_balance() {
    let harness = Harness::new();
    harness.seed_user(1, "0.0000").await;
    assert!(harness.policy.can_use_paid_tool(1).await);
    // But a new request at exactly the minimum (0) is rejected.
    let check = harness.policy.can_make_request(1).await;
    assert!(!check.allowed);
}

#[tokio::test]
async fn cancellation_stops_stream_and_skips_tools() {
    let harness = Harness::new();
    harness.seed_user(1, "1.0000").await;

    // Twenty chunks; cancellation fires after the fifth. Input usage
    // arrives up front (message_start), output usage only at the end —
    // which the aborted stream never reaches.
    let mut events: Vec<StreamEvent> = vec![input_usage(100)];
    events.extend((0..20).map(|i| StreamEvent::TextDelta {
        text: format!("chunk{i} "),
    }));
    events.push(StreamEvent::ToolUse {
        id: "tu_1".into(),
        name: "execute_python".into(),
        input: json!({"code": "print(1)"}),
    });
    events.push(output_usage(50));
    events.push(done("tool_use"));

    let provider = ScriptedProvider::new(vec![events]);
    let registry = ToolRegistry::builtin();
    let ctx = harness.tool_ctx(provider.clone(), 1);
    let mut tracker = CostTracker::new("claude-sonnet-4-5", 1);
    let cancel = CancellationToken::new();
    let mut sink = RecordingSink {
        cancel_after_deltas: Some((5, cancel.clone())),
        ..Default::default()
    };

    let outcome = run_turn(
        provider.clone(),
        &registry,
        &harness.policy,
        &harness.metrics,
        &ctx,
        request(),
        &mut tracker,
        &mut sink,
        &cancel,
        true,
    )
    .await
    .unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.stop_reason, "cancelled");
    // The loop exits at the next event after cancellation: no more than
    // six chunks made it through, and the partial text is preserved.
    assert!(sink.deltas_seen <= 6, "saw {} deltas", sink.deltas_seen);
    assert!(outcome.text.starts_with("chunk0 "));
    // No tool was dispatched after cancellation.
    assert!(outcome.tool_executions.is_empty());
    assert_eq!(
        harness.metrics.tool_precheck_rejected_count("execute_python"),
        0
    );

    // The cancelled turn still bills: input usage from message_start was
    // captured, and the streamed chunks' output tokens are estimated
    // because the provider's output count never arrived.
    assert_eq!(tracker.usage().input, 100);
    assert!(
        tracker.usage().output > 0,
        "partial output should be estimated"
    );
    assert!(tracker.total_cost().unwrap() > Usd::ZERO);
}
