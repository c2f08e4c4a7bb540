//! Deadline-aware multi-lane orchestrator: owns the query lifetime

use crate::audit::AuditSink;
use crate::budget::{compute_budget, preflight_viable};
use crate::citation::{align_answer, AlignedAnswer, CitationConfig, EmbedCache};
use crate::classify::classify;
use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::fusion::{fuse, FusionConfig};
use crate::lane::{run_lane, Lane};
use crate::metrics::Metrics;
use crate::preflight::{run_preflight, QueryRefiner};
use crate::ranking::{rank, AuthorityTable};
use crate::ratelimit::RateLimiter;
use crate::retrievers::{Embedder, Synthesizer};
use crate::stream::{spawn_heartbeat, EventKind, EventSender, EventStream};
use crate::types::{
    AuditRecord, Budget, FusedDocument, LaneAudit, LaneId, LaneResult, LaneStatus, Query,
};
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MAX_QUERY_CHARS: usize = 8192;
const STRAGGLER_GRACE: Duration = Duration::from_millis(100);
const PROMPT_SOURCE_COUNT: usize = 6;

const UNCERTAINTY_DISCLOSURE: &str = "No sources could be retrieved for this query, so the \
following answer is unverified and should be treated with caution.";

/// Inbound search request before admission
#[derive(Debug, Clone, Default)]
pub struct SearchSubmission {
    pub text: String,
    pub constraints: Option<crate::types::Constraints>,
    pub trace_id: Option<String>,
    pub attachments: Vec<String>,
}

/// The engine. Owns the lane registry and every per-query lifetime.
pub struct Orchestrator {
    config: Arc<EngineConfig>,
    lanes: BTreeMap<LaneId, Arc<dyn Lane>>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    refiner: Option<Arc<dyn QueryRefiner>>,
    embedder: Option<Arc<dyn Embedder>>,
    authority: AuthorityTable,
    audit: Arc<dyn AuditSink>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    embed_cache: Arc<EmbedCache>,
    active: Mutex<HashMap<String, CancellationToken>>,
    // Self-handle so `submit` can hand the driver task an owning Arc.
    me: Weak<Orchestrator>,
}

pub type SharedOrchestrator = Arc<Orchestrator>;

/// Assembles an orchestrator from its pluggable collaborators
pub struct OrchestratorBuilder {
    config: EngineConfig,
    lanes: BTreeMap<LaneId, Arc<dyn Lane>>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    refiner: Option<Arc<dyn QueryRefiner>>,
    embedder: Option<Arc<dyn Embedder>>,
    authority: AuthorityTable,
    audit: Option<Arc<dyn AuditSink>>,
    metrics: Option<Arc<Metrics>>,
}

impl OrchestratorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            lanes: BTreeMap::new(),
            synthesizer: None,
            refiner: None,
            embedder: None,
            authority: AuthorityTable::default(),
            audit: None,
            metrics: None,
        }
    }

    pub fn lane(mut self, lane: Arc<dyn Lane>) -> Self {
        self.lanes.insert(lane.id(), lane);
        self
    }

    pub fn synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn refiner(mut self, refiner: Arc<dyn QueryRefiner>) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn authority(mut self, authority: AuthorityTable) -> Self {
        self.authority = authority;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> anyhow::Result<SharedOrchestrator> {
        let embed_cache = Arc::new(EmbedCache::new(
            self.config.embed_cache_capacity,
            Duration::from_secs(self.config.embed_cache_ttl_secs),
        ));
        let metrics = match self.metrics {
            Some(m) => m,
            None => Arc::new(Metrics::new()?),
        };
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(crate::audit::MemoryAuditStore::default()));
        Ok(Arc::new_cyclic(|me| Orchestrator {
            config: Arc::new(self.config),
            lanes: self.lanes,
            synthesizer: self.synthesizer,
            refiner: self.refiner,
            embedder: self.embedder,
            authority: self.authority,
            audit,
            limiter: Arc::new(RateLimiter::default()),
            metrics,
            embed_cache,
            active: Mutex::new(HashMap::new()),
            me: me.clone(),
        }))
    }
}

struct PipelineOutput {
    lane_audits: Vec<LaneAudit>,
    fused_doc_ids: Vec<String>,
    aligned: AlignedAnswer,
    partial: bool,
    cancelled: bool,
    degraded: bool,
}

impl Orchestrator {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn audit_sink(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub fn has_retrieval_lanes(&self) -> bool {
        self.lanes.keys().any(|id| *id != LaneId::Preflight)
    }

    /// Accept a query and return its finite event stream. Synchronous
    /// failures (bad input, duplicate trace) reject before any stream opens.
    pub async fn submit(
        &self,
        submission: SearchSubmission,
    ) -> Result<EventStream, PipelineError> {
        let text = submission.text.trim().to_string();
        if text.is_empty() {
            return Err(PipelineError::InputInvalid("empty query".to_string()));
        }
        if text.chars().count() > MAX_QUERY_CHARS {
            return Err(PipelineError::InputInvalid(format!(
                "query exceeds {} characters",
                MAX_QUERY_CHARS
            )));
        }

        let trace_id = submission
            .trace_id
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Duplicate submissions are rejected, keeping the audit sink
        // idempotent on trace id.
        {
            let active = self.active.lock().expect("active map poisoned");
            if active.contains_key(&trace_id) {
                return Err(PipelineError::InputInvalid(format!(
                    "trace_id {} is already in flight",
                    trace_id
                )));
            }
        }
        if self.audit.seen(&trace_id).await {
            return Err(PipelineError::InputInvalid(format!(
                "trace_id {} was already answered",
                trace_id
            )));
        }

        let constraints = submission.constraints.unwrap_or_default();
        let mode = classify(&text, &submission.attachments);
        let budget = compute_budget(mode, &constraints, &self.config);
        let query = Query {
            id: uuid::Uuid::new_v4(),
            text,
            mode,
            constraints,
            trace_id: trace_id.clone(),
            submitted_at: Utc::now(),
        };

        info!(
            trace_id = %trace_id,
            mode = %mode,
            deadline_ms = budget.global_deadline_ms,
            "query admitted"
        );

        let (sender, stream) = EventSender::channel(trace_id.clone());
        let cancel = CancellationToken::new();
        self.active.lock().expect("active map poisoned").insert(trace_id, cancel.clone());

        let this = self.me.upgrade().expect("orchestrator still alive while borrowed");
        tokio::spawn(async move {
            this.drive(query, budget, sender, cancel).await;
        });

        Ok(stream)
    }

    /// Cancel a running query; lanes observe the signal within 200 ms
    pub fn cancel(&self, trace_id: &str) {
        if let Some(token) = self.active.lock().expect("active map poisoned").get(trace_id) {
            token.cancel();
        }
    }

    async fn drive(
        self: Arc<Self>,
        query: Query,
        budget: Budget,
        sender: EventSender,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let heartbeat = spawn_heartbeat(
            sender.clone(),
            Duration::from_millis(self.config.heartbeat_interval_ms),
            cancel.clone(),
        );

        let outcome = AssertUnwindSafe(self.run_pipeline(&query, &budget, &sender, &cancel, started))
            .catch_unwind()
            .await;

        let total_latency_ms = started.elapsed().as_millis() as u64;
        let ttft_ms = sender.ttft_ms();

        let output = match outcome {
            Ok(output) => output,
            Err(panic) => {
                error!(trace_id = %query.trace_id, "pipeline panicked: {:?}", panic);
                sender
                    .send(EventKind::Error, json!({"kind": "internal_error"}))
                    .await;
                PipelineOutput {
                    lane_audits: Vec::new(),
                    fused_doc_ids: Vec::new(),
                    aligned: AlignedAnswer::default(),
                    partial: true,
                    cancelled: false,
                    degraded: false,
                }
            }
        };

        let answered_under_sla = total_latency_ms <= budget.global_deadline_ms && !output.cancelled;
        let lanes_json: Vec<serde_json::Value> = output
            .lane_audits
            .iter()
            .map(|l| {
                json!({
                    "lane": l.lane_id,
                    "status": l.status,
                    "latency_ms": l.latency_ms,
                    "documents": l.documents,
                })
            })
            .collect();

        // Stop the heartbeat first so nothing can follow the final event.
        cancel.cancel();
        heartbeat.abort();

        // Exactly one final event, always last.
        sender
            .send(
                EventKind::Final,
                json!({
                    "total_latency_ms": total_latency_ms,
                    "partial": output.partial,
                    "answered_under_sla": answered_under_sla,
                    "ttft_ms": ttft_ms,
                    "lanes": lanes_json,
                    "bibliography": &output.aligned.bibliography,
                    "sentences": output.aligned.sentences.len(),
                    "disagreements": output.aligned.disagreements.len(),
                }),
            )
            .await;

        self.active.lock().expect("active map poisoned").remove(&query.trace_id);

        let outcome_label = if output.cancelled {
            "cancelled"
        } else if output.degraded {
            "degraded"
        } else if output.partial {
            "partial"
        } else {
            "ok"
        };
        self.metrics.observe_query(query.mode, outcome_label, total_latency_ms, ttft_ms);

        let record = AuditRecord {
            trace_id: query.trace_id.clone(),
            query: query.text.clone(),
            mode: query.mode,
            budget,
            per_lane_results: output.lane_audits,
            fused_doc_ids: output.fused_doc_ids,
            answer_sentences: output.aligned.sentences,
            citations: output.aligned.citations,
            bibliography: output.aligned.bibliography,
            disagreements: output.aligned.disagreements,
            total_latency_ms,
            answered_under_sla,
            ttft_ms,
            partial: output.partial,
            cancelled: output.cancelled,
            completed_at: Utc::now(),
        };
        if let Err(e) = self.audit.write(record).await {
            warn!(trace_id = %query.trace_id, "audit write failed: {}", e);
        }
    }

    async fn run_pipeline(
        &self,
        query: &Query,
        budget: &Budget,
        sender: &EventSender,
        cancel: &CancellationToken,
        started: Instant,
    ) -> PipelineOutput {
        let mut output = PipelineOutput {
            lane_audits: Vec::new(),
            fused_doc_ids: Vec::new(),
            aligned: AlignedAnswer::default(),
            partial: false,
            cancelled: false,
            degraded: false,
        };

        // Pre-flight refinement: bypassed when short lanes would starve.
        let mut effective = query.clone();
        if let Some(refiner) = &self.refiner {
            if preflight_viable(budget, self.config.preflight_budget_ms) {
                if let Some(refinement) = run_preflight(
                    refiner.as_ref(),
                    &query.text,
                    &query.constraints,
                    self.config.preflight_budget_ms,
                    cancel,
                )
                .await
                {
                    effective.constraints.merge_from(&refinement.constraints);
                    if let Some(rewritten) = refinement.rewritten_query {
                        effective.text = rewritten;
                    }
                }
            }
        }

        // Retrieval window ends where synthesis must begin.
        let global_deadline =
            started + Duration::from_millis(budget.global_deadline_ms);
        let cutover = started
            + Duration::from_millis(
                budget
                    .global_deadline_ms
                    .saturating_sub(budget.reserve_ms + budget.synthesis_ms),
            );

        let ttft_backstop = started
            + Duration::from_millis(self.config.ttft_target_ms.saturating_sub(200).max(100));
        let lane_results = self
            .run_lanes(&effective, budget, sender, cancel, cutover, ttft_backstop, &mut output)
            .await;

        output.lane_audits = lane_results
            .iter()
            .map(|r| LaneAudit {
                lane_id: r.lane_id,
                status: r.status,
                latency_ms: r.latency_ms,
                documents: r.documents.len(),
                error: r.error,
            })
            .collect();

        if output.cancelled {
            return output;
        }

        // Fuse, rank, cut to top-N.
        let fusion_config = FusionConfig::from_engine(&self.config);
        let fused = fuse(&lane_results, &self.authority, &fusion_config, Utc::now());
        let corpus = rank(fused, effective.constraints.result_cap());
        output.fused_doc_ids =
            corpus.iter().map(|f| f.document.content_hash.clone()).collect();

        if corpus.is_empty() {
            output.degraded = true;
            sender
                .send(
                    EventKind::Degraded,
                    json!({
                        "reason": "no retrieval output",
                        "detail": "all retrieval lanes failed, timed out, or returned nothing",
                    }),
                )
                .await;
        }

        // Synthesis, streaming tokens as they arrive.
        let answer = self
            .synthesize(&effective, &corpus, budget, sender, cancel, global_deadline, &mut output)
            .await;

        if output.cancelled {
            return output;
        }

        // Citation alignment inside the reserve window.
        let citation_config = CitationConfig {
            sim_threshold: self.config.citation_sim_threshold,
            top_k: self.config.citation_top_k,
        };
        let align_window = global_deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(10));
        let aligned = match tokio::time::timeout(
            align_window,
            align_answer(
                &answer,
                &corpus,
                self.embedder.as_deref(),
                &self.embed_cache,
                &citation_config,
            ),
        )
        .await
        {
            Ok(aligned) => aligned,
            Err(_) => {
                warn!(trace_id = %query.trace_id, "citation alignment hit the global deadline");
                output.partial = true;
                AlignedAnswer::default()
            }
        };

        for citation in &aligned.citations {
            let delivered = sender
                .send(
                    EventKind::Citation,
                    json!({
                        "marker": citation.marker_id,
                        "url": &citation.document_ref.url,
                        "domain": &citation.document_ref.domain,
                        "title": &citation.document_ref.title,
                        "similarity": citation.similarity,
                    }),
                )
                .await;
            if !delivered {
                output.cancelled = true;
                output.partial = true;
                return output;
            }
        }
        for disagreement in &aligned.disagreements {
            sender
                .send(
                    EventKind::Disagreement,
                    json!({
                        "topic": &disagreement.topic,
                        "markers": &disagreement.conflicting_citations,
                        "severity": disagreement.severity,
                    }),
                )
                .await;
        }

        output.aligned = aligned;
        output
    }

    /// Launch all enabled lanes concurrently and gather results until the
    /// cut-over. Stragglers get a short grace, then are recorded as timeouts.
    #[allow(clippy::too_many_arguments)]
    async fn run_lanes(
        &self,
        query: &Query,
        budget: &Budget,
        sender: &EventSender,
        cancel: &CancellationToken,
        cutover: Instant,
        ttft_backstop: Instant,
        output: &mut PipelineOutput,
    ) -> Vec<LaneResult> {
        let mut results: Vec<LaneResult> = Vec::new();
        let result_cap = query.constraints.result_cap();
        let lane_cancel = cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<LaneResult>(LaneId::RETRIEVAL.len());

        let mut launched: HashSet<LaneId> = HashSet::new();
        for lane_id in LaneId::RETRIEVAL {
            let Some(lane) = self.lanes.get(&lane_id) else {
                // No backend plugged in for this lane.
                results.push(LaneResult::disabled(lane_id));
                continue;
            };
            let Some(&lane_budget) = budget.per_lane.get(&lane_id) else {
                results.push(LaneResult::disabled(lane_id));
                continue;
            };

            let remaining = cutover.saturating_duration_since(Instant::now()).as_millis() as u64;
            let effective_ms = lane_budget.min(remaining.max(1));
            launched.insert(lane_id);

            let lane = Arc::clone(lane);
            let query = Arc::new(query.clone());
            let limiter = Arc::clone(&self.limiter);
            let token = lane_cancel.child_token();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result =
                    run_lane(lane, query, effective_ms, result_cap, limiter, token).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        if launched.is_empty() {
            return results;
        }

        // A backstop event keeps TTFT honest even when every lane is slow.
        let mut backstop_armed = true;
        let mut first_reported = false;
        let mut pending = launched.len();

        while pending > 0 {
            tokio::select! {
                _ = sender.closed() => {
                    // Client is gone: cancel lanes and stop.
                    lane_cancel.cancel();
                    output.cancelled = true;
                    output.partial = true;
                    break;
                }
                _ = cancel.cancelled() => {
                    lane_cancel.cancel();
                    output.cancelled = true;
                    output.partial = true;
                    break;
                }
                _ = tokio::time::sleep_until(ttft_backstop), if backstop_armed => {
                    backstop_armed = false;
                    if sender.events_sent() == 0 {
                        sender
                            .send(EventKind::Heartbeat, json!({"phase": "retrieval"}))
                            .await;
                    }
                }
                _ = tokio::time::sleep_until(cutover) => {
                    lane_cancel.cancel();
                    break;
                }
                received = rx.recv() => match received {
                    Some(result) => {
                        pending -= 1;
                        self.metrics.observe_lane(&result);
                        if !first_reported {
                            first_reported = true;
                            sender
                                .send(
                                    EventKind::Info,
                                    json!({
                                        "first_lane": result.lane_id,
                                        "status": result.status,
                                        "documents": result.documents.len(),
                                    }),
                                )
                                .await;
                        }
                        results.push(result);
                    }
                    None => break,
                },
            }
        }

        // Drain stragglers briefly after a cut-over or cancellation.
        if pending > 0 {
            let grace_deadline = Instant::now() + STRAGGLER_GRACE;
            while pending > 0 {
                let window = grace_deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(window, rx.recv()).await {
                    Ok(Some(result)) => {
                        pending -= 1;
                        self.metrics.observe_lane(&result);
                        results.push(result);
                    }
                    _ => break,
                }
            }
        }

        // Anything still missing is recorded as a timeout.
        let seen: HashSet<LaneId> = results.iter().map(|r| r.lane_id).collect();
        for lane_id in launched {
            if !seen.contains(&lane_id) {
                results.push(LaneResult {
                    lane_id,
                    status: LaneStatus::Timeout,
                    documents: Vec::new(),
                    latency_ms: budget.lane_ms(lane_id),
                    error: Some(crate::types::LaneErrorKind::Timeout),
                });
            }
        }

        results
    }

    /// Stream the answer: LLM synthesis with a rule-based fallback.
    /// Returns the full answer text for citation alignment.
    async fn synthesize(
        &self,
        query: &Query,
        corpus: &[FusedDocument],
        budget: &Budget,
        sender: &EventSender,
        cancel: &CancellationToken,
        global_deadline: Instant,
        output: &mut PipelineOutput,
    ) -> String {
        if corpus.is_empty() {
            let answer = format!("{} Please retry, or rephrase the query.", UNCERTAINTY_DISCLOSURE);
            self.stream_text(&answer, sender, output).await;
            return answer;
        }

        let window_ms = budget.synthesis_ms.min(
            global_deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u64,
        );
        let synth_deadline = Instant::now() + Duration::from_millis(window_ms);

        let stream = match &self.synthesizer {
            None => None,
            Some(synthesizer) => {
                match synthesizer.generate(&build_prompt(&query.text, corpus), window_ms).await {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        warn!(trace_id = %query.trace_id, "synthesis failed: {}", e);
                        None
                    }
                }
            }
        };

        let Some(mut stream) = stream else {
            // Fallback: concatenate the top-ranked snippets.
            sender
                .send(
                    EventKind::Info,
                    json!({"kind": "synthesis_failed", "fallback": "snippet_concatenation"}),
                )
                .await;
            let answer = fallback_answer(corpus);
            self.stream_text(&answer, sender, output).await;
            return answer;
        };

        let mut answer = String::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    output.cancelled = true;
                    output.partial = true;
                    break;
                }
                _ = tokio::time::sleep_until(synth_deadline) => {
                    output.partial = true;
                    break;
                }
                token = stream.next() => match token {
                    Some(Ok(text)) => {
                        answer.push_str(&text);
                        if !sender.send(EventKind::Token, json!({"text": text})).await {
                            output.cancelled = true;
                            output.partial = true;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(trace_id = %query.trace_id, "synthesis stream broke: {}", e);
                        if answer.is_empty() {
                            sender
                                .send(
                                    EventKind::Info,
                                    json!({"kind": "synthesis_failed", "fallback": "snippet_concatenation"}),
                                )
                                .await;
                            let fallback = fallback_answer(corpus);
                            self.stream_text(&fallback, sender, output).await;
                            return fallback;
                        }
                        output.partial = true;
                        break;
                    }
                    None => break,
                },
            }
        }
        answer
    }

    /// Stream pre-built text sentence by sentence as token events
    async fn stream_text(&self, text: &str, sender: &EventSender, output: &mut PipelineOutput) {
        for sentence in crate::citation::split_sentences(text) {
            let chunk = format!("{} ", sentence);
            if !sender.send(EventKind::Token, json!({"text": chunk})).await {
                output.cancelled = true;
                output.partial = true;
                return;
            }
        }
    }
}

fn build_prompt(question: &str, corpus: &[FusedDocument]) -> String {
    let mut prompt = String::from(
        "Answer the question using only the numbered sources. Be concise and factual.\n\n",
    );
    prompt.push_str(&format!("Question: {}\n\nSources:\n", question));
    for (i, fused) in corpus.iter().take(PROMPT_SOURCE_COUNT).enumerate() {
        let doc = &fused.document;
        prompt.push_str(&format!("[{}] {} ({}): {}\n", i + 1, doc.title, doc.domain, doc.snippet));
    }
    prompt
}

/// Rule-based answer used when the LLM is unavailable
fn fallback_answer(corpus: &[FusedDocument]) -> String {
    let mut parts = Vec::new();
    for fused in corpus.iter().take(3) {
        let doc = &fused.document;
        let snippet = if doc.snippet.is_empty() {
            doc.content.chars().take(200).collect::<String>()
        } else {
            doc.snippet.clone()
        };
        parts.push(format!("According to {} ({}): {}", doc.title, doc.domain, snippet));
    }
    parts.join(" ")
}
