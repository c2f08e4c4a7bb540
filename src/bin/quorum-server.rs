//! Quorum HTTP server and one-shot CLI binary

use futures::future::FutureExt;
use quorum::orchestrator::{OrchestratorBuilder, SearchSubmission, SharedOrchestrator};
use quorum::retrievers::{make_document, Retriever};
use quorum::server::{AppState, HealthProbe};
use quorum::stream::EventKind;
use quorum::{
    EngineConfig, GraphLane, HeuristicRefiner, HttpEmbedder, HttpGraphStore, HttpRetriever,
    HttpSynthesizer, HttpVectorStore, LaneId, MockEmbedder, MockGraphStore, MockRetriever,
    MockSynthesizer, MockVectorStore, PipelineError, QueryStyle, RetrieverLane, VectorLane,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("quorum=info".parse().unwrap()))
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let use_real = args.iter().any(|a| a == "--use-real");
    let one_shot = arg_value(&args, "--query");
    let port: u16 = arg_value(&args, "--port")
        .or_else(|| std::env::var("PORT").ok())
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    let (orchestrator, probes) = match build_engine(config, use_real) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("startup failed: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    if use_real {
        report_backend_health(&probes).await;
    }

    if let Some(query) = one_shot {
        let code = run_one_shot(&orchestrator, &query).await;
        std::process::exit(code);
    }

    let state = Arc::new(AppState { orchestrator, probes });
    if let Err(e) = quorum::server::run_server(state, port).await {
        eprintln!("server error: {}", e);
        std::process::exit(1);
    }
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).cloned()
}

type BuiltEngine = (SharedOrchestrator, Vec<HealthProbe>);

fn build_engine(config: EngineConfig, use_real: bool) -> Result<BuiltEngine, PipelineError> {
    if use_real {
        build_real_engine(config)
    } else {
        build_mock_engine(config)
    }
}

/// Wire HTTP clients from environment URLs. At least one retrieval
/// backend must be configured.
fn build_real_engine(config: EngineConfig) -> Result<BuiltEngine, PipelineError> {
    let mut builder = OrchestratorBuilder::new(config).refiner(Arc::new(HeuristicRefiner));
    let mut probes: Vec<HealthProbe> = Vec::new();
    let mut any_retrieval = false;

    let flat_lanes = [
        (LaneId::Web, "WEB_SEARCH_URL", QueryStyle::PostJson),
        (LaneId::News, "NEWS_SEARCH_URL", QueryStyle::PostJson),
        (LaneId::Markets, "MARKETS_SEARCH_URL", QueryStyle::PostJson),
        (LaneId::Keyword, "KEYWORD_INDEX_URL", QueryStyle::GetQuery),
    ];
    for (lane_id, env_key, style) in flat_lanes {
        if let Ok(url) = std::env::var(env_key) {
            let retriever: Arc<dyn Retriever> =
                Arc::new(HttpRetriever::new(lane_id.as_str(), url, style));
            probes.push(retriever_probe(lane_id.as_str(), Arc::clone(&retriever)));
            builder = builder.lane(Arc::new(RetrieverLane::new(lane_id, retriever)));
            any_retrieval = true;
        }
    }

    if let (Ok(vector_url), Ok(embed_url)) =
        (std::env::var("VECTOR_STORE_URL"), std::env::var("EMBEDDER_URL"))
    {
        let store = Arc::new(HttpVectorStore::new(vector_url));
        let embedder = Arc::new(HttpEmbedder::new(embed_url));
        let probe_store = Arc::clone(&store);
        probes.push(HealthProbe {
            name: "vector".to_string(),
            check: Box::new(move || {
                let store = Arc::clone(&probe_store);
                async move { quorum::VectorStore::healthy(store.as_ref()).await }.boxed()
            }),
        });
        builder = builder
            .lane(Arc::new(VectorLane::new(embedder.clone(), store)))
            .embedder(embedder);
        any_retrieval = true;
    }

    if let Ok(url) = std::env::var("GRAPH_STORE_URL") {
        let store = Arc::new(HttpGraphStore::new(url));
        let probe_store = Arc::clone(&store);
        probes.push(HealthProbe {
            name: "knowledge_graph".to_string(),
            check: Box::new(move || {
                let store = Arc::clone(&probe_store);
                async move { quorum::GraphStore::healthy(store.as_ref()).await }.boxed()
            }),
        });
        builder = builder.lane(Arc::new(GraphLane::new(store)));
        any_retrieval = true;
    }

    if let Ok(url) = std::env::var("LLM_SERVICE_URL") {
        let synthesizer = Arc::new(HttpSynthesizer::new(url));
        let probe_synth = Arc::clone(&synthesizer);
        probes.push(HealthProbe {
            name: "llm".to_string(),
            check: Box::new(move || {
                let synth = Arc::clone(&probe_synth);
                async move { quorum::Synthesizer::healthy(synth.as_ref()).await }.boxed()
            }),
        });
        builder = builder.synthesizer(synthesizer);
    }

    if !any_retrieval {
        return Err(PipelineError::BackendUnavailable);
    }

    let orchestrator =
        builder.build().map_err(|e| PipelineError::Internal(e.to_string()))?;
    Ok((orchestrator, probes))
}

/// In-process mocks, useful for demos and smoke tests
fn build_mock_engine(config: EngineConfig) -> Result<BuiltEngine, PipelineError> {
    println!("mode: MOCK backends (use --use-real with *_URL env vars for real services)");

    let corpus = mock_corpus();
    let embedder = Arc::new(MockEmbedder::default());
    let mut graph_entities = HashMap::new();
    graph_entities.insert("france".to_string(), vec![corpus[0].clone()]);
    graph_entities.insert("paris".to_string(), vec![corpus[0].clone(), corpus[1].clone()]);

    let synthesizer = Arc::new(
        MockSynthesizer::new(
            "The capital of France is Paris. Paris has been the seat of the French \
             government for centuries and is the country's largest city.",
        )
        .with_token_delay(std::time::Duration::from_millis(5)),
    );

    let orchestrator = OrchestratorBuilder::new(config)
        .lane(Arc::new(RetrieverLane::new(
            LaneId::Web,
            Arc::new(MockRetriever::new("web", corpus.clone())),
        )))
        .lane(Arc::new(RetrieverLane::new(
            LaneId::Keyword,
            Arc::new(MockRetriever::new("keyword", corpus[..2].to_vec())),
        )))
        .lane(Arc::new(RetrieverLane::new(
            LaneId::News,
            Arc::new(MockRetriever::new("news", corpus[3..].to_vec())),
        )))
        .lane(Arc::new(VectorLane::new(
            embedder.clone(),
            Arc::new(MockVectorStore::new(corpus[..3].to_vec())),
        )))
        .lane(Arc::new(GraphLane::new(Arc::new(MockGraphStore::new(graph_entities)))))
        .embedder(embedder)
        .synthesizer(synthesizer)
        .refiner(Arc::new(HeuristicRefiner))
        .build()
        .map_err(|e| PipelineError::Internal(e.to_string()))?;

    Ok((orchestrator, Vec::new()))
}

fn retriever_probe(name: &str, retriever: Arc<dyn Retriever>) -> HealthProbe {
    HealthProbe {
        name: name.to_string(),
        check: Box::new(move || {
            let retriever = Arc::clone(&retriever);
            async move { retriever.healthy().await }.boxed()
        }),
    }
}

async fn report_backend_health(probes: &[HealthProbe]) {
    for probe in probes {
        let healthy = (probe.check)().await;
        if healthy {
            println!("backend {} is healthy", probe.name);
        } else {
            eprintln!("warning: backend {} is unreachable", probe.name);
        }
    }
}

/// Run a single query end to end and print the streamed answer
async fn run_one_shot(orchestrator: &SharedOrchestrator, query: &str) -> i32 {
    let submission = SearchSubmission { text: query.to_string(), ..Default::default() };
    let mut stream = match orchestrator.submit(submission).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("error: {}", e);
            return e.exit_code();
        }
    };

    let mut saw_token = false;
    let mut saw_error = false;
    let mut deadline_partial = false;

    while let Some(event) = stream.next().await {
        match event.event {
            EventKind::Token => {
                saw_token = true;
                if let Some(text) = event.data.get("text").and_then(|t| t.as_str()) {
                    print!("{}", text);
                }
            }
            EventKind::Degraded => {
                eprintln!("[degraded] {}", event.data.get("reason").and_then(|r| r.as_str()).unwrap_or(""));
            }
            EventKind::Disagreement => {
                eprintln!(
                    "\n[disagreement] markers {:?} ({})",
                    event.data.get("markers"),
                    event.data.get("severity").and_then(|s| s.as_str()).unwrap_or("?")
                );
            }
            EventKind::Error => {
                saw_error = true;
            }
            EventKind::Final => {
                println!();
                if let Some(bib) = event.data.get("bibliography").and_then(|b| b.as_array()) {
                    for entry in bib {
                        println!(
                            "[{}] {} - {}",
                            entry.get("marker_id").and_then(|m| m.as_u64()).unwrap_or(0),
                            entry.get("title").and_then(|t| t.as_str()).unwrap_or(""),
                            entry.get("url").and_then(|u| u.as_str()).unwrap_or(""),
                        );
                    }
                }
                deadline_partial = event
                    .data
                    .get("partial")
                    .and_then(|p| p.as_bool())
                    .unwrap_or(false);
            }
            _ => {}
        }
    }

    if saw_error {
        1
    } else if deadline_partial && !saw_token {
        PipelineError::GlobalDeadline.exit_code()
    } else {
        0
    }
}

/// Small canned corpus for mock mode
fn mock_corpus() -> Vec<quorum::Document> {
    let mut docs = vec![
        make_document(
            "https://www.wikipedia.org/wiki/Paris",
            "Paris",
            "Paris is the capital and most populous city of France. The city has been \
             one of Europe's major centres of finance, diplomacy, commerce, culture, \
             and science since the 17th century.",
            "Paris is the capital and most populous city of France.",
            0.98,
        ),
        make_document(
            "https://www.britannica.com/place/Paris",
            "Paris | Definition, Map, Population, Facts",
            "Paris, city and capital of France, situated in the north-central part of \
             the country. The modern city has spread from the island Ile de la Cite and \
             both banks of the Seine.",
            "Paris, city and capital of France.",
            0.94,
        ),
        make_document(
            "https://www.wikipedia.org/wiki/France",
            "France",
            "France, officially the French Republic, is a country located primarily in \
             Western Europe. Its capital is Paris, the country's largest city and main \
             cultural and commercial centre.",
            "France is a country in Western Europe; its capital is Paris.",
            0.91,
        ),
        make_document(
            "https://www.reuters.com/world/europe/paris-hosts-summit",
            "Paris hosts European summit",
            "European leaders gathered in Paris, the French capital, for a two-day \
             summit on energy policy. The meetings were held near the Seine.",
            "European leaders gathered in Paris, the French capital.",
            0.72,
        ),
        make_document(
            "https://www.lemonde.fr/en/france/capital-region",
            "Ile-de-France: the capital region",
            "The Ile-de-France region surrounds Paris, the capital of France, and is \
             the most populous of the regions.",
            "The Ile-de-France region surrounds Paris, the capital of France.",
            0.66,
        ),
    ];
    for doc in docs.iter_mut() {
        doc.published_at = Some(chrono::Utc::now() - chrono::Duration::days(10));
    }
    docs
}
