use crate::utils::Context;

use hiro_system_kit::slog;
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server,
};
use prometheus::{
    self,
    core::{AtomicU64, GenericGauge},
    Encoder, IntGauge, Registry, TextEncoder,
};
use std::time::{SystemTime, UNIX_EPOCH};

type UInt64Gauge = GenericGauge<AtomicU64>;

#[derive(Debug, Clone)]
pub struct PrometheusMonitoring {
    pub stx_highest_block_ingested: UInt64Gauge,
    pub stx_last_reorg_timestamp: IntGauge,
    pub stx_last_reorg_applied_blocks: UInt64Gauge,
    pub stx_last_reorg_rolled_back_blocks: UInt64Gauge,
    pub stx_last_block_ingestion_time: UInt64Gauge,
    pub stx_registered_predicates: UInt64Gauge,
    pub stx_deregistered_predicates: UInt64Gauge,
    pub btc_highest_block_ingested: UInt64Gauge,
    pub btc_last_reorg_timestamp: IntGauge,
    pub btc_last_reorg_applied_blocks: UInt64Gauge,
    pub btc_last_reorg_rolled_back_blocks: UInt64Gauge,
    pub btc_last_block_ingestion_time: UInt64Gauge,
    pub btc_registered_predicates: UInt64Gauge,
    pub btc_deregistered_predicates: UInt64Gauge,
    pub registry: Registry,
}

impl PrometheusMonitoring {
    pub fn new() -> PrometheusMonitoring {
        let registry = Registry::new();
        let stx_highest_block_ingested = Self::create_and_register_uint64_gauge(
            &registry,
            "stx_highest_block_ingested",
            "The highest Stacks block ingested.",
        );
        let stx_last_reorg_timestamp = Self::create_and_register_int_gauge(
            &registry,
            "stx_last_reorg_timestamp",
            "The timestamp of the latest Stacks reorg ingested.",
        );
        let stx_last_reorg_applied_blocks = Self::create_and_register_uint64_gauge(
            &registry,
            "stx_last_reorg_applied_blocks",
            "The number of blocks applied as part of the latest Stacks reorg.",
        );
        let stx_last_reorg_rolled_back_blocks = Self::create_and_register_uint64_gauge(
            &registry,
            "stx_last_reorg_rolled_back_blocks",
            "The number of blocks rolled back as part of the latest Stacks reorg.",
        );
        let stx_last_block_ingestion_time = Self::create_and_register_uint64_gauge(
            &registry,
            "stx_last_block_ingestion_time",
            "The time of the most recent Stacks block ingestion.",
        );
        let stx_registered_predicates = Self::create_and_register_uint64_gauge(
            &registry,
            "stx_registered_predicates",
            "The number of Stacks predicates registered.",
        );
        let stx_deregistered_predicates = Self::create_and_register_uint64_gauge(
            &registry,
            "stx_deregistered_predicates",
            "The number of Stacks predicates deregistered.",
        );
        let btc_highest_block_ingested = Self::create_and_register_uint64_gauge(
            &registry,
            "btc_highest_block_ingested",
            "The highest Bitcoin block ingested.",
        );
        let btc_last_reorg_timestamp = Self::create_and_register_int_gauge(
            &registry,
            "btc_last_reorg_timestamp",
            "The timestamp of the latest Bitcoin reorg ingested.",
        );
        let btc_last_reorg_applied_blocks = Self::create_and_register_uint64_gauge(
            &registry,
            "btc_last_reorg_applied_blocks",
            "The number of blocks applied as part of the latest Bitcoin reorg.",
        );
        let btc_last_reorg_rolled_back_blocks = Self::create_and_register_uint64_gauge(
            &registry,
            "btc_last_reorg_rolled_back_blocks",
            "The number of blocks rolled back as part of the latest Bitcoin reorg.",
        );
        let btc_last_block_ingestion_time = Self::create_and_register_uint64_gauge(
            &registry,
            "btc_last_block_ingestion_time",
            "The time of the most recent Bitcoin block ingestion.",
        );
        let btc_registered_predicates = Self::create_and_register_uint64_gauge(
            &registry,
            "btc_registered_predicates",
            "The number of Bitcoin predicates registered.",
        );
        let btc_deregistered_predicates = Self::create_and_register_uint64_gauge(
            &registry,
            "btc_deregistered_predicates",
            "The number of Bitcoin predicates deregistered.",
        );

        PrometheusMonitoring {
            stx_highest_block_ingested,
            stx_last_reorg_timestamp,
            stx_last_reorg_applied_blocks,
            stx_last_reorg_rolled_back_blocks,
            stx_last_block_ingestion_time,
            stx_registered_predicates,
            stx_deregistered_predicates,
            btc_highest_block_ingested,
            btc_last_reorg_timestamp,
            btc_last_reorg_applied_blocks,
            btc_last_reorg_rolled_back_blocks,
            btc_last_block_ingestion_time,
            btc_registered_predicates,
            btc_deregistered_predicates,
            registry,
        }
    }

    pub fn create_and_register_uint64_gauge(
        registry: &Registry,
        name: &str,
        help: &str,
    ) -> UInt64Gauge {
        let g = UInt64Gauge::new(name, help).unwrap();
        registry.register(Box::new(g.clone())).unwrap();
        g
    }

    pub fn create_and_register_int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
        let g = IntGauge::new(name, help).unwrap();
        registry.register(Box::new(g.clone())).unwrap();
        g
    }

    pub fn initialize(
        &self,
        stx_predicates: u64,
        btc_predicates: u64,
        stx_block_ingested: Option<u64>,
    ) {
        self.stx_registered_predicates.set(stx_predicates);
        self.btc_registered_predicates.set(btc_predicates);
        if let Some(block) = stx_block_ingested {
            self.stx_highest_block_ingested.set(block);
        }
    }

    pub fn stx_metrics_deregister_predicate(&self) {
        self.stx_registered_predicates.dec();
        self.stx_deregistered_predicates.inc();
    }

    pub fn stx_metrics_register_predicate(&self) {
        self.stx_registered_predicates.inc();
    }

    pub fn stx_metrics_ingest_block(&self, new_block_height: u64) {
        if new_block_height > self.stx_highest_block_ingested.get() {
            self.stx_highest_block_ingested.set(new_block_height);
        }
        self.stx_last_block_ingestion_time.set(get_current_time_ms());
    }

    pub fn stx_metrics_ingest_reorg(&self, timestamp: i64, applied: u64, rolled_back: u64) {
        self.stx_last_reorg_timestamp.set(timestamp);
        self.stx_last_reorg_applied_blocks.set(applied);
        self.stx_last_reorg_rolled_back_blocks.set(rolled_back);
    }

    pub fn btc_metrics_deregister_predicate(&self) {
        self.btc_registered_predicates.dec();
        self.btc_deregistered_predicates.inc();
    }

    pub fn btc_metrics_register_predicate(&self) {
        self.btc_registered_predicates.inc();
    }

    pub fn btc_metrics_ingest_block(&self, new_block_height: u64) {
        if new_block_height > self.btc_highest_block_ingested.get() {
            self.btc_highest_block_ingested.set(new_block_height);
        }
        self.btc_last_block_ingestion_time.set(get_current_time_ms());
    }

    pub fn btc_metrics_ingest_reorg(&self, timestamp: i64, applied: u64, rolled_back: u64) {
        self.btc_last_reorg_timestamp.set(timestamp);
        self.btc_last_reorg_applied_blocks.set(applied);
        self.btc_last_reorg_rolled_back_blocks.set(rolled_back);
    }
}

impl Default for PrometheusMonitoring {
    fn default() -> Self {
        Self::new()
    }
}

fn get_current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn serve_req(
    req: Request<Body>,
    registry: Registry,
    ctx: Context,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            ctx.try_log(|logger| slog::debug!(logger, "Prometheus monitoring: handling request"));

            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = vec![];
            let response = match encoder.encode(&metric_families, &mut buffer) {
                Ok(_) => Response::builder()
                    .status(200)
                    .header(CONTENT_TYPE, encoder.format_type())
                    .body(Body::from(buffer))
                    .unwrap(),
                Err(e) => {
                    ctx.try_log(|logger| {
                        slog::error!(logger, "unable to encode metrics: {}", e)
                    });
                    Response::builder()
                        .status(500)
                        .body(Body::from("unable to encode metrics"))
                        .unwrap()
                }
            };
            Ok(response)
        }
        (_, _) => {
            let response = Response::builder()
                .status(404)
                .body(Body::empty())
                .unwrap();
            Ok(response)
        }
    }
}

pub async fn start_serving_prometheus_metrics(port: u16, registry: Registry, ctx: Context) {
    let addr = ([0, 0, 0, 0], port).into();
    let ctx_clone = ctx.clone();
    let make_svc = make_service_fn(|_| {
        let registry = registry.clone();
        let ctx_clone = ctx_clone.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |r| {
                serve_req(r, registry.clone(), ctx_clone.clone())
            }))
        }
    });
    let serve_future = Server::bind(&addr).serve(make_svc);
    ctx.try_log(|logger| slog::info!(logger, "Prometheus monitoring: listening on port {}", port));

    if let Err(err) = serve_future.await {
        ctx.try_log(|logger| slog::warn!(logger, "Prometheus monitoring: server error: {}", err));
    }
}
