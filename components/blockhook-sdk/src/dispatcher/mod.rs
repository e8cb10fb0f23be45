use std::collections::{HashMap, HashSet, VecDeque};
use std::thread::JoinHandle;

use blockhook_types::Chain;
use crossbeam_channel::{unbounded, Receiver, Sender};
use hiro_system_kit::slog;
use reqwest::{Client, RequestBuilder};

use crate::hooks::bitcoin::BitcoinHookOccurrencePayload;
use crate::hooks::stacks::StacksHookOccurrencePayload;
use crate::utils::{file_append, send_request, Context};

/// Payloads queue per predicate; a predicate slower than its feed can hold
/// this many deliveries before it is cut off.
pub const DEFAULT_DISPATCH_QUEUE_DEPTH: usize = 256;

const DELIVERY_ATTEMPTS_MAX: u16 = 3;
const DELIVERY_ATTEMPTS_INTERVAL_SEC: u16 = 1;

#[derive(Debug, Clone)]
pub enum HookOccurrencePayload {
    Bitcoin(BitcoinHookOccurrencePayload),
    Stacks(StacksHookOccurrencePayload),
}

impl HookOccurrencePayload {
    pub fn uuid(&self) -> &str {
        match self {
            HookOccurrencePayload::Bitcoin(payload) => &payload.chainhook.uuid,
            HookOccurrencePayload::Stacks(payload) => &payload.chainhook.uuid,
        }
    }

    pub fn chain(&self) -> Chain {
        match self {
            HookOccurrencePayload::Bitcoin(_) => Chain::Bitcoin,
            HookOccurrencePayload::Stacks(_) => Chain::Stacks,
        }
    }
}

/// Terminal result of one delivery, reported back to the lifecycle
/// controller for status accounting.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub uuid: String,
    pub chain: Chain,
    pub result: Result<(), String>,
}

enum DispatcherCommand {
    Deliver {
        request: Box<RequestBuilder>,
        payload: Box<HookOccurrencePayload>,
    },
    AppendToFile {
        chain: Chain,
        uuid: String,
        path: String,
        bytes: Vec<u8>,
    },
    DeliveryCompleted {
        chain: Chain,
        uuid: String,
        result: Result<(), String>,
    },
    Drain(String),
    Terminate,
}

enum WorkerCommand {
    Http {
        chain: Chain,
        uuid: String,
        request: Box<RequestBuilder>,
    },
    File {
        chain: Chain,
        uuid: String,
        path: String,
        bytes: Vec<u8>,
    },
    Terminate,
}

enum QueuedDelivery {
    Http(Box<RequestBuilder>),
    File(String, Vec<u8>),
}

/// Pending deliveries for one predicate. A predicate lives on a single
/// chain, so the chain rides with the queue rather than with every entry.
struct PredicateQueue {
    chain: Chain,
    deliveries: VecDeque<QueuedDelivery>,
}

/// Fan-out of matched payloads to their sinks. One actor thread owns the
/// per-predicate queues; a pool of networking workers performs the blocking
/// deliveries. Ordering contract: strictly FIFO within a predicate (at most
/// one delivery in flight per uuid), unordered across predicates.
#[derive(Clone)]
pub struct Dispatcher {
    commands_tx: Sender<DispatcherCommand>,
}

impl Dispatcher {
    pub fn start(
        pool_size: usize,
        outcomes_tx: Sender<DispatchOutcome>,
        ctx: &Context,
    ) -> Dispatcher {
        let (commands_tx, commands_rx) = unbounded();
        let actor_commands_tx = commands_tx.clone();
        let moved_ctx = ctx.clone();
        let _ = hiro_system_kit::thread_named("Dispatcher")
            .spawn(move || {
                dispatcher_loop(
                    pool_size.max(1),
                    commands_rx,
                    actor_commands_tx,
                    outcomes_tx,
                    moved_ctx,
                )
            })
            .expect("unable to spawn thread");
        Dispatcher { commands_tx }
    }

    pub fn send(&self, request: RequestBuilder, payload: HookOccurrencePayload) {
        let _ = self.commands_tx.send(DispatcherCommand::Deliver {
            request: Box::new(request),
            payload: Box::new(payload),
        });
    }

    pub fn send_file_append(&self, chain: Chain, uuid: &str, path: String, bytes: Vec<u8>) {
        let _ = self.commands_tx.send(DispatcherCommand::AppendToFile {
            chain,
            uuid: uuid.to_string(),
            path,
            bytes,
        });
    }

    /// Deregistration: drops everything still queued for the predicate.
    pub fn drain(&self, uuid: &str) {
        let _ = self
            .commands_tx
            .send(DispatcherCommand::Drain(uuid.to_string()));
    }

    pub fn terminate(&self) {
        let _ = self.commands_tx.send(DispatcherCommand::Terminate);
    }
}

fn dispatcher_loop(
    pool_size: usize,
    commands_rx: Receiver<DispatcherCommand>,
    commands_tx: Sender<DispatcherCommand>,
    outcomes_tx: Sender<DispatchOutcome>,
    ctx: Context,
) {
    let mut worker_queues = vec![];
    let mut worker_handles: Vec<JoinHandle<()>> = vec![];
    for worker_id in 0..pool_size {
        let (worker_tx, worker_rx) = unbounded();
        let moved_commands_tx = commands_tx.clone();
        let moved_ctx = ctx.clone();
        let handle = hiro_system_kit::thread_named(&format!("Dispatcher worker #{}", worker_id))
            .spawn(move || worker_loop(worker_rx, moved_commands_tx, moved_ctx))
            .expect("unable to spawn thread");
        worker_queues.push(worker_tx);
        worker_handles.push(handle);
    }

    let mut queues: HashMap<String, PredicateQueue> = HashMap::new();
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut next_worker = 0;

    while let Ok(command) = commands_rx.recv() {
        match command {
            DispatcherCommand::Deliver { request, payload } => {
                let uuid = payload.uuid().to_string();
                let chain = payload.chain();
                if !enqueue(
                    &mut queues,
                    &uuid,
                    chain,
                    QueuedDelivery::Http(request),
                    &outcomes_tx,
                    &ctx,
                ) {
                    continue;
                }
                pump(
                    &mut queues,
                    &mut in_flight,
                    &uuid,
                    &worker_queues,
                    &mut next_worker,
                );
            }
            DispatcherCommand::AppendToFile {
                chain,
                uuid,
                path,
                bytes,
            } => {
                if !enqueue(
                    &mut queues,
                    &uuid,
                    chain,
                    QueuedDelivery::File(path, bytes),
                    &outcomes_tx,
                    &ctx,
                ) {
                    continue;
                }
                pump(
                    &mut queues,
                    &mut in_flight,
                    &uuid,
                    &worker_queues,
                    &mut next_worker,
                );
            }
            DispatcherCommand::DeliveryCompleted {
                chain,
                uuid,
                result,
            } => {
                in_flight.remove(&uuid);
                let _ = outcomes_tx.send(DispatchOutcome {
                    uuid: uuid.clone(),
                    chain,
                    result,
                });
                pump(
                    &mut queues,
                    &mut in_flight,
                    &uuid,
                    &worker_queues,
                    &mut next_worker,
                );
            }
            DispatcherCommand::Drain(uuid) => {
                if let Some(dropped) = queues.remove(&uuid) {
                    ctx.try_log(|logger| {
                        slog::info!(
                            logger,
                            "Draining {} queued deliveries for predicate {}",
                            dropped.deliveries.len(),
                            uuid
                        )
                    });
                }
            }
            DispatcherCommand::Terminate => {
                for worker_tx in worker_queues.iter() {
                    let _ = worker_tx.send(WorkerCommand::Terminate);
                }
                break;
            }
        }
    }

    for handle in worker_handles.into_iter() {
        let _ = handle.join();
    }
}

/// Enqueues a delivery, enforcing the per-predicate depth bound. Overflow is
/// terminal for the predicate: its queue is dropped and the failure surfaced,
/// rather than losing matches silently.
fn enqueue(
    queues: &mut HashMap<String, PredicateQueue>,
    uuid: &str,
    chain: Chain,
    delivery: QueuedDelivery,
    outcomes_tx: &Sender<DispatchOutcome>,
    ctx: &Context,
) -> bool {
    let queue = queues.entry(uuid.to_string()).or_insert_with(|| PredicateQueue {
        chain: chain.clone(),
        deliveries: VecDeque::new(),
    });
    if queue.deliveries.len() >= DEFAULT_DISPATCH_QUEUE_DEPTH {
        ctx.try_log(|logger| {
            slog::error!(
                logger,
                "Dispatch queue overflow for predicate {}, dropping queue",
                uuid
            )
        });
        queues.remove(uuid);
        let _ = outcomes_tx.send(DispatchOutcome {
            uuid: uuid.to_string(),
            chain,
            result: Err(format!(
                "dispatch queue overflow (depth {})",
                DEFAULT_DISPATCH_QUEUE_DEPTH
            )),
        });
        return false;
    }
    queue.deliveries.push_back(delivery);
    true
}

fn pump(
    queues: &mut HashMap<String, PredicateQueue>,
    in_flight: &mut HashSet<String>,
    uuid: &str,
    worker_queues: &[Sender<WorkerCommand>],
    next_worker: &mut usize,
) {
    if in_flight.contains(uuid) {
        return;
    }
    let Some(queue) = queues.get_mut(uuid) else {
        return;
    };
    let Some(delivery) = queue.deliveries.pop_front() else {
        return;
    };
    let chain = queue.chain.clone();
    if queue.deliveries.is_empty() {
        queues.remove(uuid);
    }
    let command = match delivery {
        QueuedDelivery::Http(request) => WorkerCommand::Http {
            chain,
            uuid: uuid.to_string(),
            request,
        },
        QueuedDelivery::File(path, bytes) => WorkerCommand::File {
            chain,
            uuid: uuid.to_string(),
            path,
            bytes,
        },
    };
    in_flight.insert(uuid.to_string());
    let _ = worker_queues[*next_worker % worker_queues.len()].send(command);
    *next_worker += 1;
}

fn worker_loop(
    worker_rx: Receiver<WorkerCommand>,
    commands_tx: Sender<DispatcherCommand>,
    ctx: Context,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            ctx.try_log(|logger| {
                slog::crit!(logger, "unable to build dispatcher runtime: {}", e)
            });
            return;
        }
    };
    let client = Client::new();

    while let Ok(command) = worker_rx.recv() {
        match command {
            WorkerCommand::Http {
                chain,
                uuid,
                request,
            } => {
                let result = match request.build() {
                    Ok(built) => {
                        let request = RequestBuilder::from_parts(client.clone(), built);
                        rt.block_on(send_request(
                            request,
                            DELIVERY_ATTEMPTS_MAX,
                            DELIVERY_ATTEMPTS_INTERVAL_SEC,
                            &ctx,
                        ))
                    }
                    Err(e) => Err(format!("unable to build request: {}", e)),
                };
                let _ = commands_tx.send(DispatcherCommand::DeliveryCompleted {
                    chain,
                    uuid,
                    result,
                });
            }
            WorkerCommand::File {
                chain,
                uuid,
                path,
                bytes,
            } => {
                let result = file_append(path, bytes, &ctx);
                let _ = commands_tx.send(DispatcherCommand::DeliveryCompleted {
                    chain,
                    uuid,
                    result,
                });
            }
            WorkerCommand::Terminate => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_stacks_payload(uuid: &str) -> HookOccurrencePayload {
        HookOccurrencePayload::Stacks(StacksHookOccurrencePayload {
            apply: vec![],
            rollback: vec![],
            chainhook: crate::hooks::stacks::StacksHookPayload {
                uuid: uuid.to_string(),
            },
        })
    }

    #[test]
    fn file_deliveries_for_one_predicate_are_appended_in_order() {
        let mut path = std::env::temp_dir();
        path.push(format!("blockhook-dispatch-{}.jsonl", std::process::id()));
        let path = path.to_str().unwrap().to_string();
        let _ = std::fs::remove_file(&path);

        let ctx = Context::empty();
        let (outcomes_tx, outcomes_rx) = unbounded();
        let dispatcher = Dispatcher::start(2, outcomes_tx, &ctx);

        for i in 0..5 {
            dispatcher.send_file_append(
                Chain::Stacks,
                "uuid-1",
                path.clone(),
                format!("{{\"seq\":{}}}", i).into_bytes(),
            );
        }

        for _ in 0..5 {
            let outcome = outcomes_rx
                .recv_timeout(std::time::Duration::from_secs(5))
                .expect("missing outcome");
            assert_eq!(outcome.uuid, "uuid-1");
            assert_eq!(outcome.chain, Chain::Stacks);
            assert!(outcome.result.is_ok());
        }
        dispatcher.terminate();

        let content = std::fs::read_to_string(&path).expect("missing payload file");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(*line, format!("{{\"seq\":{}}}", i));
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn queue_overflow_surfaces_an_error_outcome() {
        let ctx = Context::empty();
        let (outcomes_tx, outcomes_rx) = unbounded();
        let dispatcher = Dispatcher::start(1, outcomes_tx, &ctx);

        // Deliveries against a closed local port keep the single worker busy
        // through its retry backoff while the queue fills up behind it: one
        // in flight, DEFAULT_DISPATCH_QUEUE_DEPTH queued, one over the edge.
        let client = Client::new();
        for _ in 0..(DEFAULT_DISPATCH_QUEUE_DEPTH + 2) {
            let request = client.post("http://127.0.0.1:9/hook");
            dispatcher.send(request, empty_stacks_payload("uuid-overflow"));
        }

        let overflow_error = loop {
            let outcome = outcomes_rx
                .recv_timeout(std::time::Duration::from_secs(30))
                .expect("missing outcome");
            assert_eq!(outcome.uuid, "uuid-overflow");
            assert_eq!(outcome.chain, Chain::Stacks);
            match outcome.result {
                Err(e) if e.contains("dispatch queue overflow") => break e,
                _ => continue,
            }
        };
        assert!(overflow_error.contains(&format!("depth {}", DEFAULT_DISPATCH_QUEUE_DEPTH)));
        dispatcher.terminate();
    }

    #[test]
    fn payload_chain_and_uuid_route_to_the_owning_predicate() {
        let payload = empty_stacks_payload("uuid-42");
        assert_eq!(payload.uuid(), "uuid-42");
        assert_eq!(payload.chain(), Chain::Stacks);
    }
}
