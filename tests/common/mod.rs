#![allow(dead_code)]

mod memory;

pub use memory::MemoryBroker;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;

use evaluator::evaluation::{EvaluationService, LimitPolicy};
use evaluator::language::{Language, SOURCE_ENV};
use evaluator::sandbox::{
    ContainerRuntime, ContainerSpec, ExecutionConstraint, ExecutionEngine, OOM_KILLED_EXIT_CODE,
    SandboxError,
};
use evaluator::submission::Submission;
use evaluator::worker::{DeliveryPolicy, RestartPolicy, WorkerContext};

pub const MIB: u64 = 1024 * 1024;

/// How a scripted container behaves once started
#[derive(Debug, Clone, Copy)]
enum Script {
    Exit { status: i64, output: &'static str },
    Sleep(Duration),
    Hang,
    WaitFails,
    Panic,
}

impl Script {
    /// Picks a behavior from keywords in the submitted source
    fn for_source(code: &str) -> Self {
        if code.contains("while True") {
            Script::Hang
        } else if code.contains("bytearray") {
            Script::Exit {
                status: OOM_KILLED_EXIT_CODE,
                output: "",
            }
        } else if code.contains("raise") {
            Script::Exit {
                status: 1,
                output: "Traceback (most recent call last):\n",
            }
        } else if code.contains("sleep") {
            Script::Sleep(Duration::from_millis(300))
        } else if code.contains("flaky") {
            Script::WaitFails
        } else if code.contains("panic") {
            Script::Panic
        } else if code.contains("print(1+1)") {
            Script::Exit {
                status: 0,
                output: "2\n",
            }
        } else {
            Script::Exit {
                status: 0,
                output: "",
            }
        }
    }
}

#[derive(Default)]
struct State {
    containers: HashMap<String, Script>,
    next_id: u64,
    pulled: Vec<String>,
    created: usize,
    started: usize,
    removed: usize,
    peak_live: usize,
    specs: Vec<ContainerSpec>,
}

/// Container runtime that plays back canned behaviors instead of running code
#[derive(Default)]
pub struct ScriptedRuntime {
    state: Mutex<State>,
    fail_pulls: bool,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_pulls() -> Arc<Self> {
        Arc::new(Self {
            fail_pulls: true,
            ..Default::default()
        })
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state.lock().pulled.clone()
    }

    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    pub fn started(&self) -> usize {
        self.state.lock().started
    }

    pub fn removed(&self) -> usize {
        self.state.lock().removed
    }

    /// Containers created and not yet removed
    pub fn live(&self) -> usize {
        self.state.lock().containers.len()
    }

    /// Highest number of containers alive at the same time
    pub fn peak_live(&self) -> usize {
        self.state.lock().peak_live
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().specs.clone()
    }

    fn script(&self, id: &str) -> Script {
        self.state
            .lock()
            .containers
            .get(id)
            .copied()
            .unwrap_or(Script::Exit {
                status: 0,
                output: "",
            })
    }
}

fn decode_source(spec: &ContainerSpec) -> String {
    let prefix = format!("{SOURCE_ENV}=");
    spec.env
        .iter()
        .find_map(|var| var.strip_prefix(&prefix))
        .and_then(|encoded| STANDARD.decode(encoded).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn pull(&self, image: &str) -> Result<(), SandboxError> {
        if self.fail_pulls {
            return Err(SandboxError::ImagePull {
                image: image.to_string(),
                source: "registry unreachable".into(),
            });
        }
        self.state.lock().pulled.push(image.to_string());
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let script = Script::for_source(&decode_source(spec));

        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("scripted-{}", state.next_id);
        state.containers.insert(id.clone(), script);
        state.created += 1;
        state.peak_live = state.peak_live.max(state.containers.len());
        state.specs.push(spec.clone());
        Ok(id)
    }

    async fn start(&self, _id: &str) -> Result<(), SandboxError> {
        self.state.lock().started += 1;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        match self.script(id) {
            Script::Exit { status, .. } => Ok(status),
            Script::Sleep(delay) => {
                tokio::time::sleep(delay).await;
                Ok(0)
            }
            Script::Hang => std::future::pending().await,
            Script::WaitFails => Err(SandboxError::Wait {
                id: id.to_string(),
                source: "daemon connection reset".into(),
            }),
            Script::Panic => panic!("runtime crashed while waiting for {id}"),
        }
    }

    async fn logs(&self, id: &str) -> Result<Vec<u8>, SandboxError> {
        match self.script(id) {
            Script::Exit { output, .. } => Ok(output.as_bytes().to_vec()),
            _ => Ok(Vec::new()),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        if state.containers.remove(id).is_some() {
            state.removed += 1;
        }
        Ok(())
    }
}

pub fn constraint(time_limit: Duration) -> ExecutionConstraint {
    ExecutionConstraint::new(time_limit, 256 * MIB).unwrap()
}

pub fn engine(runtime: &Arc<ScriptedRuntime>) -> ExecutionEngine {
    ExecutionEngine::new(runtime.clone())
}

pub fn body(id: &str, language: Language, code: &str) -> Vec<u8> {
    Submission {
        id: id.to_string(),
        problem_id: "p1".to_string(),
        code: code.to_string(),
        language,
    }
    .encode()
    .unwrap()
}

pub fn context(
    broker: &MemoryBroker,
    runtime: &Arc<ScriptedRuntime>,
    delivery: DeliveryPolicy,
) -> WorkerContext {
    let limits = LimitPolicy::new(constraint(Duration::from_secs(2)));
    WorkerContext {
        broker: Arc::new(broker.clone()),
        evaluator: Arc::new(EvaluationService::new(engine(runtime), limits)),
        delivery,
        restart: RestartPolicy {
            max_restarts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        },
    }
}

/// Polls `condition` until it holds or a generous deadline passes
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Resolves after `delay`; stands in for a termination signal
pub fn signal_after(delay: Duration) -> impl Future<Output = ()> {
    tokio::time::sleep(delay)
}
