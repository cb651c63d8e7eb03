//! JSON scenarios over the control surface.
//!
//! A scenario declares simulation heaps and clients, then a list of steps.
//! Steps refer to handles and descriptors by labels bound by earlier steps,
//! so scenario files never hard-code handle values. Each step carries an
//! expectation (`"ok"` or `{"error": "<kind>"}`) and is logged as one JSONL
//! record.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ionrs_core::{
    ALL_HEAPS, BufferFlags, Client, ControlCommand, ControlReply, Device, DeviceConfig, Fd,
    HandleId, HeapCaps, HeapDescriptor, HeapFlags, HeapId, HeapKind, HeapReport, IonError,
    MetricsSnapshot,
};

use crate::sim_heap::SimHeap;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
use crate::terminator::RecordingTerminator;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("reading scenario: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing scenario: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("step {step}: unknown client '{label}'")]
    UnknownClient { step: usize, label: String },
    #[error("step {step}: unknown label '{label}'")]
    UnknownLabel { step: usize, label: String },
    #[error("setting up scenario: {0}")]
    Setup(#[from] IonError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapSpec {
    pub id: HeapId,
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: HeapKind,
    #[serde(default)]
    pub priority: i32,
    pub capacity: usize,
    #[serde(default)]
    pub defer_free: bool,
    #[serde(default = "HeapCaps::all")]
    pub caps: HeapCaps,
}

fn default_kind() -> HeapKind {
    HeapKind::System
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSpec {
    pub label: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub reclaim_priority: i32,
}

/// One operation, with handles and descriptors named by label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepOp {
    Allocate {
        len: usize,
        #[serde(default = "default_align")]
        align: usize,
        #[serde(default = "default_mask")]
        heap_mask: u32,
        #[serde(default)]
        flags: BufferFlags,
    },
    Free {
        handle: String,
    },
    #[serde(alias = "export")]
    Share {
        handle: String,
    },
    Import {
        fd: String,
    },
    Sync {
        fd: String,
    },
    Phys {
        handle: String,
    },
    Custom {
        cmd: u32,
        #[serde(default)]
        arg: u64,
    },
    Close {
        fd: String,
    },
    DestroyClient,
}

fn default_align() -> usize {
    1
}

fn default_mask() -> u32 {
    ALL_HEAPS
}

impl StepOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Allocate { .. } => "allocate",
            Self::Free { .. } => "free",
            Self::Share { .. } => "share",
            Self::Import { .. } => "import",
            Self::Sync { .. } => "sync",
            Self::Phys { .. } => "phys",
            Self::Custom { .. } => "custom",
            Self::Close { .. } => "close",
            Self::DestroyClient => "destroy_client",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    #[default]
    Ok,
    /// Fails with the error of this kind (`IonError::kind`).
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub client: String,
    #[serde(rename = "do")]
    pub op: StepOp,
    /// Label for the handle or descriptor the step returns.
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub expect: Expect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub config: DeviceConfig,
    pub heaps: Vec<HeapSpec>,
    pub clients: Vec<ClientSpec>,
    /// Enable reclaim with a terminator that destroys the victim's session.
    #[serde(default)]
    pub reclaim: bool,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_json(text: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub client: String,
    pub op: &'static str,
    /// `"ok"` or the error kind.
    pub result: String,
    pub errno: Option<i32>,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub steps: Vec<StepReport>,
    pub heaps: Vec<HeapReport>,
    pub metrics: MetricsSnapshot,
    pub victims: usize,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|s| s.passed)
    }

    #[must_use]
    pub fn failures(&self) -> Vec<&StepReport> {
        self.steps.iter().filter(|s| !s.passed).collect()
    }
}

/// Executes one scenario against a fresh device.
pub struct ScenarioRunner {
    device: Arc<Device>,
    sims: BTreeMap<HeapId, Arc<SimHeap>>,
    clients: BTreeMap<String, Arc<Client>>,
    handles: BTreeMap<String, HandleId>,
    fds: BTreeMap<String, Fd>,
    terminator: Arc<RecordingTerminator>,
}

impl ScenarioRunner {
    /// Build the device, heaps and clients the scenario declares.
    pub fn new(scenario: &Scenario) -> Result<Self, ScenarioError> {
        let terminator = Arc::new(RecordingTerminator::releasing());
        let mut builder = Device::builder().config(scenario.config);
        if scenario.reclaim {
            builder = builder.reclaim(terminator.clone());
        }
        let device = Arc::new(builder.build()?);
        terminator.attach(&device);

        let mut sims = BTreeMap::new();
        for spec in &scenario.heaps {
            let sim = Arc::new(
                SimHeap::builder(spec.name.clone(), spec.capacity)
                    .caps(spec.caps)
                    .build(),
            );
            let mut descriptor = HeapDescriptor::new(spec.id, spec.name.clone(), spec.kind)
                .with_priority(spec.priority);
            if spec.defer_free {
                descriptor = descriptor.with_flags(HeapFlags::DEFER_FREE);
            }
            device.add_heap(descriptor, sim.clone())?;
            sims.insert(spec.id, sim);
        }

        let mut clients = BTreeMap::new();
        for spec in &scenario.clients {
            let client = device.create_client(spec.label.clone(), spec.pid)?;
            client.set_reclaim_priority(spec.reclaim_priority);
            clients.insert(spec.label.clone(), client);
        }

        Ok(Self {
            device,
            sims,
            clients,
            handles: BTreeMap::new(),
            fds: BTreeMap::new(),
            terminator,
        })
    }

    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[must_use]
    pub fn sim_heap(&self, id: HeapId) -> Option<&Arc<SimHeap>> {
        self.sims.get(&id)
    }

    #[must_use]
    pub fn handle(&self, label: &str) -> Option<HandleId> {
        self.handles.get(label).copied()
    }

    #[must_use]
    pub fn fd(&self, label: &str) -> Option<Fd> {
        self.fds.get(label).copied()
    }

    /// Run every step, logging one entry per step to `log`.
    pub fn run<W: Write>(
        &mut self,
        scenario: &Scenario,
        log: &mut LogEmitter<W>,
    ) -> Result<ScenarioReport, ScenarioError> {
        log.emit_entry(
            LogEntry::new("", LogLevel::Info, "scenario_start").with_details(serde_json::json!({
                "name": scenario.name,
                "steps": scenario.steps.len(),
            })),
        )?;

        let mut steps = Vec::with_capacity(scenario.steps.len());
        for (index, step) in scenario.steps.iter().enumerate() {
            let result = self.execute(index, step)?;
            let passed = match (&result, &step.expect) {
                (Ok(_), Expect::Ok) => true,
                (Err(err), Expect::Error(kind)) => err.kind() == kind,
                _ => false,
            };
            let report = StepReport {
                index,
                client: step.client.clone(),
                op: step.op.name(),
                result: result
                    .as_ref()
                    .map_or_else(|e| e.kind().to_string(), |_| "ok".to_string()),
                errno: result.as_ref().err().map(IonError::errno),
                passed,
            };
            log.emit_entry(self.step_entry(step, &report, &result))?;
            steps.push(report);
        }

        let heaps = self
            .sims
            .keys()
            .map(|&id| self.device.heap_report(id))
            .collect::<Result<Vec<_>, _>>()?;
        let report = ScenarioReport {
            name: scenario.name.clone(),
            steps,
            heaps,
            metrics: self.device.metrics(),
            victims: self.terminator.count(),
        };
        let level = if report.passed() {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        log.emit_entry(
            LogEntry::new("", level, "scenario_end")
                .with_outcome(if report.passed() {
                    Outcome::Pass
                } else {
                    Outcome::Fail
                })
                .with_details(serde_json::json!({ "failures": report.failures().len() })),
        )?;
        log.flush()?;
        Ok(report)
    }

    fn step_entry(
        &self,
        step: &Step,
        report: &StepReport,
        result: &Result<Option<ControlReply>, IonError>,
    ) -> LogEntry {
        let level = if report.passed {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let mut entry = LogEntry::new("", level, report.op)
            .with_client(step.client.clone())
            .with_outcome(if report.passed {
                Outcome::Pass
            } else {
                Outcome::Fail
            });
        if let StepOp::Allocate { len, heap_mask, .. } = step.op {
            entry = entry.with_request(len, heap_mask);
        }
        match result {
            Ok(reply) => {
                if let Some(reply) = reply {
                    if let Ok(value) = serde_json::to_value(reply) {
                        entry = entry.with_details(value);
                    }
                }
            }
            Err(err) => {
                entry = entry
                    .with_errno(err.errno())
                    .with_details(serde_json::json!({ "error": err.to_string() }));
            }
        }
        entry
    }

    /// Run one step. The outer error is a malformed scenario; the inner
    /// result is what the device returned.
    fn execute(
        &mut self,
        index: usize,
        step: &Step,
    ) -> Result<Result<Option<ControlReply>, IonError>, ScenarioError> {
        let client = self
            .clients
            .get(&step.client)
            .cloned()
            .ok_or_else(|| ScenarioError::UnknownClient {
                step: index,
                label: step.client.clone(),
            })?;

        let command = match &step.op {
            StepOp::Allocate {
                len,
                align,
                heap_mask,
                flags,
            } => ControlCommand::Allocate {
                len: *len,
                align: *align,
                heap_mask: *heap_mask,
                flags: *flags,
            },
            StepOp::Free { handle } => ControlCommand::Free {
                handle: self.lookup_handle(index, handle)?,
            },
            StepOp::Share { handle } => ControlCommand::Share {
                handle: self.lookup_handle(index, handle)?,
            },
            StepOp::Import { fd } => ControlCommand::Import {
                fd: self.lookup_fd(index, fd)?,
            },
            StepOp::Sync { fd } => ControlCommand::Sync {
                fd: self.lookup_fd(index, fd)?,
            },
            StepOp::Phys { handle } => ControlCommand::Phys {
                handle: self.lookup_handle(index, handle)?,
            },
            StepOp::Custom { cmd, arg } => ControlCommand::Custom {
                cmd: *cmd,
                arg: *arg,
            },
            StepOp::Close { fd } => {
                let fd = self.lookup_fd(index, fd)?;
                return Ok(self.device.close(fd).map(|()| None));
            }
            StepOp::DestroyClient => {
                return Ok(self.device.destroy_client(&client).map(|()| None));
            }
        };

        let result = self.device.dispatch(&client, command);
        if let (Ok(reply), Some(label)) = (&result, &step.bind) {
            match reply {
                ControlReply::Handle { handle } => {
                    self.handles.insert(label.clone(), *handle);
                }
                ControlReply::Fd { fd } => {
                    self.fds.insert(label.clone(), *fd);
                }
                _ => {}
            }
        }
        Ok(result.map(Some))
    }

    fn lookup_handle(&self, index: usize, label: &str) -> Result<HandleId, ScenarioError> {
        self.handles
            .get(label)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownLabel {
                step: index,
                label: label.to_string(),
            })
    }

    fn lookup_fd(&self, index: usize, label: &str) -> Result<Fd, ScenarioError> {
        self.fds
            .get(label)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownLabel {
                step: index,
                label: label.to_string(),
            })
    }
}

/// Parse, set up and run `scenario` in one go.
pub fn run_scenario<W: Write>(
    scenario: &Scenario,
    log: &mut LogEmitter<W>,
) -> Result<ScenarioReport, ScenarioError> {
    ScenarioRunner::new(scenario)?.run(scenario, log)
}
