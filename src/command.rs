//! Inbound command interpretation.
//!
//! A payload is either a control command (`{"cmd": "stop"}` and friends),
//! routed straight to the cancellation controller, or a batch of tasks.
//! Batches are validated completely before anything is started, so a
//! rejected payload never leaves producers or files behind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationController;
use crate::gain::GainSpec;
use crate::producer::{ArtifactProducer, ArtifactSource};
use crate::queue::{PriorityTaskQueue, SubTask, DEFAULT_PRIORITY};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Error decoding command: {0}")]
    Malformed(String),
    #[error("Command has no tasks")]
    MissingTasks,
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),
    #[error("Error decoding data for '{0}'")]
    InvalidData(String),
    #[error("File {} does not exist", .0.display())]
    MissingSound(PathBuf),
    #[error("gain and channel are mutually exclusive")]
    GainAndChannel,
}

/// Commands that bypass batch construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Stop,
    StopAll,
    Pause,
    Resume,
}

impl ControlCommand {
    fn parse(cmd: &str) -> Option<Self> {
        match cmd.to_ascii_lowercase().as_str() {
            "stop" => Some(Self::Stop),
            "stopall" => Some(Self::StopAll),
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            _ => None,
        }
    }
}

/// What happened to one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Queued { seq: u64, tasks: usize },
    Control(ControlCommand),
    Rejected(String),
    QueueFull,
}

#[derive(Deserialize)]
struct BatchPayload {
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    gain: Option<Value>,
    #[serde(default)]
    channel: Option<Value>,
    #[serde(default)]
    tasks: Option<Vec<TaskPayload>>,
}

#[derive(Deserialize)]
struct TaskPayload {
    cmd: String,
    #[serde(default)]
    data: Option<Value>,
}

/// A validated task, not yet started.
#[derive(Debug, PartialEq)]
enum PlannedTask {
    Pause(Duration),
    Produce(ArtifactSource),
}

#[derive(Debug)]
struct Plan {
    priority: i64,
    gain: GainSpec,
    tasks: Vec<PlannedTask>,
}

pub struct CommandInterpreter {
    producer: Arc<ArtifactProducer>,
    queue: Arc<PriorityTaskQueue>,
    cancel: CancellationController,
    keep_files: bool,
}

impl CommandInterpreter {
    pub fn new(
        producer: Arc<ArtifactProducer>,
        queue: Arc<PriorityTaskQueue>,
        cancel: CancellationController,
        keep_files: bool,
    ) -> Self {
        Self {
            producer,
            queue,
            cancel,
            keep_files,
        }
    }

    /// Interpret one raw payload. Never fails; problems are logged and
    /// reported in the returned [`Handled`].
    pub fn handle(&self, payload: &[u8]) -> Handled {
        debug!("Payload: {}", String::from_utf8_lossy(payload));

        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => return self.reject(CommandError::Malformed(e.to_string())),
        };

        if let Some(control) = control_command(&value) {
            return match ControlCommand::parse(control) {
                Some(command) => {
                    self.apply_control(command);
                    Handled::Control(command)
                }
                None => self.reject(CommandError::UnknownCommand(control.to_string())),
            };
        }

        let plan = match self.plan(value) {
            Ok(plan) => plan,
            Err(e) => return self.reject(e),
        };
        self.submit(plan)
    }

    fn reject(&self, err: CommandError) -> Handled {
        warn!("{err}");
        Handled::Rejected(err.to_string())
    }

    fn apply_control(&self, command: ControlCommand) {
        info!("Received control command: {command:?}");
        match command {
            ControlCommand::Stop => self.cancel.stop_current(),
            ControlCommand::StopAll => {
                self.cancel.stop_all();
            }
            ControlCommand::Pause => self.cancel.pause(),
            ControlCommand::Resume => self.cancel.resume(),
        }
    }

    fn plan(&self, value: Value) -> Result<Plan, CommandError> {
        let payload: BatchPayload =
            serde_json::from_value(value).map_err(|e| CommandError::Malformed(e.to_string()))?;
        let tasks = payload.tasks.ok_or(CommandError::MissingTasks)?;
        let gain = GainSpec::from_request(payload.gain.as_ref(), payload.channel.as_ref())?;

        let tasks = tasks
            .into_iter()
            .map(|task| self.plan_task(task))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Plan {
            priority: payload.priority.unwrap_or(DEFAULT_PRIORITY),
            gain,
            tasks,
        })
    }

    fn plan_task(&self, task: TaskPayload) -> Result<PlannedTask, CommandError> {
        info!("Received command: {}", task.cmd);
        let cmd = task.cmd.to_ascii_lowercase();
        match cmd.as_str() {
            "sleep" => task
                .data
                .as_ref()
                .and_then(pause_duration)
                .map(PlannedTask::Pause)
                .ok_or_else(|| CommandError::InvalidData(cmd.clone())),
            "sound" => {
                let name = task
                    .data
                    .as_ref()
                    .and_then(Value::as_str)
                    .filter(|n| is_plain_name(n))
                    .ok_or_else(|| CommandError::InvalidData(cmd.clone()))?;
                let path = self.producer.sound_path(name);
                if !path.is_file() {
                    return Err(CommandError::MissingSound(path));
                }
                Ok(PlannedTask::Produce(ArtifactSource::Sound(name.to_string())))
            }
            "tts" => task
                .data
                .as_ref()
                .and_then(Value::as_str)
                .filter(|text| !text.trim().is_empty())
                .map(|text| PlannedTask::Produce(ArtifactSource::Speech(text.to_string())))
                .ok_or_else(|| CommandError::InvalidData(cmd.clone())),
            _ => Err(CommandError::UnknownCommand(task.cmd)),
        }
    }

    fn submit(&self, plan: Plan) -> Handled {
        let tasks: Vec<SubTask> = plan
            .tasks
            .into_iter()
            .map(|task| match task {
                PlannedTask::Pause(duration) => SubTask::Pause(duration),
                PlannedTask::Produce(source) => {
                    SubTask::Artifact(self.producer.dispatch(source, plan.gain))
                }
            })
            .collect();
        let count = tasks.len();

        match self.queue.push(plan.priority, tasks) {
            Ok(seq) => {
                debug!(
                    "Queued batch #{seq} (priority {}, {count} tasks, {} waiting)",
                    plan.priority,
                    self.queue.len()
                );
                Handled::Queued { seq, tasks: count }
            }
            Err(full) => {
                error!("Audio queue is full, dropping batch: {full}");
                for task in full.tasks {
                    if let SubTask::Artifact(handle) = task {
                        handle.discard(self.keep_files);
                    }
                }
                Handled::QueueFull
            }
        }
    }
}

/// `cmd` of a payload that is a bare control command (no `tasks`).
fn control_command(value: &Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.contains_key("tasks") {
        return None;
    }
    object.get("cmd")?.as_str()
}

/// Whole non-negative seconds, as a JSON integer or a string of digits.
fn pause_duration(data: &Value) -> Option<Duration> {
    let secs = match data {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
            s.parse::<u64>().ok()?
        }
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Sound names are file stems inside the library, never paths.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}
