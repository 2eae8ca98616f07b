//! Agent modules and their enable/disable lifecycle.
//!
//! A module is a caller of the core: it reacts to signals and commands,
//! reads and writes [`ObservableState`], and schedules work. Everything it
//! needs comes in through a [`ModuleContext`]; there are no globals.
//!
//! Enabling a module seeds its initial state (existing values win), connects
//! its signal subscribers and registers its recurring jobs. Disabling it
//! undoes the last two and calls [`AgentModule::on_disable`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::{Error, Result, panic_message};
use crate::model::JobId;
use crate::queue::{TaskQueue, UniqueTaskQueue};
use crate::schedule::{ScheduledJob, Scheduler};
use crate::signal::{Channel, EventBus, SignalError, SubscriptionId};
use crate::state::ObservableState;

/// Everything a module may touch.
#[derive(Clone)]
pub struct ModuleContext {
    pub state: Arc<ObservableState>,
    pub bus: Arc<EventBus>,
    pub tasks: Arc<TaskQueue>,
    pub unique: Arc<UniqueTaskQueue>,
}

impl ModuleContext {
    /// Fresh state and bus around an existing queue.
    pub fn new(tasks: Arc<TaskQueue>) -> Self {
        Self {
            state: Arc::new(ObservableState::new()),
            bus: Arc::new(EventBus::new()),
            unique: Arc::new(UniqueTaskQueue::new(Arc::clone(&tasks))),
            tasks,
        }
    }
}

/// A subscriber connected on behalf of a module, disconnected on disable.
pub struct SignalBinding {
    channel: Arc<Channel>,
    id: SubscriptionId,
}

impl SignalBinding {
    pub fn connect<F>(channel: Arc<Channel>, subscriber: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<Value, SignalError> + Send + Sync + 'static,
    {
        let id = channel.connect(subscriber);
        Self { channel, id }
    }

    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    fn release(self) {
        self.channel.disconnect(self.id);
    }
}

/// A user command, e.g. `camera on` from a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a line on whitespace: the first word is the name. A leading
    /// `/` is dropped. `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let name = words.next()?.trim_start_matches('/');
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name.to_ascii_lowercase(), words))
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// A pluggable unit of agent behaviour.
pub trait AgentModule: Send + Sync {
    fn name(&self) -> &str;

    /// Values seeded into the shared state when the module is enabled.
    fn initial_state(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// Connect signal subscribers. Kept until the module is disabled.
    fn subscribe(self: Arc<Self>, _ctx: &ModuleContext) -> Vec<SignalBinding> {
        Vec::new()
    }

    /// Recurring jobs, unscheduled when the module is disabled.
    fn schedule(self: Arc<Self>, _ctx: &ModuleContext) -> Vec<ScheduledJob> {
        Vec::new()
    }

    /// Handle a user command. Returns `true` if the command was consumed.
    fn process_command(&self, _ctx: &ModuleContext, _command: &Command) -> bool {
        false
    }

    /// Called after bindings and jobs are released.
    fn on_disable(&self, _ctx: &ModuleContext) {}
}

struct Enabled {
    name: String,
    module: Arc<dyn AgentModule>,
    bindings: Vec<SignalBinding>,
    jobs: Vec<JobId>,
    /// `false` while `enable` is still running the module's hooks.
    ready: bool,
}

/// Modules currently enabled, in enable order.
pub struct ModuleRegistry {
    ctx: ModuleContext,
    scheduler: Arc<Scheduler>,
    enabled: Mutex<Vec<Enabled>>,
}

impl ModuleRegistry {
    pub fn new(ctx: ModuleContext, scheduler: Arc<Scheduler>) -> Self {
        Self {
            ctx,
            scheduler,
            enabled: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    /// Enable `module`. Its name is reserved before any hook runs, so of two
    /// concurrent enables of one name exactly one succeeds. A hook that
    /// panics rolls the enable back.
    pub fn enable(&self, module: Arc<dyn AgentModule>) -> Result<()> {
        let name = module.name().to_string();
        {
            let mut enabled = self.enabled.lock();
            if enabled.iter().any(|e| e.name == name) {
                return Err(Error::ModuleAlreadyEnabled(name));
            }
            enabled.push(Enabled {
                name: name.clone(),
                module: Arc::clone(&module),
                bindings: Vec::new(),
                jobs: Vec::new(),
                ready: false,
            });
        }

        // Hooks run unlocked: they may use the context freely.
        for (key, value) in module.initial_state() {
            self.ctx.state.insert_default(key, value);
        }

        let bindings = match catch_unwind(AssertUnwindSafe(|| {
            Arc::clone(&module).subscribe(&self.ctx)
        })) {
            Ok(bindings) => bindings,
            Err(payload) => return Err(self.abort_enable(&name, Vec::new(), payload.as_ref())),
        };
        let scheduled = match catch_unwind(AssertUnwindSafe(|| {
            Arc::clone(&module).schedule(&self.ctx)
        })) {
            Ok(scheduled) => scheduled,
            Err(payload) => return Err(self.abort_enable(&name, bindings, payload.as_ref())),
        };

        let mut jobs = Vec::new();
        for job in scheduled {
            let job_id = job.job_id().clone();
            if self.scheduler.add(job) {
                jobs.push(job_id);
            } else {
                debug!(module = %name, %job_id, "job already scheduled by another module");
            }
        }

        info!(module = %name, bindings = bindings.len(), jobs = jobs.len(), "module enabled");
        let mut enabled = self.enabled.lock();
        if let Some(entry) = enabled.iter_mut().find(|e| e.name == name) {
            entry.bindings = bindings;
            entry.jobs = jobs;
            entry.ready = true;
        }
        Ok(())
    }

    /// Undo a half-done enable and drop the name reservation.
    fn abort_enable(
        &self,
        name: &str,
        bindings: Vec<SignalBinding>,
        payload: &(dyn std::any::Any + Send),
    ) -> Error {
        for binding in bindings {
            binding.release();
        }
        self.enabled.lock().retain(|e| e.name != name || e.ready);
        let message = panic_message(payload);
        error!(module = %name, error = %message, "module panicked while enabling");
        Error::Other(format!("module {name} panicked while enabling: {message}"))
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        let enabled = {
            let mut enabled = self.enabled.lock();
            let index = enabled
                .iter()
                .position(|e| e.ready && e.name == name)
                .ok_or_else(|| Error::ModuleNotFound(name.to_string()))?;
            enabled.remove(index)
        };
        self.release(enabled);
        Ok(())
    }

    /// Disable every module, most recently enabled first. Modules still in
    /// the middle of `enable` are left to finish.
    pub fn disable_all(&self) {
        let all: Vec<Enabled> = {
            let mut enabled = self.enabled.lock();
            let (ready, pending): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *enabled).into_iter().partition(|e| e.ready);
            *enabled = pending;
            ready
        };
        for enabled in all.into_iter().rev() {
            self.release(enabled);
        }
    }

    fn release(&self, enabled: Enabled) {
        for binding in enabled.bindings {
            binding.release();
        }
        for job_id in &enabled.jobs {
            self.scheduler.cancel(job_id);
        }
        enabled.module.on_disable(&self.ctx);
        info!(module = %enabled.name, "module disabled");
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.lock().iter().any(|e| e.ready && e.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.enabled
            .lock()
            .iter()
            .filter(|e| e.ready)
            .map(|e| e.name.clone())
            .collect()
    }

    /// Offer `command` to each module in enable order until one consumes it.
    /// Returns the name of that module.
    pub fn dispatch(&self, command: &Command) -> Option<String> {
        let modules: Vec<Arc<dyn AgentModule>> = self
            .enabled
            .lock()
            .iter()
            .filter(|e| e.ready)
            .map(|e| Arc::clone(&e.module))
            .collect();

        modules
            .into_iter()
            .find(|m| m.process_command(&self.ctx, command))
            .map(|m| m.name().to_string())
    }
}
