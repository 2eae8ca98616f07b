//! Integration tests for the module registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use homeguard::error::Error;
use homeguard::model::JobId;
use homeguard::module::*;
use homeguard::queue::TaskQueue;
use homeguard::schedule::{ScheduledJob, Scheduler};
use serde_json::{Value, json};

/// Toggles a camera flag on `camera on|off` and reacts to motion.
#[derive(Default)]
struct Camera {
    motions: AtomicU32,
    disabled: AtomicU32,
}

impl AgentModule for Camera {
    fn name(&self) -> &str {
        "camera"
    }

    fn initial_state(&self) -> Vec<(String, Value)> {
        vec![
            ("camera.enabled".to_string(), json!(false)),
            ("camera.resolution".to_string(), json!("720p")),
        ]
    }

    fn subscribe(self: Arc<Self>, ctx: &ModuleContext) -> Vec<SignalBinding> {
        vec![SignalBinding::connect(ctx.bus.channel("motion"), move |_| {
            self.motions.fetch_add(1, Ordering::SeqCst);
            Ok(json!("camera saw it"))
        })]
    }

    fn schedule(self: Arc<Self>, _ctx: &ModuleContext) -> Vec<ScheduledJob> {
        vec![ScheduledJob::new(
            "camera.check",
            Duration::from_secs(30),
            |_ctx| Ok(()),
        )]
    }

    fn process_command(&self, ctx: &ModuleContext, command: &Command) -> bool {
        if command.name != "camera" {
            return false;
        }
        match command.arg(0) {
            Some("on") => ctx.state.set("camera.enabled", json!(true)),
            Some("off") => ctx.state.set("camera.enabled", json!(false)),
            _ => return false,
        };
        true
    }

    fn on_disable(&self, _ctx: &ModuleContext) {
        self.disabled.fetch_add(1, Ordering::SeqCst);
    }
}

/// Consumes every command it sees.
struct CatchAll;

impl AgentModule for CatchAll {
    fn name(&self) -> &str {
        "catch-all"
    }

    fn process_command(&self, _ctx: &ModuleContext, _command: &Command) -> bool {
        true
    }
}

fn registry() -> ModuleRegistry {
    let ctx = ModuleContext::new(Arc::new(TaskQueue::new()));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&ctx.unique), Duration::from_secs(1)));
    ModuleRegistry::new(ctx, scheduler)
}

#[test]
fn enable_seeds_state_binds_and_schedules() {
    let registry = registry();
    let camera = Arc::new(Camera::default());
    registry.enable(camera.clone()).unwrap();

    let ctx = registry.context();
    assert!(registry.is_enabled("camera"));
    assert_eq!(ctx.state.get("camera.enabled"), Some(json!(false)));
    assert_eq!(ctx.state.get("camera.resolution"), Some(json!("720p")));

    let replies = ctx.bus.process("motion", &json!({"room": "hall"}));
    assert_eq!(replies.results(), vec![&json!("camera saw it")]);
    assert_eq!(camera.motions.load(Ordering::SeqCst), 1);
}

#[test]
fn existing_state_wins_over_module_defaults() {
    let registry = registry();
    registry.context().state.set("camera.resolution", json!("1080p"));

    registry.enable(Arc::new(Camera::default())).unwrap();

    assert_eq!(
        registry.context().state.get("camera.resolution"),
        Some(json!("1080p"))
    );
}

#[test]
fn enabling_twice_is_an_error() {
    let registry = registry();
    registry.enable(Arc::new(Camera::default())).unwrap();

    let err = registry.enable(Arc::new(Camera::default())).unwrap_err();
    assert!(matches!(err, Error::ModuleAlreadyEnabled(name) if name == "camera"));
    assert_eq!(registry.context().bus.channel("motion").len(), 1);
}

#[test]
fn disable_releases_bindings_and_jobs() {
    let ctx = ModuleContext::new(Arc::new(TaskQueue::new()));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&ctx.unique), Duration::from_secs(1)));
    let registry = ModuleRegistry::new(ctx, Arc::clone(&scheduler));
    let camera = Arc::new(Camera::default());

    registry.enable(camera.clone()).unwrap();
    assert_eq!(scheduler.job_ids(), vec![JobId::from("camera.check")]);

    registry.disable("camera").unwrap();

    assert!(!registry.is_enabled("camera"));
    assert!(scheduler.job_ids().is_empty());
    assert!(registry.context().bus.channel("motion").is_empty());
    assert_eq!(camera.disabled.load(Ordering::SeqCst), 1);
    // State outlives the module.
    assert!(registry.context().state.contains_key("camera.enabled"));
}

#[test]
fn disabling_unknown_module_is_an_error() {
    let registry = registry();
    assert!(matches!(
        registry.disable("ghost"),
        Err(Error::ModuleNotFound(name)) if name == "ghost"
    ));
}

#[test]
fn disable_all_empties_the_registry() {
    let registry = registry();
    let camera = Arc::new(Camera::default());
    registry.enable(camera.clone()).unwrap();
    registry.enable(Arc::new(CatchAll)).unwrap();
    assert_eq!(registry.names(), ["camera", "catch-all"]);

    registry.disable_all();

    assert!(registry.names().is_empty());
    assert_eq!(camera.disabled.load(Ordering::SeqCst), 1);
}

#[test]
fn dispatch_offers_commands_in_enable_order() {
    let registry = registry();
    registry.enable(Arc::new(Camera::default())).unwrap();
    registry.enable(Arc::new(CatchAll)).unwrap();

    let handled_by = registry.dispatch(&Command::parse("/camera on").unwrap());
    assert_eq!(handled_by.as_deref(), Some("camera"));
    assert_eq!(registry.context().state.get("camera.enabled"), Some(json!(true)));

    let handled_by = registry.dispatch(&Command::parse("lights off").unwrap());
    assert_eq!(handled_by.as_deref(), Some("catch-all"));
}

#[test]
fn unhandled_command_returns_none() {
    let registry = registry();
    registry.enable(Arc::new(Camera::default())).unwrap();
    assert_eq!(registry.dispatch(&Command::new("camera", ["sideways"])), None);
}

#[test]
fn command_parse_normalizes_name() {
    let command = Command::parse("  /Camera  ON now ").unwrap();
    assert_eq!(command.name, "camera");
    assert_eq!(command.args, ["ON", "now"]);
    assert_eq!(command.arg(1), Some("now"));
    assert_eq!(command.arg(2), None);

    assert!(Command::parse("").is_none());
    assert!(Command::parse("   ").is_none());
    assert!(Command::parse("/").is_none());
}

/// Takes its time connecting, to widen any race in `enable`.
struct Slow;

impl AgentModule for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn subscribe(self: Arc<Self>, ctx: &ModuleContext) -> Vec<SignalBinding> {
        std::thread::sleep(Duration::from_millis(100));
        vec![SignalBinding::connect(ctx.bus.channel("slow"), |_| Ok(Value::Null))]
    }
}

#[test]
fn concurrent_enables_of_one_name_admit_one() {
    let registry = registry();

    let results: Vec<_> = std::thread::scope(|s| {
        let threads: Vec<_> = (0..2)
            .map(|_| s.spawn(|| registry.enable(Arc::new(Slow))))
            .collect();
        threads.into_iter().map(|t| t.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(Error::ModuleAlreadyEnabled(name)) if name == "slow"))
    );
    assert_eq!(registry.names(), ["slow"]);
    assert_eq!(registry.context().bus.channel("slow").len(), 1);
}

/// Connects a subscriber, then blows up while scheduling.
struct Broken;

impl AgentModule for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn subscribe(self: Arc<Self>, ctx: &ModuleContext) -> Vec<SignalBinding> {
        vec![SignalBinding::connect(ctx.bus.channel("broken"), |_| Ok(Value::Null))]
    }

    fn schedule(self: Arc<Self>, _ctx: &ModuleContext) -> Vec<ScheduledJob> {
        panic!("bad schedule table");
    }
}

#[test]
fn panicking_hook_rolls_the_enable_back() {
    let registry = registry();

    let err = registry.enable(Arc::new(Broken)).unwrap_err();
    assert!(err.to_string().contains("bad schedule table"), "got {err}");

    assert!(!registry.is_enabled("broken"));
    assert!(registry.context().bus.channel("broken").is_empty());

    // The name is free again.
    let err = registry.enable(Arc::new(Broken)).unwrap_err();
    assert!(!matches!(err, Error::ModuleAlreadyEnabled(_)));
}
