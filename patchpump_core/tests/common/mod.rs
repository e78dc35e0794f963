#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use patchpump_core::progress::observer::SessionEvent;
use patchpump_core::pump::SessionPump;
use patchpump_core::session::engine::{OperationContext, PatchEngine};
use patchpump_core::types::types::{OperationKind, OperationResult, ProgressKind, ProgressSample};

/// Logs `lines` numbered lines with a progress sample each, then returns `result`.
pub struct ScriptedEngine {
    pub lines: usize,
    pub result: OperationResult,
}

#[async_trait]
impl PatchEngine for ScriptedEngine {
    async fn run(&self, _kind: OperationKind, ctx: OperationContext) -> OperationResult {
        for i in 0..self.lines {
            ctx.log(format!("line {}", i));
            ctx.report_progress(
                ProgressKind::Current,
                ProgressSample::new(i as f32, format!("step {}", i)),
            );
        }
        ctx.report_progress(ProgressKind::Overall, ProgressSample::new(100.0, "done"));
        self.result.clone()
    }
}

/// Runs until `gate` is notified, then succeeds.
pub struct GateEngine {
    pub gate: Arc<Notify>,
}

#[async_trait]
impl PatchEngine for GateEngine {
    async fn run(&self, _kind: OperationKind, ctx: OperationContext) -> OperationResult {
        ctx.log("waiting for gate");
        self.gate.notified().await;
        ctx.log("gate opened");
        OperationResult::Success
    }
}

/// Runs until cancelled, then reports a plain failure.
pub struct WaitForCancelEngine;

#[async_trait]
impl PatchEngine for WaitForCancelEngine {
    async fn run(&self, _kind: OperationKind, ctx: OperationContext) -> OperationResult {
        ctx.log("working");
        ctx.cancelled().await;
        ctx.log("stopping");
        OperationResult::Failed("stopped".to_string())
    }
}

pub struct PanickingEngine;

#[async_trait]
impl PatchEngine for PanickingEngine {
    async fn run(&self, _kind: OperationKind, ctx: OperationContext) -> OperationResult {
        ctx.log("about to fail hard");
        panic!("engine bug");
    }
}

pub type Recorded = Rc<RefCell<Vec<SessionEvent>>>;

/// Subscribes a recorder for every event kind.
pub fn record_all(pump: &mut SessionPump) -> Recorded {
    let events: Recorded = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    pump.subscribe_all(move |event: &SessionEvent| sink.borrow_mut().push(event.clone()));
    events
}

/// Ticks once per "frame" until every session has reported its result.
/// Returns the number of ticks taken.
pub async fn pump_until_idle(pump: &mut SessionPump, max_ticks: usize) -> usize {
    for tick in 0..max_ticks {
        pump.tick();
        if !pump.has_active_sessions() {
            return tick + 1;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("sessions still active after {} ticks", max_ticks);
}

pub fn finished_results(events: &[SessionEvent]) -> Vec<OperationResult> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Finished { result, .. } => Some(result.clone()),
            _ => None,
        })
        .collect()
}

pub fn log_lines(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Log { entry, .. } => Some(entry.line.clone()),
            _ => None,
        })
        .collect()
}
