//! Freeze / pause control shared between a worker pool and its operators.
//!
//! Besides a global freeze switch that stops workers from taking new items,
//! an [`Action`] carries one pending control event per named plan. An
//! operator posts an event with [`Action::event`]; the task executing that
//! plan observes it with [`Action::pick_event`] and acknowledges it with
//! [`Action::done`], which removes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use tokio::sync::broadcast;

const NOTIFY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Pause,
    Resume,
    Start,
    Cancel,
    Restart,
    Delete,
    Fix,
    Freeze,
    Unfreeze,
    Status,
    Resize,
    Mode,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Pause => "pause",
            EventKind::Resume => "resume",
            EventKind::Start => "start",
            EventKind::Cancel => "cancel",
            EventKind::Restart => "restart",
            EventKind::Delete => "delete",
            EventKind::Fix => "fix",
            EventKind::Freeze => "freeze",
            EventKind::Unfreeze => "unfreeze",
            EventKind::Status => "status",
            EventKind::Resize => "resize",
            EventKind::Mode => "mode",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "pause" => EventKind::Pause,
            "resume" => EventKind::Resume,
            "start" => EventKind::Start,
            "cancel" => EventKind::Cancel,
            "restart" => EventKind::Restart,
            "delete" => EventKind::Delete,
            "fix" => EventKind::Fix,
            "freeze" => EventKind::Freeze,
            "unfreeze" => EventKind::Unfreeze,
            "status" => EventKind::Status,
            "resize" => EventKind::Resize,
            "mode" => EventKind::Mode,
            other => anyhow::bail!("unknown control event {other:?}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Open,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub action: EventKind,
    pub state: EventState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Running,
    /// Single-step: operators advance a plan one step at a time.
    Step,
}

#[derive(Debug, Default)]
struct ActionState {
    mode: Mode,
    frozen: bool,
    redispatch: bool,
    events: HashMap<String, Event>,
}

#[derive(Debug)]
pub struct Action {
    state: Mutex<ActionState>,
    notify: broadcast::Sender<String>,
}

impl Default for Action {
    fn default() -> Self {
        Self::new()
    }
}

impl Action {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Action {
            state: Mutex::new(ActionState::default()),
            notify,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ActionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_redispatch(&self, redispatch: bool) {
        self.state().redispatch = redispatch;
    }

    pub fn redispatch(&self) -> bool {
        self.state().redispatch
    }

    pub fn set_mode(&self, mode: Mode) {
        self.state().mode = mode;
    }

    pub fn mode(&self) -> Mode {
        self.state().mode
    }

    pub fn single_step_mode(&self) -> bool {
        self.mode() == Mode::Step
    }

    pub fn freeze(&self) {
        log::info!("freezing workers");
        self.state().frozen = true;
    }

    pub fn unfreeze(&self) {
        log::info!("unfreezing workers");
        self.state().frozen = false;
    }

    pub fn frozen(&self) -> bool {
        self.state().frozen
    }

    /// Post a control event for `plan`, replacing any earlier one, and
    /// notify watchers.
    pub fn event(&self, plan: &str, action: EventKind) {
        self.state().events.insert(
            plan.to_string(),
            Event {
                action,
                state: EventState::Open,
            },
        );
        log::info!("received control event: plan [{plan}] requested [{action}]");
        // No watcher is fine:
        let _ = self.notify.send(plan.to_string());
    }

    /// Subscribe to the names of plans that received an event.
    pub fn watch(&self) -> broadcast::Receiver<String> {
        self.notify.subscribe()
    }

    /// Snapshot of all pending events.
    pub fn events(&self) -> HashMap<String, Event> {
        self.state().events.clone()
    }

    /// The open event for `plan`, if any.
    pub fn pick_event(&self, plan: &str) -> Option<Event> {
        let state = self.state();
        let ev = state.events.get(plan)?;
        if ev.state != EventState::Open {
            return None;
        }
        log::debug!("pick event {} for plan {plan}", ev.action);
        Some(*ev)
    }

    /// Acknowledge `action` for `plan`, removing the event. A mismatching
    /// action leaves the pending event in place.
    pub fn done(&self, plan: &str, action: EventKind) -> bool {
        let mut state = self.state();
        let held = match state.events.get(plan) {
            Some(ev) => ev.action,
            None => {
                log::info!("done event: no plan [{plan}] found, event={action}");
                return false;
            }
        };
        if held != action {
            log::info!("done event: plan [{plan}] holds [{held}], not [{action}]");
            return false;
        }
        state.events.remove(plan);
        log::info!("done event: [{action}] for plan [{plan}]");
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_freeze() {
        let a = Action::new();
        assert!(!a.frozen());
        a.freeze();
        assert!(a.frozen());
        a.unfreeze();
        assert!(!a.frozen());
    }

    #[tokio::test]
    async fn test_event_consumed_once() {
        let a = Action::new();
        let mut watch = a.watch();

        a.event("plan-1", EventKind::Pause);
        assert_eq!(watch.recv().await.unwrap(), "plan-1");

        let ev = a.pick_event("plan-1").unwrap();
        assert_eq!(ev.action, EventKind::Pause);
        assert_eq!(ev.state, EventState::Open);
        // Picking does not consume:
        assert!(a.pick_event("plan-1").is_some());

        assert!(!a.done("plan-1", EventKind::Resume));
        assert!(a.done("plan-1", EventKind::Pause));
        assert!(a.pick_event("plan-1").is_none());
        assert!(!a.done("plan-1", EventKind::Pause));
    }

    #[test]
    fn test_event_kind_parse() {
        assert_eq!("cancel".parse::<EventKind>().unwrap(), EventKind::Cancel);
        assert!("explode".parse::<EventKind>().is_err());
    }
}
