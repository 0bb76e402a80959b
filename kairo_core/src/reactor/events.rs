use std::collections::HashMap;
use std::rc::Rc;

use crate::debug_trace;
use crate::defer::{CallbackReturn, Deferred, DeferredList};
use crate::error::{KairoError, Result};

/// Phase of a system event a trigger is attached to.
///
/// `Before` triggers may return a `Deferred`; the `During` phase does not
/// start until every one of those has fired. `After` results are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerPhase {
    Before,
    During,
    After,
}

/// Opaque handle returned by trigger registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerHandle(u64);

type TriggerFn = Rc<dyn Fn() -> Option<Deferred>>;

struct Trigger {
    id: u64,
    phase: TriggerPhase,
    func: TriggerFn,
}

/// Registry of system-event triggers keyed by `(event, phase)`.
pub(crate) struct TriggerTable {
    triggers: HashMap<String, Vec<Trigger>>,
    next_id: u64,
}

impl TriggerTable {
    pub(crate) fn new() -> TriggerTable {
        TriggerTable { triggers: HashMap::new(), next_id: 0 }
    }

    pub(crate) fn add(
        &mut self,
        phase: TriggerPhase,
        event: &str,
        func: impl Fn() -> Option<Deferred> + 'static,
    ) -> TriggerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.triggers
            .entry(event.to_string())
            .or_default()
            .push(Trigger { id, phase, func: Rc::new(func) });
        TriggerHandle(id)
    }

    pub(crate) fn remove(&mut self, handle: TriggerHandle) -> Result<()> {
        for triggers in self.triggers.values_mut() {
            if let Some(pos) = triggers.iter().position(|t| t.id == handle.0) {
                triggers.remove(pos);
                return Ok(());
            }
        }
        Err(KairoError::UnknownTrigger)
    }

    fn phase_funcs(&self, event: &str, phase: TriggerPhase) -> Vec<TriggerFn> {
        self.triggers
            .get(event)
            .map(|triggers| {
                triggers
                    .iter()
                    .filter(|t| t.phase == phase)
                    .map(|t| Rc::clone(&t.func))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Fire the named event through its three phases.
///
/// The trigger list is snapshotted per phase before running, so triggers
/// may add or remove triggers while firing. `on_complete` runs once the
/// `After` phase has finished, which may be asynchronously later if a
/// `Before` trigger returned an unfired `Deferred`.
pub(crate) fn fire_event(
    table: &std::cell::RefCell<TriggerTable>,
    event: &str,
    on_complete: impl FnOnce() + 'static,
) {
    debug_trace!("Firing system event {:?}", event);
    let before = table.borrow().phase_funcs(event, TriggerPhase::Before);
    let mut gates: Vec<Deferred> = Vec::new();
    for func in before {
        if let Some(d) = func() {
            gates.push(d);
        }
    }

    let during = table.borrow().phase_funcs(event, TriggerPhase::During);
    let after = table.borrow().phase_funcs(event, TriggerPhase::After);
    let finish = move || {
        for func in during {
            let _ = func();
        }
        for func in after {
            let _ = func();
        }
        on_complete();
    };

    if gates.is_empty() {
        finish();
    } else {
        let gate = DeferredList::new(gates, false, false).deferred();
        // Run the remaining phases whether the before-gates succeeded or
        // failed; a failed gate must not wedge shutdown.
        gate.add_both(move |_| {
            finish();
            CallbackReturn::ok(())
        });
    }
}
