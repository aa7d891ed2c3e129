//! Deterministic finite-state machine engine
//!
//! The controller's control core. States and events are small `Copy` ids
//! (fieldless enums in practice); each state carries a transition function
//! from event id to destination state id. Enter/exit behavior is not stored
//! as callbacks: the machine invokes `Hooks::on_enter`/`Hooks::on_exit` on a
//! caller-supplied object, dispatched by state id.
//!
//! Hooks cannot call `post_event` on the machine they are running under.
//! Instead they enqueue follow-up events into a [`Postbox`], which the engine
//! drains iteratively once the current transition has completed. Nested
//! transitions work, unbounded recursion cannot.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;

/// Follow-up events drained after the current transition completes
const MAX_FOLLOW_UPS: usize = 32;

/// Enter/exit behavior, dispatched by state id
pub trait Hooks<S, E> {
    fn on_enter(&mut self, state: S, postbox: &mut Postbox<E>);

    fn on_exit(&mut self, _state: S) {}
}

/// Queue of events a hook wants posted after the current transition
pub struct Postbox<E> {
    queue: VecDeque<E>,
}

impl<E> Postbox<E> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Post a follow-up event; it runs after the current transition finishes
    pub fn post(&mut self, event: E) {
        self.queue.push_back(event);
    }
}

/// Result of posting one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<S> {
    /// Machine has not been started; the event was dropped
    Ignored,
    /// The active state has no transition for this event; state unchanged
    Rejected,
    /// Normal transition; enter/exit hooks have already run
    Transition { from: S, to: S },
    /// Transition into the terminal state; reported after its enter hooks
    Complete { from: S, to: S },
    /// A transition pointed at an unregistered state. The machine is
    /// disabled until `begin` is called again.
    Faulted { from: S },
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError<S: fmt::Debug, E: fmt::Debug> {
    #[error("state {0:?} registered more than once")]
    DuplicateState(S),

    #[error("state {state:?} maps event {event:?} more than once")]
    DuplicateTransition { state: S, event: E },

    #[error("no initial state registered")]
    NoInitialState,
}

/// Transition table for one state, built with fluent syntax
pub struct StateSpec<S, E> {
    transitions: Vec<(E, S)>,
}

impl<S, E> StateSpec<S, E> {
    pub fn new() -> Self {
        Self {
            transitions: Vec::new(),
        }
    }

    /// Map `event` to the destination state `to`
    pub fn on(mut self, event: E, to: S) -> Self {
        self.transitions.push((event, to));
        self
    }
}

impl<S, E> Default for StateSpec<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Assembles a [`Machine`], rejecting duplicate registrations at build time
pub struct MachineBuilder<S, E> {
    states: Vec<(S, StateSpec<S, E>)>,
    initial: Option<S>,
    terminal: Option<S>,
}

impl<S, E> MachineBuilder<S, E>
where
    S: Copy + Eq + Hash + fmt::Debug,
    E: Copy + Eq + Hash + fmt::Debug,
{
    /// Register the entry-point state
    pub fn initial(mut self, id: S, spec: StateSpec<S, E>) -> Self {
        self.initial = Some(id);
        self.states.push((id, spec));
        self
    }

    /// Register an ordinary state
    pub fn state(mut self, id: S, spec: StateSpec<S, E>) -> Self {
        self.states.push((id, spec));
        self
    }

    /// Register the state whose entry reports machine completion
    pub fn terminal(mut self, id: S, spec: StateSpec<S, E>) -> Self {
        self.terminal = Some(id);
        self.states.push((id, spec));
        self
    }

    pub fn build(self) -> Result<Machine<S, E>, BuildError<S, E>> {
        let initial = self.initial.ok_or(BuildError::NoInitialState)?;

        let mut states = HashMap::new();
        for (id, spec) in self.states {
            let mut table = HashMap::new();
            for (event, to) in spec.transitions {
                if table.insert(event, to).is_some() {
                    return Err(BuildError::DuplicateTransition { state: id, event });
                }
            }
            if states.insert(id, table).is_some() {
                return Err(BuildError::DuplicateState(id));
            }
        }

        Ok(Machine {
            states,
            initial,
            terminal: self.terminal,
            current: None,
        })
    }
}

/// A deterministic finite-state machine
pub struct Machine<S, E> {
    states: HashMap<S, HashMap<E, S>>,
    initial: S,
    terminal: Option<S>,
    current: Option<S>,
}

impl<S, E> Machine<S, E>
where
    S: Copy + Eq + Hash + fmt::Debug,
    E: Copy + Eq + Hash + fmt::Debug,
{
    pub fn builder() -> MachineBuilder<S, E> {
        MachineBuilder {
            states: Vec::new(),
            initial: None,
            terminal: None,
        }
    }

    /// The active state, `None` before `begin` or after a fault
    pub fn current(&self) -> Option<S> {
        self.current
    }

    /// Start (or restart) the machine at the initial state
    pub fn begin<H: Hooks<S, E>>(&mut self, hooks: &mut H) -> Outcome<S> {
        self.current = Some(self.initial);

        let mut postbox = Postbox::new();
        hooks.on_enter(self.initial, &mut postbox);

        let outcome = if self.terminal == Some(self.initial) {
            Outcome::Complete {
                from: self.initial,
                to: self.initial,
            }
        } else {
            Outcome::Transition {
                from: self.initial,
                to: self.initial,
            }
        };

        self.drain(&mut postbox, hooks);
        outcome
    }

    /// Post an event against the active state's transition table
    pub fn post_event<H: Hooks<S, E>>(&mut self, event: E, hooks: &mut H) -> Outcome<S> {
        let mut postbox = Postbox::new();
        let outcome = self.step(event, hooks, &mut postbox);
        self.drain(&mut postbox, hooks);
        outcome
    }

    fn step<H: Hooks<S, E>>(
        &mut self,
        event: E,
        hooks: &mut H,
        postbox: &mut Postbox<E>,
    ) -> Outcome<S> {
        // A never-started (or faulted) machine drops events
        let Some(from) = self.current else {
            return Outcome::Ignored;
        };

        let Some(&to) = self.states.get(&from).and_then(|table| table.get(&event)) else {
            log::debug!("no transition for {:?} in {:?}", event, from);
            return Outcome::Rejected;
        };

        if !self.states.contains_key(&to) {
            // Transition into an unregistered state is a configuration
            // defect; disable the machine until begin() restarts it
            log::error!("transition {:?} -> {:?} targets an unregistered state", from, to);
            self.current = None;
            return Outcome::Faulted { from };
        }

        hooks.on_exit(from);
        self.current = Some(to);
        hooks.on_enter(to, postbox);

        if self.terminal == Some(to) {
            Outcome::Complete { from, to }
        } else {
            Outcome::Transition { from, to }
        }
    }

    fn drain<H: Hooks<S, E>>(&mut self, postbox: &mut Postbox<E>, hooks: &mut H) {
        let mut handled = 0;
        while let Some(event) = postbox.queue.pop_front() {
            if handled >= MAX_FOLLOW_UPS {
                log::warn!("follow-up event limit reached, dropping {:?}", event);
                postbox.queue.clear();
                return;
            }
            handled += 1;
            self.step(event, hooks, postbox);
        }
    }
}
