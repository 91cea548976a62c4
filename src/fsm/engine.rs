use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use thiserror::Error;
use tracing::trace;

/// Work bound to a transition. Runs after the state has been committed.
pub type Action<C, E> = fn(&mut C) -> Result<(), E>;

/// Raised when a message is sent that the current state does not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {message:?} is not accepted in state {state:?}")]
pub struct InvalidTransition<S, M> {
    pub state: S,
    pub message: M,
}

/// One registered edge of the transition table.
pub struct Transition<S, M, C, E> {
    pub from: S,
    pub message: M,
    pub to: S,
    pub action: Option<Action<C, E>>,
    pub auto: Option<M>,
}

/// Table-driven finite state machine.
///
/// `S` is the state tag, `M` the message tag, `C` the context handed to every
/// action and `E` the error actions may raise. The table is built with
/// [`add`](StateMachine::add) and driven with [`send`](StateMachine::send).
pub struct StateMachine<S, M, C, E> {
    initial: S,
    state: S,
    transitions: Vec<Transition<S, M, C, E>>,
    index: HashMap<(S, M), usize>,
}

impl<S, M, C, E> StateMachine<S, M, C, E>
where
    S: Copy + Eq + Hash + Debug,
    M: Copy + Eq + Hash + Debug,
    E: From<InvalidTransition<S, M>>,
{
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            state: initial,
            transitions: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register `(from, message) -> (to, action, auto)`.
    ///
    /// Registering the same `(from, message)` pair twice replaces the earlier
    /// entry in place, keeping its position in the table.
    pub fn add(
        &mut self,
        from: S,
        message: M,
        to: S,
        action: Option<Action<C, E>>,
        auto: Option<M>,
    ) -> &mut Self {
        let transition = Transition {
            from,
            message,
            to,
            action,
            auto,
        };
        match self.index.get(&(from, message)) {
            Some(&i) => self.transitions[i] = transition,
            None => {
                self.index.insert((from, message), self.transitions.len());
                self.transitions.push(transition);
            }
        }
        self
    }

    /// Send `message` from the current state.
    ///
    /// The target state is committed before the action runs, so a failing
    /// action leaves the machine in the target state. Returns the transition's
    /// auto message, if any, for the caller to chain.
    pub fn send(&mut self, context: &mut C, message: M) -> Result<Option<M>, E> {
        let Some(&i) = self.index.get(&(self.state, message)) else {
            return Err(InvalidTransition {
                state: self.state,
                message,
            }
            .into());
        };
        let transition = &self.transitions[i];
        let (to, action, auto) = (transition.to, transition.action, transition.auto);

        trace!(from = ?self.state, ?message, ?to, "transition");
        self.state = to;

        if let Some(action) = action {
            action(context)?;
        }
        Ok(auto)
    }

    /// True iff the current state accepts `message`.
    pub fn can_send(&self, message: M) -> bool {
        self.index.contains_key(&(self.state, message))
    }

    /// State that `message` would lead to from the current state.
    pub fn target(&self, message: M) -> Option<S> {
        self.index
            .get(&(self.state, message))
            .map(|&i| self.transitions[i].to)
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn initial_state(&self) -> S {
        self.initial
    }

    /// Registered transitions in the order they were added.
    pub fn transitions(&self) -> impl Iterator<Item = &Transition<S, M, C, E>> {
        self.transitions.iter()
    }
}
