//! Graphviz export of a transition table.

use std::fmt::{Debug, Write};
use std::hash::Hash;

use super::engine::{InvalidTransition, StateMachine};

impl<S, M, C, E> StateMachine<S, M, C, E>
where
    S: Copy + Eq + Hash + Debug,
    M: Copy + Eq + Hash + Debug,
    E: From<InvalidTransition<S, M>>,
{
    /// Render the table as a DOT digraph.
    ///
    /// Nodes appear in order of first mention, the initial state drawn as a
    /// double circle. Edges are labelled with their message; an auto message
    /// is appended as `/ auto`, and edges without an action are dashed.
    pub fn to_dot(&self, name: &str) -> String {
        let mut states: Vec<S> = vec![self.initial_state()];
        for t in self.transitions() {
            for s in [t.from, t.to] {
                if !states.contains(&s) {
                    states.push(s);
                }
            }
        }

        let mut out = String::new();
        let _ = writeln!(out, "digraph {name} {{");
        let _ = writeln!(out, "    rankdir=LR;");
        for s in &states {
            let shape = if *s == self.initial_state() {
                "doublecircle"
            } else {
                "circle"
            };
            let _ = writeln!(out, "    \"{s:?}\" [shape={shape}];");
        }
        for t in self.transitions() {
            let mut label = format!("{:?}", t.message);
            if let Some(auto) = t.auto {
                let _ = write!(label, " / {auto:?}");
            }
            let style = if t.action.is_some() { "solid" } else { "dashed" };
            let _ = writeln!(
                out,
                "    \"{:?}\" -> \"{:?}\" [label=\"{label}\", style={style}];",
                t.from, t.to
            );
        }
        out.push_str("}\n");
        out
    }
}
