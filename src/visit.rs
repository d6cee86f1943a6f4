//! Dispatch over parse trees by node name.
//!
//! A [`NodeVisitor`] is a table from rule symbols to handlers. It does not
//! walk anything on its own: a handler receives the visitor back and recurses
//! into whichever children it cares about, in whatever order it likes, so
//! both bottom-up and top-down interpretations work. The usual customer is
//! code that re-reads a parsed grammar description into an [`Expr`] tree.
//!
//! [`Expr`]: crate::Expr

use std::collections::HashMap;

use thiserror::Error;

use crate::{node::Node, Symbol};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VisitError {
    #[error("no handler registered for node name #{0}")]
    Unhandled(Symbol),
    #[error("cannot dispatch on an unnamed node")]
    Unnamed,
}

type Handler<'h, T> = Box<dyn Fn(&NodeVisitor<'h, T>, &Node) -> Result<T, VisitError> + 'h>;

pub struct NodeVisitor<'h, T> {
    handlers: HashMap<Symbol, Handler<'h, T>>,
}

impl<'h, T> NodeVisitor<'h, T> {
    pub fn new() -> Self {
        NodeVisitor {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a node name, replacing any previous one.
    pub fn on<F>(&mut self, name: Symbol, handler: F)
    where
        F: Fn(&NodeVisitor<'h, T>, &Node) -> Result<T, VisitError> + 'h,
    {
        self.handlers.insert(name, Box::new(handler));
    }

    /// Run the handler registered for this node's name.
    pub fn visit(&self, node: &Node) -> Result<T, VisitError> {
        let name = node.name.ok_or(VisitError::Unnamed)?;
        let handler = self
            .handlers
            .get(&name)
            .ok_or(VisitError::Unhandled(name))?;
        handler(self, node)
    }
}

impl<T> Default for NodeVisitor<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}
