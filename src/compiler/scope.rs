//! Local variable resolution.
//!
//! A pre-pass over the tree that decides where every local lives. Locals
//! that some nested block reads or writes are boxed into heap cells shared
//! with the block; all others stay in frame registers. Visibility follows
//! declaration order: a block sees the enclosing locals declared before it.

use std::collections::{HashMap, HashSet};

use crate::ast::{Node, NodeId, NodeKind, Params};

pub type ScopeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Top level, class body or method: nothing outside is visible.
    Hard,
    Block,
}

#[derive(Debug)]
pub struct ScopeInfo {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    /// Locals in declaration order, parameters first.
    pub vars: Vec<String>,
    /// Positional parameters in argument-slot order.
    pub params: Vec<String>,
    pub boxed: HashSet<String>,
}

impl ScopeInfo {
    fn new(kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        ScopeInfo { kind, parent, vars: Vec::new(), params: Vec::new(), boxed: HashSet::new() }
    }

    pub fn is_boxed(&self, name: &str) -> bool {
        self.boxed.contains(name)
    }

    /// Boxed locals in declaration order; their cell numbers follow it.
    pub fn boxed_vars(&self) -> impl Iterator<Item = &String> {
        self.vars.iter().filter(|v| self.boxed.contains(*v))
    }
}

#[derive(Debug, Default)]
pub struct Analysis {
    pub scopes: Vec<ScopeInfo>,
    /// Scope opened by a root, def, defs, class, module or iter node.
    by_node: HashMap<NodeId, ScopeId>,
    /// Declaring scope of each local read or write.
    refs: HashMap<NodeId, ScopeId>,
}

impl Analysis {
    pub fn run(root: &Node) -> Analysis {
        let mut w = Walker { out: Analysis::default(), stack: Vec::new() };
        w.open(root.id, ScopeKind::Hard);
        w.walk(root);
        w.stack.pop();
        w.out
    }

    pub fn scope_of(&self, node: NodeId) -> Option<ScopeId> {
        self.by_node.get(&node).copied()
    }

    pub fn owner(&self, node: NodeId) -> Option<ScopeId> {
        self.refs.get(&node).copied()
    }

    pub fn scope(&self, id: ScopeId) -> &ScopeInfo {
        &self.scopes[id]
    }
}

/// Positional parameter names in slot order: required, optional, rest, post.
pub fn positional(p: &Params) -> Vec<String> {
    p.required
        .iter()
        .cloned()
        .chain(p.optional.iter().map(|o| o.name.clone()))
        .chain(p.rest.iter().cloned())
        .chain(p.post.iter().cloned())
        .collect()
}

struct Walker {
    out: Analysis,
    stack: Vec<ScopeId>,
}

impl Walker {
    fn current(&self) -> ScopeId {
        self.stack.last().copied().unwrap_or_default()
    }

    fn open(&mut self, node: NodeId, kind: ScopeKind) -> ScopeId {
        let parent = self.stack.last().copied();
        let id = self.out.scopes.len();
        self.out.scopes.push(ScopeInfo::new(kind, parent));
        self.out.by_node.insert(node, id);
        self.stack.push(id);
        id
    }

    fn declare(&mut self, scope: ScopeId, name: &str) {
        let vars = &mut self.out.scopes[scope].vars;
        if !vars.iter().any(|v| v == name) {
            vars.push(name.to_string());
        }
    }

    fn params(&mut self, p: &Params) {
        let scope = self.current();
        let names = positional(p);
        for name in names.iter().chain(&p.block) {
            self.declare(scope, name);
        }
        self.out.scopes[scope].params = names;
        for opt in &p.optional {
            self.walk(&opt.value);
        }
    }

    /// Innermost visible scope declaring `name`.
    fn resolve(&self, name: &str) -> Option<ScopeId> {
        for &id in self.stack.iter().rev() {
            let scope = &self.out.scopes[id];
            if scope.vars.iter().any(|v| v == name) {
                return Some(id);
            }
            if scope.kind == ScopeKind::Hard {
                break;
            }
        }
        None
    }

    fn reference(&mut self, node: NodeId, name: &str) {
        let owner = match self.resolve(name) {
            Some(owner) => owner,
            None => {
                let current = self.current();
                self.declare(current, name);
                current
            }
        };
        if owner != self.current() {
            self.out.scopes[owner].boxed.insert(name.to_string());
        }
        self.out.refs.insert(node, owner);
    }

    /// Nearest enclosing method scope, when every scope in between is a block.
    fn method_scope(&self) -> Option<ScopeId> {
        self.stack.iter().rev().copied().find(|&id| self.out.scopes[id].kind == ScopeKind::Hard)
    }

    fn walk(&mut self, node: &Node) {
        match &node.kind {
            NodeKind::Lvar { name } => self.reference(node.id, name),
            NodeKind::Lasgn { name, value } => {
                self.reference(node.id, name);
                if let Some(v) = value {
                    self.walk(v);
                }
            }
            NodeKind::Iter { params, body } => {
                self.open(node.id, ScopeKind::Block);
                self.params(params);
                if let Some(b) = body {
                    self.walk(b);
                }
                self.stack.pop();
            }
            NodeKind::Def { params, body, .. } => {
                self.open(node.id, ScopeKind::Hard);
                self.params(params);
                if let Some(b) = body {
                    self.walk(b);
                }
                self.stack.pop();
            }
            NodeKind::Defs { receiver, params, body, .. } => {
                self.walk(receiver);
                self.open(node.id, ScopeKind::Hard);
                self.params(params);
                if let Some(b) = body {
                    self.walk(b);
                }
                self.stack.pop();
            }
            NodeKind::Class { scope, superclass, body, .. } => {
                scope.iter().chain(superclass).for_each(|n| self.walk(n));
                self.open(node.id, ScopeKind::Hard);
                if let Some(b) = body {
                    self.walk(b);
                }
                self.stack.pop();
            }
            NodeKind::Module { scope, body, .. } => {
                if let Some(s) = scope {
                    self.walk(s);
                }
                self.open(node.id, ScopeKind::Hard);
                if let Some(b) = body {
                    self.walk(b);
                }
                self.stack.pop();
            }
            NodeKind::Zsuper { block } => {
                // Implicit argument forwarding reads every method parameter,
                // possibly from inside a block.
                if let Some(method) = self.method_scope()
                    && method != self.current()
                {
                    let names = self.out.scopes[method].params.clone();
                    self.out.scopes[method].boxed.extend(names);
                }
                if let Some(b) = block {
                    self.walk(b);
                }
            }
            _ => {
                for child in node.children() {
                    self.walk(child);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Program;
    use crate::ast::build::*;

    fn analyze(root: Node) -> (Program, Analysis) {
        let p = Program::new("t.rb", root);
        let a = Analysis::run(&p.root);
        (p, a)
    }

    #[test]
    fn uncaptured_locals_stay_unboxed() {
        let (_, a) = analyze(seq(vec![lasgn("a", int(1)), lasgn("b", lvar("a"))]));
        let top = a.scope(0);
        assert_eq!(top.vars, vec!["a", "b"]);
        assert!(top.boxed.is_empty());
    }

    #[test]
    fn block_reference_boxes_the_outer_local() {
        let (_, a) = analyze(seq(vec![
            lasgn("sum", int(0)),
            lasgn("unused", int(0)),
            with_block(call(array(vec![]), "each", vec![]), params().req("x"), Some(lasgn("sum", lvar("x")))),
        ]));
        let top = a.scope(0);
        assert!(top.is_boxed("sum"));
        assert!(!top.is_boxed("unused"));
        let block = a.scope(1);
        assert_eq!(block.kind, ScopeKind::Block);
        assert_eq!(block.vars, vec!["x"]);
        assert!(block.boxed.is_empty());
    }

    #[test]
    fn locals_declared_after_the_block_are_not_shared() {
        let (_, a) = analyze(seq(vec![
            with_block(fcall("loop", vec![]), params(), Some(lasgn("late", int(1)))),
            lasgn("late", int(2)),
        ]));
        assert!(!a.scope(0).is_boxed("late"));
        assert_eq!(a.scope(1).vars, vec!["late"]);
    }

    #[test]
    fn method_bodies_do_not_see_outer_locals() {
        let (p, a) = analyze(seq(vec![lasgn("x", int(1)), def("f", params(), Some(lvar("x")))]));
        let NodeKind::Seq { stmts } = &p.root.kind else { panic!() };
        let method = a.scope_of(stmts[1].id).unwrap();
        assert_eq!(a.scope(method).vars, vec!["x"]);
        assert!(!a.scope(0).is_boxed("x"));
    }

    #[test]
    fn zsuper_in_a_block_boxes_parameters() {
        let (_, a) = analyze(def(
            "f",
            params().req("a").rest("r"),
            Some(with_block(fcall("tap", vec![]), params(), Some(zsuper()))),
        ));
        let method = a.scope(1);
        assert_eq!(method.params, vec!["a", "r"]);
        assert!(method.is_boxed("a") && method.is_boxed("r"));
    }
}
