//! Serialized AST consumed by the compiler.
//!
//! The tree comes from an external parser as JSON. Every node is tagged by
//! `type` and exposes its children through named roles. Ids are assigned on
//! load (pre-order, program unique) and key the block-template memo.

use serde::{Deserialize, Serialize};

pub mod build;

pub type NodeId = u32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default, skip_serializing)]
    pub id: NodeId,
    #[serde(default)]
    pub line: u32,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Declared parameter list of a method or block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub required: Vec<String>,
    pub optional: Vec<OptParam>,
    pub rest: Option<String>,
    /// Required parameters after the rest parameter.
    pub post: Vec<String>,
    pub block: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptParam {
    pub name: String,
    pub value: Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct When {
    pub patterns: Vec<Node>,
    #[serde(default)]
    pub body: Option<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescueClause {
    /// Empty means `StandardError`.
    #[serde(default)]
    pub classes: Vec<Node>,
    /// Assignment target for `=> e`, without a value.
    #[serde(default)]
    pub var: Option<Node>,
    #[serde(default)]
    pub body: Option<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Nil,
    True,
    False,
    #[serde(rename = "self")]
    SelfRef,
    Int { value: i64 },
    Float { value: f64 },
    Str { value: String },
    /// Interpolated string; each part is converted with `to_s`.
    Dstr { parts: Vec<Node> },
    Sym { name: String },
    Array { elements: Vec<Node> },
    Splat { value: Box<Node> },
    /// `&expr` in an argument list.
    BlockPass { value: Box<Node> },

    Lvar { name: String },
    Lasgn { name: String, #[serde(default)] value: Option<Box<Node>> },
    Ivar { name: String },
    Iasgn { name: String, #[serde(default)] value: Option<Box<Node>> },
    Cvar { name: String },
    Cvasgn { name: String, #[serde(default)] value: Option<Box<Node>> },
    Gvar { name: String },
    Gasgn { name: String, #[serde(default)] value: Option<Box<Node>> },
    Const {
        #[serde(default)]
        scope: Option<Box<Node>>,
        #[serde(default)]
        top: bool,
        name: String,
    },
    Cdecl {
        #[serde(default)]
        scope: Option<Box<Node>>,
        name: String,
        #[serde(default)]
        value: Option<Box<Node>>,
    },
    /// `recv.name = v` / `recv[i] = v`. `name` is the setter selector; the
    /// assigned value is the last argument unless this is a masgn target.
    AttrAsgn { receiver: Box<Node>, name: String, #[serde(default)] args: Vec<Node> },
    /// `a, (b, c), *d, e = value`. Nested targets carry no value.
    Masgn {
        #[serde(default)]
        pre: Vec<Node>,
        #[serde(default)]
        splat: Option<Box<Node>>,
        #[serde(default)]
        post: Vec<Node>,
        #[serde(default)]
        value: Option<Box<Node>>,
    },
    /// `target op= value`. The target is a variable read, an attribute call
    /// without args, or an index call (`[]`).
    OpAsgn { target: Box<Node>, op: String, value: Box<Node> },

    Call {
        #[serde(default)]
        receiver: Option<Box<Node>>,
        name: String,
        #[serde(default)]
        args: Vec<Node>,
        /// An `iter` literal or a `block_pass`.
        #[serde(default)]
        block: Option<Box<Node>>,
    },
    /// Bare identifier that is not a local variable.
    Vcall { name: String },
    Iter {
        #[serde(default)]
        params: Params,
        #[serde(default)]
        body: Option<Box<Node>>,
    },
    Super {
        #[serde(default)]
        args: Vec<Node>,
        #[serde(default)]
        block: Option<Box<Node>>,
    },
    /// `super` without parentheses: forwards the current arguments.
    Zsuper { #[serde(default)] block: Option<Box<Node>> },
    Yield { #[serde(default)] args: Vec<Node> },

    Not { value: Box<Node> },
    And { left: Box<Node>, right: Box<Node> },
    Or { left: Box<Node>, right: Box<Node> },
    If {
        cond: Box<Node>,
        #[serde(default, rename = "then")]
        then_body: Option<Box<Node>>,
        #[serde(default, rename = "else")]
        else_body: Option<Box<Node>>,
    },
    While {
        cond: Box<Node>,
        #[serde(default)]
        body: Option<Box<Node>>,
        /// `begin ... end while cond`: body runs before the first test.
        #[serde(default)]
        post: bool,
    },
    Until {
        cond: Box<Node>,
        #[serde(default)]
        body: Option<Box<Node>>,
        #[serde(default)]
        post: bool,
    },
    Case {
        #[serde(default)]
        subject: Option<Box<Node>>,
        whens: Vec<When>,
        #[serde(default, rename = "else")]
        else_body: Option<Box<Node>>,
    },
    Begin {
        #[serde(default)]
        body: Option<Box<Node>>,
        #[serde(default)]
        rescues: Vec<RescueClause>,
        #[serde(default, rename = "else")]
        else_body: Option<Box<Node>>,
        #[serde(default)]
        ensure: Option<Box<Node>>,
    },
    Seq { stmts: Vec<Node> },

    Return { #[serde(default)] value: Option<Box<Node>> },
    Break { #[serde(default)] value: Option<Box<Node>> },
    Next { #[serde(default)] value: Option<Box<Node>> },
    Redo,
    Retry,

    Def {
        name: String,
        #[serde(default)]
        params: Params,
        #[serde(default)]
        body: Option<Box<Node>>,
    },
    Defs {
        receiver: Box<Node>,
        name: String,
        #[serde(default)]
        params: Params,
        #[serde(default)]
        body: Option<Box<Node>>,
    },
    Class {
        #[serde(default)]
        scope: Option<Box<Node>>,
        name: String,
        #[serde(default)]
        superclass: Option<Box<Node>>,
        #[serde(default)]
        body: Option<Box<Node>>,
    },
    Module {
        #[serde(default)]
        scope: Option<Box<Node>>,
        name: String,
        #[serde(default)]
        body: Option<Box<Node>>,
    },
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Node { id: 0, line: 0, kind }
    }

    pub fn at(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    /// Short kind name, as it appears in the JSON `type` tag.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Nil => "nil",
            NodeKind::True => "true",
            NodeKind::False => "false",
            NodeKind::SelfRef => "self",
            NodeKind::Int { .. } => "int",
            NodeKind::Float { .. } => "float",
            NodeKind::Str { .. } => "str",
            NodeKind::Dstr { .. } => "dstr",
            NodeKind::Sym { .. } => "sym",
            NodeKind::Array { .. } => "array",
            NodeKind::Splat { .. } => "splat",
            NodeKind::BlockPass { .. } => "block_pass",
            NodeKind::Lvar { .. } => "lvar",
            NodeKind::Lasgn { .. } => "lasgn",
            NodeKind::Ivar { .. } => "ivar",
            NodeKind::Iasgn { .. } => "iasgn",
            NodeKind::Cvar { .. } => "cvar",
            NodeKind::Cvasgn { .. } => "cvasgn",
            NodeKind::Gvar { .. } => "gvar",
            NodeKind::Gasgn { .. } => "gasgn",
            NodeKind::Const { .. } => "const",
            NodeKind::Cdecl { .. } => "cdecl",
            NodeKind::AttrAsgn { .. } => "attr_asgn",
            NodeKind::Masgn { .. } => "masgn",
            NodeKind::OpAsgn { .. } => "op_asgn",
            NodeKind::Call { .. } => "call",
            NodeKind::Vcall { .. } => "vcall",
            NodeKind::Iter { .. } => "iter",
            NodeKind::Super { .. } => "super",
            NodeKind::Zsuper { .. } => "zsuper",
            NodeKind::Yield { .. } => "yield",
            NodeKind::Not { .. } => "not",
            NodeKind::And { .. } => "and",
            NodeKind::Or { .. } => "or",
            NodeKind::If { .. } => "if",
            NodeKind::While { .. } => "while",
            NodeKind::Until { .. } => "until",
            NodeKind::Case { .. } => "case",
            NodeKind::Begin { .. } => "begin",
            NodeKind::Seq { .. } => "seq",
            NodeKind::Return { .. } => "return",
            NodeKind::Break { .. } => "break",
            NodeKind::Next { .. } => "next",
            NodeKind::Redo => "redo",
            NodeKind::Retry => "retry",
            NodeKind::Def { .. } => "def",
            NodeKind::Defs { .. } => "defs",
            NodeKind::Class { .. } => "class",
            NodeKind::Module { .. } => "module",
        }
    }

    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&Node> {
        let mut out: Vec<&Node> = Vec::new();
        fn opt<'a>(out: &mut Vec<&'a Node>, n: &'a Option<Box<Node>>) {
            if let Some(n) = n {
                out.push(n);
            }
        }
        fn params<'a>(out: &mut Vec<&'a Node>, p: &'a Params) {
            out.extend(p.optional.iter().map(|o| &o.value));
        }
        match &self.kind {
            NodeKind::Nil
            | NodeKind::True
            | NodeKind::False
            | NodeKind::SelfRef
            | NodeKind::Int { .. }
            | NodeKind::Float { .. }
            | NodeKind::Str { .. }
            | NodeKind::Sym { .. }
            | NodeKind::Lvar { .. }
            | NodeKind::Ivar { .. }
            | NodeKind::Cvar { .. }
            | NodeKind::Gvar { .. }
            | NodeKind::Vcall { .. }
            | NodeKind::Redo
            | NodeKind::Retry => {}
            NodeKind::Dstr { parts } => out.extend(parts),
            NodeKind::Array { elements } => out.extend(elements),
            NodeKind::Seq { stmts } => out.extend(stmts),
            NodeKind::Yield { args } => out.extend(args),
            NodeKind::Splat { value } | NodeKind::BlockPass { value } | NodeKind::Not { value } => out.push(value),
            NodeKind::Lasgn { value, .. }
            | NodeKind::Iasgn { value, .. }
            | NodeKind::Cvasgn { value, .. }
            | NodeKind::Gasgn { value, .. }
            | NodeKind::Return { value }
            | NodeKind::Break { value }
            | NodeKind::Next { value } => opt(&mut out, value),
            NodeKind::Const { scope, .. } => opt(&mut out, scope),
            NodeKind::Cdecl { scope, value, .. } => {
                opt(&mut out, scope);
                opt(&mut out, value);
            }
            NodeKind::AttrAsgn { receiver, args, .. } => {
                out.push(receiver);
                out.extend(args);
            }
            NodeKind::Masgn { pre, splat, post, value } => {
                opt(&mut out, value);
                out.extend(pre);
                opt(&mut out, splat);
                out.extend(post);
            }
            NodeKind::OpAsgn { target, value, .. } => {
                out.push(target);
                out.push(value);
            }
            NodeKind::Call { receiver, args, block, .. } => {
                opt(&mut out, receiver);
                out.extend(args);
                opt(&mut out, block);
            }
            NodeKind::Iter { params: p, body } => {
                params(&mut out, p);
                opt(&mut out, body);
            }
            NodeKind::Super { args, block } => {
                out.extend(args);
                opt(&mut out, block);
            }
            NodeKind::Zsuper { block } => opt(&mut out, block),
            NodeKind::And { left, right } | NodeKind::Or { left, right } => {
                out.push(left);
                out.push(right);
            }
            NodeKind::If { cond, then_body, else_body } => {
                out.push(cond);
                opt(&mut out, then_body);
                opt(&mut out, else_body);
            }
            NodeKind::While { cond, body, .. } | NodeKind::Until { cond, body, .. } => {
                out.push(cond);
                opt(&mut out, body);
            }
            NodeKind::Case { subject, whens, else_body } => {
                opt(&mut out, subject);
                for w in whens {
                    out.extend(&w.patterns);
                    out.extend(&w.body);
                }
                opt(&mut out, else_body);
            }
            NodeKind::Begin { body, rescues, else_body, ensure } => {
                opt(&mut out, body);
                for r in rescues {
                    out.extend(&r.classes);
                    out.extend(&r.var);
                    out.extend(&r.body);
                }
                opt(&mut out, else_body);
                opt(&mut out, ensure);
            }
            NodeKind::Def { params: p, body, .. } => {
                params(&mut out, p);
                opt(&mut out, body);
            }
            NodeKind::Defs { receiver, params: p, body, .. } => {
                out.push(receiver);
                params(&mut out, p);
                opt(&mut out, body);
            }
            NodeKind::Class { scope, superclass, body, .. } => {
                opt(&mut out, scope);
                opt(&mut out, superclass);
                opt(&mut out, body);
            }
            NodeKind::Module { scope, body, .. } => {
                opt(&mut out, scope);
                opt(&mut out, body);
            }
        }
        out
    }

    fn children_mut(&mut self) -> Vec<&mut Node> {
        let mut out: Vec<&mut Node> = Vec::new();
        fn opt<'a>(out: &mut Vec<&'a mut Node>, n: &'a mut Option<Box<Node>>) {
            if let Some(n) = n {
                out.push(n);
            }
        }
        match &mut self.kind {
            NodeKind::Nil
            | NodeKind::True
            | NodeKind::False
            | NodeKind::SelfRef
            | NodeKind::Int { .. }
            | NodeKind::Float { .. }
            | NodeKind::Str { .. }
            | NodeKind::Sym { .. }
            | NodeKind::Lvar { .. }
            | NodeKind::Ivar { .. }
            | NodeKind::Cvar { .. }
            | NodeKind::Gvar { .. }
            | NodeKind::Vcall { .. }
            | NodeKind::Redo
            | NodeKind::Retry => {}
            NodeKind::Dstr { parts: v }
            | NodeKind::Array { elements: v }
            | NodeKind::Seq { stmts: v }
            | NodeKind::Yield { args: v } => out.extend(v.iter_mut()),
            NodeKind::Splat { value } | NodeKind::BlockPass { value } | NodeKind::Not { value } => out.push(value),
            NodeKind::Lasgn { value, .. }
            | NodeKind::Iasgn { value, .. }
            | NodeKind::Cvasgn { value, .. }
            | NodeKind::Gasgn { value, .. }
            | NodeKind::Return { value }
            | NodeKind::Break { value }
            | NodeKind::Next { value } => opt(&mut out, value),
            NodeKind::Const { scope, .. } => opt(&mut out, scope),
            NodeKind::Cdecl { scope, value, .. } => {
                opt(&mut out, scope);
                opt(&mut out, value);
            }
            NodeKind::AttrAsgn { receiver, args, .. } => {
                out.push(receiver);
                out.extend(args.iter_mut());
            }
            NodeKind::Masgn { pre, splat, post, value } => {
                opt(&mut out, value);
                out.extend(pre.iter_mut());
                opt(&mut out, splat);
                out.extend(post.iter_mut());
            }
            NodeKind::OpAsgn { target, value, .. } => {
                out.push(target);
                out.push(value);
            }
            NodeKind::Call { receiver, args, block, .. } => {
                opt(&mut out, receiver);
                out.extend(args.iter_mut());
                opt(&mut out, block);
            }
            NodeKind::Iter { params, body } | NodeKind::Def { params, body, .. } => {
                out.extend(params.optional.iter_mut().map(|o| &mut o.value));
                opt(&mut out, body);
            }
            NodeKind::Super { args, block } => {
                out.extend(args.iter_mut());
                opt(&mut out, block);
            }
            NodeKind::Zsuper { block } => opt(&mut out, block),
            NodeKind::And { left, right } | NodeKind::Or { left, right } => {
                out.push(left);
                out.push(right);
            }
            NodeKind::If { cond, then_body, else_body } => {
                out.push(cond);
                opt(&mut out, then_body);
                opt(&mut out, else_body);
            }
            NodeKind::While { cond, body, .. } | NodeKind::Until { cond, body, .. } => {
                out.push(cond);
                opt(&mut out, body);
            }
            NodeKind::Case { subject, whens, else_body } => {
                opt(&mut out, subject);
                for w in whens.iter_mut() {
                    out.extend(w.patterns.iter_mut());
                    out.extend(w.body.iter_mut());
                }
                opt(&mut out, else_body);
            }
            NodeKind::Begin { body, rescues, else_body, ensure } => {
                opt(&mut out, body);
                for r in rescues.iter_mut() {
                    out.extend(r.classes.iter_mut());
                    out.extend(r.var.iter_mut());
                    out.extend(r.body.iter_mut());
                }
                opt(&mut out, else_body);
                opt(&mut out, ensure);
            }
            NodeKind::Defs { receiver, params, body, .. } => {
                out.push(receiver);
                out.extend(params.optional.iter_mut().map(|o| &mut o.value));
                opt(&mut out, body);
            }
            NodeKind::Class { scope, superclass, body, .. } => {
                opt(&mut out, scope);
                opt(&mut out, superclass);
                opt(&mut out, body);
            }
            NodeKind::Module { scope, body, .. } => {
                opt(&mut out, scope);
                opt(&mut out, body);
            }
        }
        out
    }

    fn number(&mut self, next: &mut NodeId, parent_line: u32) {
        *next += 1;
        self.id = *next;
        if self.line == 0 {
            self.line = parent_line;
        }
        let line = self.line;
        for child in self.children_mut() {
            child.number(next, line);
        }
    }
}

/// A whole compilation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_file")]
    pub file: String,
    pub root: Node,
}

fn default_file() -> String {
    "-".to_string()
}

impl Program {
    pub fn new(file: impl Into<String>, root: Node) -> Self {
        let mut program = Program { file: file.into(), root };
        program.assign_ids();
        program
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let mut program: Program = serde_json::from_str(text)?;
        program.assign_ids();
        Ok(program)
    }

    fn assign_ids(&mut self) {
        let mut next = 0;
        let line = self.root.line.max(1);
        self.root.number(&mut next, line);
    }
}

#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;

    #[test]
    fn decodes_tagged_json() {
        let text = r#"{
            "file": "t.rb",
            "root": {"type": "seq", "line": 1, "stmts": [
                {"type": "lasgn", "line": 1, "name": "a", "value": {"type": "int", "value": 1}},
                {"type": "call", "line": 2, "receiver": {"type": "lvar", "name": "a"},
                 "name": "+", "args": [{"type": "int", "value": 2}]}
            ]}
        }"#;
        let p = Program::from_json(text).unwrap();
        assert_eq!(p.file, "t.rb");
        let NodeKind::Seq { stmts } = &p.root.kind else { panic!("expected seq") };
        assert_eq!(stmts.len(), 2);
        assert!(matches!(&stmts[1].kind, NodeKind::Call { name, .. } if name == "+"));
    }

    #[test]
    fn ids_are_unique_and_preorder() {
        let p = Program::new("t.rb", seq(vec![lasgn("a", int(1)), call(lvar("a"), "+", vec![int(2)])]));
        let mut ids = Vec::new();
        fn walk(n: &Node, ids: &mut Vec<NodeId>) {
            ids.push(n.id);
            for c in n.children() {
                walk(c, ids);
            }
        }
        walk(&p.root, &mut ids);
        let expected: Vec<NodeId> = (1..=ids.len() as u32).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn children_inherit_missing_lines() {
        let p = Program::new("t.rb", seq(vec![lasgn("a", int(1))]).at(4));
        let NodeKind::Seq { stmts } = &p.root.kind else { panic!() };
        assert_eq!(stmts[0].line, 4);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = Program::from_json(r#"{"root": {"type": "flip_flop"}}"#).unwrap_err();
        assert!(err.to_string().contains("flip_flop") || err.to_string().contains("unknown variant"));
    }

    #[test]
    fn json_round_trip_of_params() {
        let node = def("f", params().req("a").opt("b", int(1)).rest("c"), Some(lvar("a")));
        let text = serde_json::to_string(&node).unwrap();
        let back: Node = serde_json::from_str(&text).unwrap();
        assert_eq!(back.kind, node.kind);
    }
}
