//! Constructors for building trees in Rust, mostly for tests and embedders.
//!
//! ```
//! use garnet::ast::build::*;
//! let tree = seq(vec![lasgn("a", int(1)), call(lvar("a"), "+", vec![int(2)])]);
//! ```

use super::{Node, NodeKind, OptParam, Params, RescueClause, When};

fn b(n: Node) -> Box<Node> {
    Box::new(n)
}

pub fn nil() -> Node {
    Node::new(NodeKind::Nil)
}

pub fn true_() -> Node {
    Node::new(NodeKind::True)
}

pub fn false_() -> Node {
    Node::new(NodeKind::False)
}

pub fn self_() -> Node {
    Node::new(NodeKind::SelfRef)
}

pub fn int(value: i64) -> Node {
    Node::new(NodeKind::Int { value })
}

pub fn float(value: f64) -> Node {
    Node::new(NodeKind::Float { value })
}

pub fn str_(value: &str) -> Node {
    Node::new(NodeKind::Str { value: value.to_string() })
}

pub fn dstr(parts: Vec<Node>) -> Node {
    Node::new(NodeKind::Dstr { parts })
}

pub fn sym(name: &str) -> Node {
    Node::new(NodeKind::Sym { name: name.to_string() })
}

pub fn array(elements: Vec<Node>) -> Node {
    Node::new(NodeKind::Array { elements })
}

pub fn splat(value: Node) -> Node {
    Node::new(NodeKind::Splat { value: b(value) })
}

pub fn block_pass(value: Node) -> Node {
    Node::new(NodeKind::BlockPass { value: b(value) })
}

pub fn lvar(name: &str) -> Node {
    Node::new(NodeKind::Lvar { name: name.to_string() })
}

pub fn lasgn(name: &str, value: Node) -> Node {
    Node::new(NodeKind::Lasgn { name: name.to_string(), value: Some(b(value)) })
}

/// Assignment target without a value, for masgn and `rescue => e`.
pub fn ltarget(name: &str) -> Node {
    Node::new(NodeKind::Lasgn { name: name.to_string(), value: None })
}

pub fn ivar(name: &str) -> Node {
    Node::new(NodeKind::Ivar { name: name.to_string() })
}

pub fn iasgn(name: &str, value: Node) -> Node {
    Node::new(NodeKind::Iasgn { name: name.to_string(), value: Some(b(value)) })
}

pub fn itarget(name: &str) -> Node {
    Node::new(NodeKind::Iasgn { name: name.to_string(), value: None })
}

pub fn cvar(name: &str) -> Node {
    Node::new(NodeKind::Cvar { name: name.to_string() })
}

pub fn cvasgn(name: &str, value: Node) -> Node {
    Node::new(NodeKind::Cvasgn { name: name.to_string(), value: Some(b(value)) })
}

pub fn gvar(name: &str) -> Node {
    Node::new(NodeKind::Gvar { name: name.to_string() })
}

pub fn gasgn(name: &str, value: Node) -> Node {
    Node::new(NodeKind::Gasgn { name: name.to_string(), value: Some(b(value)) })
}

pub fn const_(name: &str) -> Node {
    Node::new(NodeKind::Const { scope: None, top: false, name: name.to_string() })
}

pub fn scoped_const(scope: Node, name: &str) -> Node {
    Node::new(NodeKind::Const { scope: Some(b(scope)), top: false, name: name.to_string() })
}

pub fn cdecl(name: &str, value: Node) -> Node {
    Node::new(NodeKind::Cdecl { scope: None, name: name.to_string(), value: Some(b(value)) })
}

pub fn attr_asgn(receiver: Node, name: &str, args: Vec<Node>) -> Node {
    Node::new(NodeKind::AttrAsgn { receiver: b(receiver), name: name.to_string(), args })
}

pub fn masgn(pre: Vec<Node>, splat: Option<Node>, post: Vec<Node>, value: Node) -> Node {
    Node::new(NodeKind::Masgn { pre, splat: splat.map(b), post, value: Some(b(value)) })
}

/// Nested masgn target.
pub fn mtarget(pre: Vec<Node>, splat: Option<Node>, post: Vec<Node>) -> Node {
    Node::new(NodeKind::Masgn { pre, splat: splat.map(b), post, value: None })
}

pub fn op_asgn(target: Node, op: &str, value: Node) -> Node {
    Node::new(NodeKind::OpAsgn { target: b(target), op: op.to_string(), value: b(value) })
}

pub fn call(receiver: Node, name: &str, args: Vec<Node>) -> Node {
    Node::new(NodeKind::Call { receiver: Some(b(receiver)), name: name.to_string(), args, block: None })
}

/// Call with an implicit `self` receiver.
pub fn fcall(name: &str, args: Vec<Node>) -> Node {
    Node::new(NodeKind::Call { receiver: None, name: name.to_string(), args, block: None })
}

pub fn vcall(name: &str) -> Node {
    Node::new(NodeKind::Vcall { name: name.to_string() })
}

/// Attach a block literal to a call node.
pub fn with_block(mut call: Node, params: Params, body: Option<Node>) -> Node {
    let block = iter(params, body);
    if let NodeKind::Call { block: slot, .. } | NodeKind::Super { block: slot, .. } | NodeKind::Zsuper { block: slot } =
        &mut call.kind
    {
        *slot = Some(b(block));
    }
    call
}

/// Attach `&value` to a call node.
pub fn with_block_pass(mut call: Node, value: Node) -> Node {
    if let NodeKind::Call { block: slot, .. } = &mut call.kind {
        *slot = Some(b(block_pass(value)));
    }
    call
}

pub fn iter(params: Params, body: Option<Node>) -> Node {
    Node::new(NodeKind::Iter { params, body: body.map(b) })
}

pub fn super_(args: Vec<Node>) -> Node {
    Node::new(NodeKind::Super { args, block: None })
}

pub fn zsuper() -> Node {
    Node::new(NodeKind::Zsuper { block: None })
}

pub fn yield_(args: Vec<Node>) -> Node {
    Node::new(NodeKind::Yield { args })
}

pub fn not(value: Node) -> Node {
    Node::new(NodeKind::Not { value: b(value) })
}

pub fn and(left: Node, right: Node) -> Node {
    Node::new(NodeKind::And { left: b(left), right: b(right) })
}

pub fn or(left: Node, right: Node) -> Node {
    Node::new(NodeKind::Or { left: b(left), right: b(right) })
}

pub fn if_(cond: Node, then_body: Option<Node>, else_body: Option<Node>) -> Node {
    Node::new(NodeKind::If { cond: b(cond), then_body: then_body.map(b), else_body: else_body.map(b) })
}

/// `unless` is an `if` with the branches swapped.
pub fn unless(cond: Node, body: Option<Node>, else_body: Option<Node>) -> Node {
    if_(cond, else_body, body)
}

pub fn while_(cond: Node, body: Option<Node>) -> Node {
    Node::new(NodeKind::While { cond: b(cond), body: body.map(b), post: false })
}

pub fn do_while(body: Option<Node>, cond: Node) -> Node {
    Node::new(NodeKind::While { cond: b(cond), body: body.map(b), post: true })
}

pub fn until(cond: Node, body: Option<Node>) -> Node {
    Node::new(NodeKind::Until { cond: b(cond), body: body.map(b), post: false })
}

pub fn case(subject: Option<Node>, whens: Vec<When>, else_body: Option<Node>) -> Node {
    Node::new(NodeKind::Case { subject: subject.map(b), whens, else_body: else_body.map(b) })
}

pub fn when(patterns: Vec<Node>, body: Option<Node>) -> When {
    When { patterns, body }
}

pub fn begin(body: Option<Node>, rescues: Vec<RescueClause>, else_body: Option<Node>, ensure: Option<Node>) -> Node {
    Node::new(NodeKind::Begin { body: body.map(b), rescues, else_body: else_body.map(b), ensure: ensure.map(b) })
}

pub fn rescue(classes: Vec<Node>, var: Option<&str>, body: Option<Node>) -> RescueClause {
    RescueClause { classes, var: var.map(ltarget), body }
}

pub fn seq(stmts: Vec<Node>) -> Node {
    Node::new(NodeKind::Seq { stmts })
}

pub fn return_(value: Option<Node>) -> Node {
    Node::new(NodeKind::Return { value: value.map(b) })
}

pub fn break_(value: Option<Node>) -> Node {
    Node::new(NodeKind::Break { value: value.map(b) })
}

pub fn next(value: Option<Node>) -> Node {
    Node::new(NodeKind::Next { value: value.map(b) })
}

pub fn redo() -> Node {
    Node::new(NodeKind::Redo)
}

pub fn retry() -> Node {
    Node::new(NodeKind::Retry)
}

pub fn def(name: &str, params: Params, body: Option<Node>) -> Node {
    Node::new(NodeKind::Def { name: name.to_string(), params, body: body.map(b) })
}

pub fn defs(receiver: Node, name: &str, params: Params, body: Option<Node>) -> Node {
    Node::new(NodeKind::Defs { receiver: b(receiver), name: name.to_string(), params, body: body.map(b) })
}

pub fn class(name: &str, superclass: Option<Node>, body: Option<Node>) -> Node {
    Node::new(NodeKind::Class { scope: None, name: name.to_string(), superclass: superclass.map(b), body: body.map(b) })
}

pub fn module(name: &str, body: Option<Node>) -> Node {
    Node::new(NodeKind::Module { scope: None, name: name.to_string(), body: body.map(b) })
}

pub fn params() -> Params {
    Params::default()
}

impl Params {
    pub fn req(mut self, name: &str) -> Self {
        if self.rest.is_some() {
            self.post.push(name.to_string());
        } else {
            self.required.push(name.to_string());
        }
        self
    }

    pub fn opt(mut self, name: &str, value: Node) -> Self {
        self.optional.push(OptParam { name: name.to_string(), value });
        self
    }

    pub fn rest(mut self, name: &str) -> Self {
        self.rest = Some(name.to_string());
        self
    }

    pub fn block(mut self, name: &str) -> Self {
        self.block = Some(name.to_string());
        self
    }
}
