//! Parameter-count model shared by the compiler, the dispatcher and the
//! native calling convention.

use crate::ast::Params;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Arity {
    pub min: u16,
    /// `-1` when a rest parameter makes the count unbounded.
    pub max: i32,
    /// Values the callee receives: left + optional + rest slot + post.
    pub real: u16,
    pub left_req: u16,
    pub optional: u16,
    pub rest: bool,
    pub post_req: u16,
}

impl Arity {
    pub fn new(left_req: u16, optional: u16, rest: bool, post_req: u16) -> Self {
        let min = left_req + post_req;
        Arity {
            min,
            max: if rest { -1 } else { (min + optional) as i32 },
            real: left_req + optional + rest as u16 + post_req,
            left_req,
            optional,
            rest,
            post_req,
        }
    }

    pub fn fixed(n: u16) -> Self {
        Arity::new(n, 0, false, 0)
    }

    /// `min..=max`, for foreign methods.
    pub fn range(min: u16, max: i32) -> Self {
        if max < 0 {
            return Arity { max: -1, ..Arity::new(min, 0, true, 0) };
        }
        Arity::new(min, (max as u16).saturating_sub(min), false, 0)
    }

    pub fn variadic() -> Self {
        Arity::new(0, 0, true, 0)
    }

    pub fn from_params(p: &Params) -> Self {
        Arity::new(p.required.len() as u16, p.optional.len() as u16, p.rest.is_some(), p.post.len() as u16)
    }

    pub fn accepts(&self, argc: usize) -> bool {
        argc >= self.min as usize && (self.max < 0 || argc <= self.max as usize)
    }

    /// Whether actual arguments already line up with the callee's slots.
    pub fn is_simple(&self) -> bool {
        self.optional == 0 && !self.rest
    }

    /// Ruby's `Method#arity`: `n` for fixed, `-(required + 1)` otherwise.
    pub fn ruby_arity(&self) -> i64 {
        if self.optional > 0 || self.rest {
            -(self.min as i64) - 1
        } else {
            self.min as i64
        }
    }

    /// "given N, expected M" text for ArgumentError.
    pub fn mismatch_message(&self, given: usize) -> String {
        let expected = if self.max < 0 {
            format!("{}+", self.min)
        } else if self.max as u16 == self.min {
            self.min.to_string()
        } else {
            format!("{}..{}", self.min, self.max)
        };
        format!("wrong number of arguments (given {given}, expected {expected})")
    }

    /// Redistribute an accepted argument list into callee slots.
    ///
    /// Unsupplied optionals receive [`Value::UNDEF`] so the callee's default
    /// expressions can tell "not given" from "given as nil". Surplus arguments
    /// go to the rest slot, built by `make_array`.
    pub fn marshal(&self, args: &[Value], make_array: impl FnOnce(Vec<Value>) -> Value) -> Vec<Value> {
        if self.is_simple() && args.len() == self.real as usize {
            return args.to_vec();
        }
        let left = self.left_req as usize;
        let post = self.post_req as usize;
        let n = args.len();
        let mut out = Vec::with_capacity(self.real as usize);

        out.extend(args.iter().take(left).copied());
        out.resize(left, Value::NIL);

        let after_left = n.saturating_sub(left);
        let supplied_opt = after_left.saturating_sub(post).min(self.optional as usize);
        out.extend(args.iter().skip(left).take(supplied_opt).copied());
        out.resize(left + self.optional as usize, Value::UNDEF);

        let rest_start = (left + supplied_opt).min(n);
        let rest_end = n.saturating_sub(post).max(rest_start);
        if self.rest {
            out.push(make_array(args[rest_start..rest_end].to_vec()));
        }

        let post_start = n.saturating_sub(post).max(rest_start);
        out.extend(args[post_start..].iter().take(post).copied());
        out.resize(self.real as usize, Value::NIL);
        out
    }

    /// Proc-style adaptation: never fails, pads and drops instead.
    ///
    /// `auto_spread` is the array's elements when exactly one array argument
    /// was passed; it replaces the argument list when more than one parameter
    /// (counting the rest parameter) is declared.
    pub fn adapt(&self, args: &[Value], auto_spread: Option<Vec<Value>>, make_array: impl FnOnce(Vec<Value>) -> Value) -> Vec<Value> {
        let declared = self.left_req + self.optional + self.post_req + self.rest as u16;
        let spread;
        let args = match auto_spread {
            Some(elements) if declared > 1 && args.len() == 1 => {
                spread = elements;
                &spread[..]
            }
            _ => args,
        };
        let mut args = args.to_vec();
        if args.len() < self.min as usize {
            args.resize(self.min as usize, Value::NIL);
        }
        if self.max >= 0 && args.len() > self.max as usize {
            args.truncate(self.max as usize);
        }
        self.marshal(&args, make_array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(v: &[i32]) -> Vec<Value> {
        v.iter().map(|&n| Value::int(n)).collect()
    }

    /// Packs rest arrays as a fixnum count so tests can see them.
    fn count(v: Vec<Value>) -> Value {
        Value::int(100 + v.len() as i32)
    }

    #[test]
    fn derives_counts_from_params() {
        use crate::ast::build::*;
        let p = params().req("a").opt("b", int(1)).rest("c").req("d");
        let a = Arity::from_params(&p);
        assert_eq!((a.min, a.max, a.real, a.left_req), (2, -1, 4, 1));
        assert_eq!(a.post_req, 1);
    }

    #[test]
    fn accepts_bounds() {
        let a = Arity::new(1, 1, false, 0);
        assert!(!a.accepts(0) && a.accepts(1) && a.accepts(2) && !a.accepts(3));
        assert!(Arity::variadic().accepts(50));
    }

    #[test]
    fn marshals_optional_and_rest() {
        // def f(a, b = 1, *c)
        let a = Arity::new(1, 1, true, 0);
        assert_eq!(a.marshal(&ints(&[1]), count), vec![Value::int(1), Value::UNDEF, Value::int(100)]);
        assert_eq!(a.marshal(&ints(&[1, 2]), count), vec![Value::int(1), Value::int(2), Value::int(100)]);
        assert_eq!(a.marshal(&ints(&[1, 2, 3, 4]), count), vec![Value::int(1), Value::int(2), Value::int(102)]);
    }

    #[test]
    fn marshals_post_args_before_optionals() {
        // def f(a, b = 1, c)
        let a = Arity::new(1, 1, false, 1);
        assert_eq!(a.marshal(&ints(&[1, 2]), count), vec![Value::int(1), Value::UNDEF, Value::int(2)]);
        assert_eq!(a.marshal(&ints(&[1, 2, 3]), count), ints(&[1, 2, 3]));
    }

    #[test]
    fn adapt_spreads_single_array_for_multiple_params() {
        let two = Arity::fixed(2);
        assert_eq!(two.adapt(&[Value::NIL], Some(ints(&[1, 2])), count), ints(&[1, 2]));
        let one = Arity::fixed(1);
        assert_eq!(one.adapt(&[Value::NIL], Some(ints(&[1, 2])), count), vec![Value::NIL]);
    }

    #[test]
    fn adapt_pads_and_drops() {
        let two = Arity::fixed(2);
        assert_eq!(two.adapt(&ints(&[1]), None, count), vec![Value::int(1), Value::NIL]);
        assert_eq!(two.adapt(&ints(&[1, 2, 3]), None, count), ints(&[1, 2]));
    }

    #[test]
    fn mismatch_messages() {
        assert_eq!(Arity::fixed(2).mismatch_message(1), "wrong number of arguments (given 1, expected 2)");
        assert_eq!(Arity::new(1, 0, true, 0).mismatch_message(0), "wrong number of arguments (given 0, expected 1+)");
        assert_eq!(Arity::new(1, 1, false, 0).mismatch_message(3), "wrong number of arguments (given 3, expected 1..2)");
    }
}
