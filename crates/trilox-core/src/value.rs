//! Runtime value representation and ternary-logic semantics

use std::fmt;

use crate::object::{GcRef, ObjKind};

/// A Kleene/Priest three-valued truth value. Represented so that `False <
/// Unknown < True` orders exactly as `AND`/`OR` (min/max) expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Logic {
    False = 0,
    Unknown = 1,
    True = 2,
}

impl Logic {
    pub fn from_u8(n: u8) -> Self {
        match n {
            0 => Logic::False,
            1 => Logic::Unknown,
            _ => Logic::True,
        }
    }

    pub fn not(self) -> Logic {
        Logic::from_u8(2 - self as u8)
    }
}

impl fmt::Display for Logic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Logic::False => write!(f, "false"),
            Logic::Unknown => write!(f, "unknown"),
            Logic::True => write!(f, "true"),
        }
    }
}

/// A tagged runtime value. `Object` is a non-owning handle into the heap;
/// the value itself is `Copy`, matching the invariant that pushing/popping
/// the stack never touches the heap.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Nil,
    Logic(Logic),
    Number(f64),
    Object(GcRef),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<GcRef> {
        match self {
            Value::Object(o) => Some(*o),
            _ => None,
        }
    }

    pub fn as_logic(&self) -> Option<Logic> {
        match self {
            Value::Logic(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        self.as_object()
            .and_then(|o| o.as_string().map(|s| s.chars.as_str()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Logic(_) => "logic",
            Value::Number(_) => "number",
            Value::Object(o) => o.deref().kind.type_name(),
        }
    }

    /// `NOT` applied for branching purposes (spec §4.2): any non-logic
    /// value behaves as `unknown` under this operator, so conditional
    /// jumps can test arbitrary values via `NOT(top)`.
    pub fn not(&self) -> Logic {
        match self {
            Value::Logic(l) => l.not(),
            _ => Logic::Unknown,
        }
    }

    /// Within-type equality; cross-type and Nil comparisons are `unknown`.
    pub fn equals(&self, other: &Value) -> Logic {
        match (self, other) {
            (Value::Nil, _) | (_, Value::Nil) => Logic::Unknown,
            (Value::Logic(a), Value::Logic(b)) => Logic::from_u8((a == b) as u8 * 2),
            (Value::Number(a), Value::Number(b)) => Logic::from_u8((a == b) as u8 * 2),
            (Value::Object(a), Value::Object(b)) => {
                if a.deref().kind.type_name() != b.deref().kind.type_name() {
                    Logic::Unknown
                } else {
                    Logic::from_u8((a == b) as u8 * 2)
                }
            }
            _ => Logic::Unknown,
        }
    }

    pub fn not_equals(&self, other: &Value) -> Logic {
        self.equals(other).not()
    }

    /// Ordering comparison: numeric/logic compare by value; strings/arrays/
    /// tables compare by length/item-count; everything else is `unknown`.
    pub fn compare(&self, other: &Value) -> Logic {
        match (self, other) {
            (Value::Nil, _) | (_, Value::Nil) => Logic::Unknown,
            (Value::Logic(a), Value::Logic(b)) => order(*a as i64, *b as i64),
            (Value::Number(a), Value::Number(b)) => order_f64(*a, *b),
            (Value::Object(a), Value::Object(b)) => {
                let (ak, bk) = (&a.deref().kind, &b.deref().kind);
                match (ak, bk) {
                    (ObjKind::String(x), ObjKind::String(y)) => {
                        order(x.chars.len() as i64, y.chars.len() as i64)
                    }
                    (ObjKind::Array(x), ObjKind::Array(y)) => order(
                        x.values.borrow().len() as i64,
                        y.values.borrow().len() as i64,
                    ),
                    (ObjKind::Table(x), ObjKind::Table(y)) => {
                        order(x.table.borrow().len() as i64, y.table.borrow().len() as i64)
                    }
                    _ => Logic::Unknown,
                }
            }
            _ => Logic::Unknown,
        }
    }

    pub fn less_than(&self, other: &Value) -> Logic {
        relational(self, other, |o| o == Logic::False)
    }

    pub fn less_or_equal(&self, other: &Value) -> Logic {
        if self.equals(other) == Logic::True {
            Logic::True
        } else {
            self.less_than(other)
        }
    }

    pub fn greater_than(&self, other: &Value) -> Logic {
        relational(self, other, |o| o == Logic::True)
    }

    pub fn greater_or_equal(&self, other: &Value) -> Logic {
        if self.equals(other) == Logic::True {
            Logic::True
        } else {
            self.greater_than(other)
        }
    }

    /// `a AND b = min(a, b)`; requires both operands to be logic values.
    pub fn kp_and(&self, other: &Value) -> Logic {
        match (self.as_logic(), other.as_logic()) {
            (Some(a), Some(b)) => a.min(b),
            _ => Logic::Unknown,
        }
    }

    /// `a OR b = max(a, b)`; requires both operands to be logic values.
    pub fn kp_or(&self, other: &Value) -> Logic {
        match (self.as_logic(), other.as_logic()) {
            (Some(a), Some(b)) => a.max(b),
            _ => Logic::Unknown,
        }
    }

    pub fn kp_xor(&self, other: &Value) -> Logic {
        match (self.as_logic(), other.as_logic()) {
            (Some(Logic::Unknown), Some(_)) | (Some(_), Some(Logic::Unknown)) => Logic::Unknown,
            (Some(a), Some(b)) => Logic::from_u8(((a != b) as u8) * 2),
            _ => Logic::Unknown,
        }
    }
}

fn order(a: i64, b: i64) -> Logic {
    if a > b {
        Logic::True
    } else if a < b {
        Logic::False
    } else {
        Logic::Unknown
    }
}

fn order_f64(a: f64, b: f64) -> Logic {
    if a > b {
        Logic::True
    } else if a < b {
        Logic::False
    } else {
        Logic::Unknown
    }
}

/// Cross-type mismatch collapses to `unknown`; same-type, non-numeric
/// object comparisons that aren't "greater" collapse to `false`, matching
/// the original's "relative comparisons don't make sense for
/// non-numericals" behaviour for `<`/`>` (but not for `compare`, which
/// still orders by length/count).
fn relational(a: &Value, b: &Value, pick: impl Fn(Logic) -> bool) -> Logic {
    match (a, b) {
        (Value::Nil, _) | (_, Value::Nil) => Logic::Unknown,
        (Value::Number(_), Value::Number(_)) | (Value::Logic(_), Value::Logic(_)) => {
            let ord = a.compare(b);
            Logic::from_u8((pick(ord)) as u8 * 2)
        }
        (Value::Object(x), Value::Object(y)) => {
            if x.deref().kind.type_name() != y.deref().kind.type_name() {
                Logic::Unknown
            } else {
                Logic::False
            }
        }
        _ => Logic::Unknown,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other) == Logic::True
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Logic(l) => write!(f, "{l}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Object(o) => match &o.deref().kind {
                ObjKind::String(s) => write!(f, "{}", s.chars),
                ObjKind::Function(func) => match func.name.and_then(|n| n.as_string().map(|s| s.chars.clone())) {
                    Some(name) => write!(f, "<function {name}>"),
                    None => write!(f, "<script>"),
                },
                ObjKind::Closure(c) => write!(f, "{}", Value::Object(c.function)),
                ObjKind::Upvalue(_) => write!(f, "<upvalue>"),
                ObjKind::Array(a) => {
                    write!(f, "[")?;
                    for (i, v) in a.values.borrow().iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{v}")?;
                    }
                    write!(f, "]")
                }
                ObjKind::Table(_) => write!(f, "<table>"),
                ObjKind::Native(n) => write!(f, "<native {}>", n.name),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_is_involutive() {
        for l in [Logic::False, Logic::Unknown, Logic::True] {
            assert_eq!(l.not().not(), l);
        }
    }

    #[test]
    fn and_or_identities() {
        for l in [Logic::False, Logic::Unknown, Logic::True] {
            assert_eq!(Value::Logic(l).kp_and(&Value::Logic(Logic::True)), l);
            assert_eq!(Value::Logic(l).kp_or(&Value::Logic(Logic::False)), l);
        }
    }

    #[test]
    fn and_or_commutative_and_associative() {
        let vals = [Logic::False, Logic::Unknown, Logic::True];
        for a in vals {
            for b in vals {
                assert_eq!(
                    Value::Logic(a).kp_and(&Value::Logic(b)),
                    Value::Logic(b).kp_and(&Value::Logic(a))
                );
                assert_eq!(
                    Value::Logic(a).kp_or(&Value::Logic(b)),
                    Value::Logic(b).kp_or(&Value::Logic(a))
                );
                for c in vals {
                    let lhs = Value::Logic(a).kp_and(&Value::Logic(b));
                    let rhs = Value::Logic(b).kp_and(&Value::Logic(c));
                    assert_eq!(
                        Value::Logic(lhs).kp_and(&Value::Logic(c)),
                        Value::Logic(a).kp_and(&Value::Logic(rhs))
                    );
                }
            }
        }
    }

    #[test]
    fn de_morgan() {
        let vals = [Logic::False, Logic::Unknown, Logic::True];
        for a in vals {
            for b in vals {
                let not_and = Value::Logic(a).kp_and(&Value::Logic(b)).not();
                let or_not = Value::Logic(a.not()).kp_or(&Value::Logic(b.not()));
                assert_eq!(not_and, or_not);
            }
        }
    }

    #[test]
    fn nil_is_unknown_even_against_itself() {
        assert_eq!(Value::Nil.equals(&Value::Nil), Logic::Unknown);
    }

    #[test]
    fn cross_type_equality_is_unknown() {
        assert_eq!(
            Value::Number(1.0).equals(&Value::Logic(Logic::True)),
            Logic::Unknown
        );
    }
}
