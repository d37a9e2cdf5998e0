//! Policy VM values
//!
//! A tagged `Element` variant over every type the policy language can
//! touch. Binary operations dispatch on the (lhs, rhs) type pair; an
//! undefined pairing is a [`PolicyError::TypeMismatch`], which the VM
//! turns into a term non-match rather than a policy failure.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};
use routerd_iftree::Mac;

use crate::error::{PolicyError, PolicyResult};

/// Static type of an [`Element`]. Appears in `PUSH <type> <value>`
/// instructions and in variable-map declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    Bool,
    U32,
    I32,
    U64,
    Ipv4,
    Ipv6,
    Ipv4Net,
    Ipv6Net,
    Mac,
    Str,
    U32Set,
    Ipv4NetSet,
    Ipv6NetSet,
    AsPath,
}

impl ElemType {
    pub fn name(&self) -> &'static str {
        match self {
            ElemType::Bool => "bool",
            ElemType::U32 => "u32",
            ElemType::I32 => "i32",
            ElemType::U64 => "u64",
            ElemType::Ipv4 => "ipv4",
            ElemType::Ipv6 => "ipv6",
            ElemType::Ipv4Net => "ipv4net",
            ElemType::Ipv6Net => "ipv6net",
            ElemType::Mac => "mac",
            ElemType::Str => "str",
            ElemType::U32Set => "set_u32",
            ElemType::Ipv4NetSet => "set_ipv4net",
            ElemType::Ipv6NetSet => "set_ipv6net",
            ElemType::AsPath => "aspath",
        }
    }

    pub fn from_name(name: &str) -> Option<ElemType> {
        Some(match name {
            "bool" => ElemType::Bool,
            "u32" => ElemType::U32,
            "i32" => ElemType::I32,
            "u64" => ElemType::U64,
            "ipv4" => ElemType::Ipv4,
            "ipv6" => ElemType::Ipv6,
            "ipv4net" => ElemType::Ipv4Net,
            "ipv6net" => ElemType::Ipv6Net,
            "mac" => ElemType::Mac,
            "str" => ElemType::Str,
            "set_u32" => ElemType::U32Set,
            "set_ipv4net" => ElemType::Ipv4NetSet,
            "set_ipv6net" => ElemType::Ipv6NetSet,
            "aspath" => ElemType::AsPath,
            _ => return None,
        })
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A policy value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Bool(bool),
    U32(u32),
    I32(i32),
    U64(u64),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Ipv4Net(Ipv4Network),
    Ipv6Net(Ipv6Network),
    Mac(Mac),
    Str(String),
    U32Set(BTreeSet<u32>),
    Ipv4NetSet(BTreeSet<Ipv4Network>),
    Ipv6NetSet(BTreeSet<Ipv6Network>),
    /// AS path as the flattened sequence of AS numbers, head first.
    AsPath(Vec<u32>),
}

impl Element {
    pub fn elem_type(&self) -> ElemType {
        match self {
            Element::Bool(_) => ElemType::Bool,
            Element::U32(_) => ElemType::U32,
            Element::I32(_) => ElemType::I32,
            Element::U64(_) => ElemType::U64,
            Element::Ipv4(_) => ElemType::Ipv4,
            Element::Ipv6(_) => ElemType::Ipv6,
            Element::Ipv4Net(_) => ElemType::Ipv4Net,
            Element::Ipv6Net(_) => ElemType::Ipv6Net,
            Element::Mac(_) => ElemType::Mac,
            Element::Str(_) => ElemType::Str,
            Element::U32Set(_) => ElemType::U32Set,
            Element::Ipv4NetSet(_) => ElemType::Ipv4NetSet,
            Element::Ipv6NetSet(_) => ElemType::Ipv6NetSet,
            Element::AsPath(_) => ElemType::AsPath,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Element::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Parse the textual form used by `PUSH <type> <value>`.
    pub fn parse(ty: ElemType, text: &str) -> PolicyResult<Element> {
        macro_rules! lit {
            ($variant:ident) => {
                Element::$variant(text.parse().map_err(|_| bad_literal(ty, text))?)
            };
        }
        Ok(match ty {
            ElemType::Bool => lit!(Bool),
            ElemType::U32 => lit!(U32),
            ElemType::I32 => lit!(I32),
            ElemType::U64 => lit!(U64),
            ElemType::Ipv4 => lit!(Ipv4),
            ElemType::Ipv6 => lit!(Ipv6),
            ElemType::Ipv4Net => lit!(Ipv4Net),
            ElemType::Ipv6Net => lit!(Ipv6Net),
            ElemType::Mac => lit!(Mac),
            ElemType::Str => Element::Str(text.to_string()),
            ElemType::U32Set => Element::U32Set(parse_set(text, ty)?),
            ElemType::Ipv4NetSet => Element::Ipv4NetSet(parse_set(text, ty)?),
            ElemType::Ipv6NetSet => Element::Ipv6NetSet(parse_set(text, ty)?),
            ElemType::AsPath => Element::AsPath(
                text.split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| s.trim().parse().map_err(|_| bad_literal(ty, text)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    fn mismatch(op: &'static str, lhs: &Element, rhs: &Element) -> PolicyError {
        PolicyError::TypeMismatch {
            op,
            lhs: lhs.elem_type().name(),
            rhs: rhs.elem_type().name(),
        }
    }

    /// Equality across any same-typed pair.
    pub fn op_eq(&self, rhs: &Element) -> PolicyResult<bool> {
        if self.elem_type() != rhs.elem_type() {
            return Err(Self::mismatch("==", self, rhs));
        }
        Ok(self == rhs)
    }

    /// Ordering and containment. For scalar pairs this is the natural
    /// order; for (element, set) and (set, element) pairs `<=` and `>=`
    /// express membership, which is what the generated tag tests use.
    pub fn op_cmp(&self, op: CmpOp, rhs: &Element) -> PolicyResult<bool> {
        use Element as E;
        // Membership forms first.
        match (self, rhs, op) {
            // element <= set: member of
            (E::U32(x), E::U32Set(s), CmpOp::Le) => return Ok(s.contains(x)),
            (E::Ipv4Net(x), E::Ipv4NetSet(s), CmpOp::Le) => return Ok(s.contains(x)),
            (E::Ipv6Net(x), E::Ipv6NetSet(s), CmpOp::Le) => return Ok(s.contains(x)),
            // set <= element / set >= element: contains (the tag tests
            // the export generator emits use the first form)
            (E::U32Set(s), E::U32(x), CmpOp::Le) => return Ok(s.contains(x)),
            (E::U32Set(s), E::U32(x), CmpOp::Ge) => return Ok(s.contains(x)),
            (E::Ipv4NetSet(s), E::Ipv4Net(x), CmpOp::Ge) => return Ok(s.contains(x)),
            (E::Ipv6NetSet(s), E::Ipv6Net(x), CmpOp::Ge) => return Ok(s.contains(x)),
            // set <= set: subset
            (E::U32Set(a), E::U32Set(b), CmpOp::Le) => return Ok(a.is_subset(b)),
            (E::Ipv4NetSet(a), E::Ipv4NetSet(b), CmpOp::Le) => return Ok(a.is_subset(b)),
            (E::Ipv6NetSet(a), E::Ipv6NetSet(b), CmpOp::Le) => return Ok(a.is_subset(b)),
            // net <= net: prefix containment (rhs covers lhs)
            (E::Ipv4Net(a), E::Ipv4Net(b), CmpOp::Le) => {
                return Ok(b.contains(a.network()) && b.prefix() <= a.prefix())
            }
            (E::Ipv6Net(a), E::Ipv6Net(b), CmpOp::Le) => {
                return Ok(b.contains(a.network()) && b.prefix() <= a.prefix())
            }
            _ => {}
        }

        let ord = match (self, rhs) {
            (E::U32(a), E::U32(b)) => a.cmp(b),
            (E::I32(a), E::I32(b)) => a.cmp(b),
            (E::U64(a), E::U64(b)) => a.cmp(b),
            (E::Ipv4(a), E::Ipv4(b)) => a.cmp(b),
            (E::Ipv6(a), E::Ipv6(b)) => a.cmp(b),
            (E::Str(a), E::Str(b)) => a.cmp(b),
            _ => return Err(Self::mismatch(op.name(), self, rhs)),
        };
        Ok(match op {
            CmpOp::Lt => ord.is_lt(),
            CmpOp::Le => ord.is_le(),
            CmpOp::Gt => ord.is_gt(),
            CmpOp::Ge => ord.is_ge(),
        })
    }

    /// Arithmetic and set algebra. `set + element` inserts,
    /// `set - element` removes, scalars use wrapping arithmetic.
    pub fn op_arith(&self, op: ArithOp, rhs: &Element) -> PolicyResult<Element> {
        use Element as E;
        match (self, rhs, op) {
            (E::U32Set(s), E::U32(x), ArithOp::Add) => {
                let mut s = s.clone();
                s.insert(*x);
                return Ok(E::U32Set(s));
            }
            (E::U32Set(s), E::U32(x), ArithOp::Sub) => {
                let mut s = s.clone();
                s.remove(x);
                return Ok(E::U32Set(s));
            }
            (E::U32Set(a), E::U32Set(b), ArithOp::Add) => {
                return Ok(E::U32Set(a.union(b).copied().collect()));
            }
            (E::Str(a), E::Str(b), ArithOp::Add) => return Ok(E::Str(format!("{a}{b}"))),
            _ => {}
        }

        macro_rules! scalar {
            ($a:expr, $b:expr, $variant:ident) => {
                Ok(E::$variant(match op {
                    ArithOp::Add => $a.wrapping_add(*$b),
                    ArithOp::Sub => $a.wrapping_sub(*$b),
                    ArithOp::Mul => $a.wrapping_mul(*$b),
                    ArithOp::Div => {
                        if *$b == 0 {
                            return Err(PolicyError::Execution("division by zero".into()));
                        }
                        $a / $b
                    }
                    ArithOp::Mod => {
                        if *$b == 0 {
                            return Err(PolicyError::Execution("modulo by zero".into()));
                        }
                        $a % $b
                    }
                }))
            };
        }
        match (self, rhs) {
            (E::U32(a), E::U32(b)) => scalar!(a, b, U32),
            (E::I32(a), E::I32(b)) => scalar!(a, b, I32),
            (E::U64(a), E::U64(b)) => scalar!(a, b, U64),
            _ => Err(Self::mismatch(op.name(), self, rhs)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn name(&self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub fn name(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }
}

fn bad_literal(ty: ElemType, text: &str) -> PolicyError {
    PolicyError::BadInstruction(format!("{} literal `{}`", ty.name(), text))
}

fn parse_set<T: std::str::FromStr + Ord>(text: &str, ty: ElemType) -> PolicyResult<BTreeSet<T>> {
    let inner = text.trim().trim_start_matches('{').trim_end_matches('}');
    let mut out = BTreeSet::new();
    for part in inner.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        out.insert(part.parse().map_err(|_| bad_literal(ty, text))?);
    }
    Ok(out)
}

impl fmt::Display for Element {
    /// Textual form accepted back by [`Element::parse`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Bool(v) => write!(f, "{v}"),
            Element::U32(v) => write!(f, "{v}"),
            Element::I32(v) => write!(f, "{v}"),
            Element::U64(v) => write!(f, "{v}"),
            Element::Ipv4(v) => write!(f, "{v}"),
            Element::Ipv6(v) => write!(f, "{v}"),
            Element::Ipv4Net(v) => write!(f, "{v}"),
            Element::Ipv6Net(v) => write!(f, "{v}"),
            Element::Mac(v) => write!(f, "{v}"),
            Element::Str(v) => write!(f, "{v}"),
            Element::U32Set(s) => write_set(f, s.iter()),
            Element::Ipv4NetSet(s) => write_set(f, s.iter()),
            Element::Ipv6NetSet(s) => write_set(f, s.iter()),
            Element::AsPath(p) => {
                let parts: Vec<String> = p.iter().map(u32::to_string).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

fn write_set<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: impl Iterator<Item = T>,
) -> fmt::Result {
    write!(f, "{{")?;
    for (i, item) in items.enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{item}")?;
    }
    write!(f, "}}")
}
