//! Object-kind tags for shared handles
//!
//! Every reference-counted node in the IR and the runtime carries a kind
//! tag. Kinds form a hierarchy; downcasting a handle succeeds when the
//! dynamic kind equals the requested kind or one of its descendants.

/// Kind tag of a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Root of the hierarchy
    Object,
    /// Any expression node
    Expr,
    /// Variable expression
    Var,
    /// Constant expression
    Constant,
    /// Call expression
    Call,
    /// Function expression
    Function,
    /// Tuple expression
    Tuple,
    /// Operator descriptor expression
    Op,
    /// Any buffer
    Buffer,
    /// Host-memory buffer
    HostBuffer,
    /// Device-memory buffer
    DeviceBuffer,
}

impl ObjectKind {
    /// Direct parent in the hierarchy, `None` for the root
    pub const fn parent(self) -> Option<ObjectKind> {
        match self {
            ObjectKind::Object => None,
            ObjectKind::Expr | ObjectKind::Buffer => Some(ObjectKind::Object),
            ObjectKind::Var
            | ObjectKind::Constant
            | ObjectKind::Call
            | ObjectKind::Function
            | ObjectKind::Tuple
            | ObjectKind::Op => Some(ObjectKind::Expr),
            ObjectKind::HostBuffer | ObjectKind::DeviceBuffer => Some(ObjectKind::Buffer),
        }
    }

    /// Whether `self` is `ancestor` or a descendant of it
    pub fn is_a(self, ancestor: ObjectKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == ancestor {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}
