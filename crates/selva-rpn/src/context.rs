use selva_core::NodeId;

use crate::value::Value;

/// The evaluation context an expression runs against: registers (register 0
/// is always the node currently being visited), its object fields, and the
/// hierarchy it belongs to. Implemented by the hierarchy store so this crate
/// never needs to know about [`selva_db`]'s node/object representation.
pub trait EvalContext {
    /// The node occupying the given register, if any.
    fn register_node(&self, idx: u8) -> Option<NodeId>;

    /// A field's value on the given node, resolved through the layered
    /// lookup path (dot notation, wildcard segments are not expanded here —
    /// callers resolve wildcards before invoking the evaluator).
    fn field(&self, node: NodeId, field: &str) -> Option<Value>;
}
