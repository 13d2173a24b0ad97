use snafu::{Location, Snafu};

use selva_core::NodeId;

/// Core-layer error taxonomy (§7). Namespaced by the subsystem that raised
/// it; the command-dispatch collaborator is expected to map these onto its
/// own wire-level error codes rather than forward them verbatim.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DbError {
    // -- Generic --
    #[snafu(display("invalid argument: {msg}"))]
    InvalidArgument {
        msg: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("operation not supported: {msg}"))]
    NotSupported {
        msg: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("name too long"))]
    NameTooLong {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("value out of range: {msg}"))]
    Range {
        msg: String,
        #[snafu(implicit)]
        location: Location,
    },

    // -- Hierarchy --
    #[snafu(display("node not found: {id}"))]
    NodeNotFound {
        id: NodeId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("edge already exists from {src} to {dst} in field {field}"))]
    EdgeAlreadyExists {
        field: String,
        src: NodeId,
        dst: NodeId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("edge field {field} on {src} rejects destination {dst}: {reason}"))]
    EdgeConstraintViolation {
        field: String,
        src: NodeId,
        dst: NodeId,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("traversal exceeded its maximum depth"))]
    TraversalMaxDepthExceeded {
        #[snafu(implicit)]
        location: Location,
    },

    // -- Subscription --
    #[snafu(display("subscription not found: {id}"))]
    SubscriptionNotFound {
        id: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("subscription already exists: {id}"))]
    SubscriptionAlreadyExists {
        id: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid subscription marker: {msg}"))]
    SubscriptionInvalid {
        msg: String,
        #[snafu(implicit)]
        location: Location,
    },

    // -- Object --
    #[snafu(display("object exceeds the maximum number of keys"))]
    ObjectMaxKeysExceeded {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("wrong type for field {field}: expected {expected}, found {found}"))]
    ObjectWrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
        #[snafu(implicit)]
        location: Location,
    },

    // -- RPN collaborator --
    #[snafu(transparent)]
    Rpn { source: selva_rpn::RpnError },

    // -- Find/query shaping --
    #[snafu(display("incompatible find options: {msg}"))]
    IncompatibleQuery {
        msg: String,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type DbResult<T> = std::result::Result<T, DbError>;
