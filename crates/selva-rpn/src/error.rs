use snafu::Snafu;

/// Error taxonomy for the expression evaluator, matching the RPN error
/// kinds of the surrounding command protocol: compilation-time failures are
/// reported separately from evaluation-time ones so a client can tell a
/// malformed filter from one that merely doesn't apply to a given node.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum RpnError {
    #[snafu(display("failed to compile expression: {reason}"))]
    CompilationFailed { reason: String },
    #[snafu(display("illegal operand for operator"))]
    IllegalOperand,
    #[snafu(display("illegal opcode at position {pos}"))]
    IllegalOpcode { pos: usize },
    #[snafu(display("stack underflow evaluating expression"))]
    StackUnderflow,
    #[snafu(display("type mismatch: expected {expected}, got {got}"))]
    TypeMismatch { expected: &'static str, got: &'static str },
    #[snafu(display("register {idx} is out of bounds"))]
    RegisterOob { idx: u8 },
    #[snafu(display("division by zero"))]
    DivideByZero,
}

pub type RpnResult<T> = std::result::Result<T, RpnError>;
