use core::fmt;
use std::str::FromStr;

use snafu::Snafu;

use crate::{array_type_define_public, array_type_impl_zero_default};

/// Width, in bytes, of a [`NodeId`].
pub const NODE_ID_LEN: usize = 10;

/// Width, in bytes, of a [`NodeId`]'s type code prefix.
pub const NODE_TYPE_CODE_LEN: usize = 2;

array_type_define_public!(
    /// A fixed-width node identifier.
    ///
    /// The first [`NODE_TYPE_CODE_LEN`] bytes are the *type code*; the
    /// remainder distinguish nodes of that type. Trailing `NUL` bytes are
    /// padding and are stripped when the id is rendered as a printable
    /// string. Equality and ordering are byte-wise over the full fixed
    /// width, padding included.
    struct NodeId, 10
);
array_type_impl_zero_default!(NodeId);

/// Id of the synthetic root node, always present and always a head.
pub const ROOT_NODE_ID: NodeId = NodeId([b'r', b'o', b'o', b't', 0, 0, 0, 0, 0, 0]);

#[derive(Debug, Snafu)]
pub enum NodeIdParseError {
    #[snafu(display("node id longer than {NODE_ID_LEN} printable bytes"))]
    TooLong,
    #[snafu(display("node id contains a NUL byte before the end"))]
    NotPrintable,
}

impl NodeId {
    /// Build a node id from its type code and a distinguishing suffix,
    /// NUL-padding the remainder.
    pub fn new(
        type_code: [u8; NODE_TYPE_CODE_LEN],
        suffix: &[u8],
    ) -> Result<Self, NodeIdParseError> {
        if NODE_TYPE_CODE_LEN + suffix.len() > NODE_ID_LEN {
            return TooLongSnafu.fail();
        }
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[..NODE_TYPE_CODE_LEN].copy_from_slice(&type_code);
        bytes[NODE_TYPE_CODE_LEN..NODE_TYPE_CODE_LEN + suffix.len()].copy_from_slice(suffix);
        Ok(Self(bytes))
    }

    /// The type code, the first [`NODE_TYPE_CODE_LEN`] bytes.
    pub fn type_code(&self) -> [u8; NODE_TYPE_CODE_LEN] {
        let mut code = [0u8; NODE_TYPE_CODE_LEN];
        code.copy_from_slice(&self.0[..NODE_TYPE_CODE_LEN]);
        code
    }

    /// The id with trailing `NUL` padding stripped.
    pub fn printable_bytes(&self) -> &[u8] {
        let end = self
            .0
            .iter()
            .rposition(|&b| b != 0)
            .map(|pos| pos + 1)
            .unwrap_or(0);
        &self.0[..end]
    }

    /// Length of the id once padding is stripped.
    pub fn printable_len(&self) -> usize {
        self.printable_bytes().len()
    }

    pub fn is_root(&self) -> bool {
        *self == ROOT_NODE_ID
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.printable_bytes() {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() > NODE_ID_LEN {
            return TooLongSnafu.fail();
        }
        if bytes.iter().any(|&b| b == 0) {
            return NotPrintableSnafu.fail();
        }
        let mut out = [0u8; NODE_ID_LEN];
        out[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(out))
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        s.parse().expect("node id must fit in the fixed width")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_round_trip() {
        let id: NodeId = "root".parse().unwrap();
        assert_eq!(id.printable_bytes(), b"root");
        assert_eq!(id.to_string(), "root");
        assert!(id.is_root());
    }

    #[test]
    fn equality_is_byte_wise() {
        let a: NodeId = "grphnode_1".parse().unwrap();
        let b: NodeId = "grphnode_1".parse().unwrap();
        assert_eq!(a, b);
        let c: NodeId = "grphnode_2".parse().unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn too_long_is_rejected() {
        assert!("01234567890".parse::<NodeId>().is_err());
    }

    #[test]
    fn type_code_is_leading_bytes() {
        let id = NodeId::new(*b"ma", b"1").unwrap();
        assert_eq!(id.type_code(), *b"ma");
        assert_eq!(id.to_string(), "ma1");
    }
}
