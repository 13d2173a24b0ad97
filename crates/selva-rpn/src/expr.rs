use crate::token::Token;

/// An opaque, already-validated compiled expression.
///
/// Callers never construct this by hand; it comes out of [`crate::compile`].
/// Equality and hashing are by token stream, which is what makes it usable
/// as (part of) an auto-indexing ICB name: `base64(filter)` encodes this
/// expression's serialized token stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Expr(Vec<TokenKey>);

/// [`Token`] does not derive `Eq`/`Hash` because it carries `f64`; this is
/// a bit-for-bit comparable shadow used only for [`Expr`]'s own derives and
/// its canonical byte encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TokenKey {
    PushNull,
    PushBool(bool),
    PushDoubleBits(u64),
    PushString(String),
    LoadRegister(u8),
    LoadField(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Contains,
    Union,
}

impl From<&Token> for TokenKey {
    fn from(t: &Token) -> Self {
        match t {
            Token::PushNull => TokenKey::PushNull,
            Token::PushBool(b) => TokenKey::PushBool(*b),
            Token::PushDouble(d) => TokenKey::PushDoubleBits(d.to_bits()),
            Token::PushString(s) => TokenKey::PushString(s.clone()),
            Token::LoadRegister(r) => TokenKey::LoadRegister(*r),
            Token::LoadField(f) => TokenKey::LoadField(f.clone()),
            Token::Eq => TokenKey::Eq,
            Token::Ne => TokenKey::Ne,
            Token::Lt => TokenKey::Lt,
            Token::Le => TokenKey::Le,
            Token::Gt => TokenKey::Gt,
            Token::Ge => TokenKey::Ge,
            Token::And => TokenKey::And,
            Token::Or => TokenKey::Or,
            Token::Not => TokenKey::Not,
            Token::Add => TokenKey::Add,
            Token::Sub => TokenKey::Sub,
            Token::Mul => TokenKey::Mul,
            Token::Div => TokenKey::Div,
            Token::Contains => TokenKey::Contains,
            Token::Union => TokenKey::Union,
        }
    }
}

impl TokenKey {
    fn to_token(&self) -> Token {
        match self {
            TokenKey::PushNull => Token::PushNull,
            TokenKey::PushBool(b) => Token::PushBool(*b),
            TokenKey::PushDoubleBits(bits) => Token::PushDouble(f64::from_bits(*bits)),
            TokenKey::PushString(s) => Token::PushString(s.clone()),
            TokenKey::LoadRegister(r) => Token::LoadRegister(*r),
            TokenKey::LoadField(f) => Token::LoadField(f.clone()),
            TokenKey::Eq => Token::Eq,
            TokenKey::Ne => Token::Ne,
            TokenKey::Lt => Token::Lt,
            TokenKey::Le => Token::Le,
            TokenKey::Gt => Token::Gt,
            TokenKey::Ge => Token::Ge,
            TokenKey::And => Token::And,
            TokenKey::Or => Token::Or,
            TokenKey::Not => Token::Not,
            TokenKey::Add => Token::Add,
            TokenKey::Sub => Token::Sub,
            TokenKey::Mul => Token::Mul,
            TokenKey::Div => Token::Div,
            TokenKey::Contains => Token::Contains,
            TokenKey::Union => Token::Union,
        }
    }
}

impl Expr {
    pub(crate) fn from_tokens(tokens: Vec<Token>) -> Self {
        Self(tokens.iter().map(TokenKey::from).collect())
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.0.iter().map(TokenKey::to_token).collect()
    }

    /// A stable byte encoding of the token stream, used by the auto-indexer
    /// to derive an ICB name component (`base64(filter)` in the spec).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for tok in &self.0 {
            let tag: u8 = match tok {
                TokenKey::PushNull => 0,
                TokenKey::PushBool(_) => 1,
                TokenKey::PushDoubleBits(_) => 2,
                TokenKey::PushString(_) => 3,
                TokenKey::LoadRegister(_) => 4,
                TokenKey::LoadField(_) => 5,
                TokenKey::Eq => 6,
                TokenKey::Ne => 7,
                TokenKey::Lt => 8,
                TokenKey::Le => 9,
                TokenKey::Gt => 10,
                TokenKey::Ge => 11,
                TokenKey::And => 12,
                TokenKey::Or => 13,
                TokenKey::Not => 14,
                TokenKey::Add => 15,
                TokenKey::Sub => 16,
                TokenKey::Mul => 17,
                TokenKey::Div => 18,
                TokenKey::Contains => 19,
                TokenKey::Union => 20,
            };
            out.push(tag);
            match tok {
                TokenKey::PushBool(b) => out.push(*b as u8),
                TokenKey::PushDoubleBits(bits) => out.extend_from_slice(&bits.to_le_bytes()),
                TokenKey::PushString(s) | TokenKey::LoadField(s) => {
                    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                TokenKey::LoadRegister(r) => out.push(*r),
                _ => {}
            }
        }
        out
    }
}
