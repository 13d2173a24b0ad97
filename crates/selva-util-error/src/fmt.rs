//! Compact, single-line rendering of an error's full `source()` chain, for
//! log lines where the multi-line `{:?}` / `Report` output is too noisy.

use std::fmt;

/// Blanket-implemented for any `std::error::Error`; `fmt_compact()` returns
/// a `Display` that prints this error followed by `: {source}` for every
/// link in the chain.
pub trait FmtCompact: std::error::Error {
    fn fmt_compact(&self) -> FmtCompactDisplay<'_, Self>
    where
        Self: Sized,
    {
        FmtCompactDisplay(self)
    }
}

impl<E: std::error::Error> FmtCompact for E {}

pub struct FmtCompactDisplay<'a, E>(&'a E);

impl<E: std::error::Error> fmt::Display for FmtCompactDisplay<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(display("outer"))]
    struct Outer {
        source: Inner,
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("inner"))]
    struct Inner;

    #[test]
    fn chains_every_source() {
        let err = Outer { source: Inner };
        assert_eq!(err.fmt_compact().to_string(), "outer: inner");
    }
}
